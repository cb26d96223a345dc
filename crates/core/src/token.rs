//! Tokens and the pooled buffer that stores their text.
//!
//! Token text lives in fixed-size character pools owned by a [`TokenBuffer`].
//! Pools are append-only; when the token being formed no longer fits, its
//! partial text is moved into a fresh pool so a token never spans two pools.
//! [`TokenBuffer::clear`] drops every pool and bumps the buffer generation,
//! which makes all previously issued tokens detectably stale.

use std::fmt;

/// Byte capacity of one pool.
pub const POOL_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Keyword,
    Identifier,
    Number,
    Text,
    Operator,
    Punctuation,
    Unknown,
}

impl TokenKind {
    pub fn name(self) -> &'static str {
        match self {
            TokenKind::Keyword => "keyword",
            TokenKind::Identifier => "identifier",
            TokenKind::Number => "number",
            TokenKind::Text => "text",
            TokenKind::Operator => "operator",
            TokenKind::Punctuation => "punctuation",
            TokenKind::Unknown => "unknown",
        }
    }
}

/// A view of pooled text plus the source line it came from (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pool: u32,
    begin: u32,
    end: u32,
    kind: TokenKind,
    line: u32,
    generation: u32,
}

impl Token {
    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    pub fn line(&self) -> usize {
        self.line as usize
    }

    pub fn len(&self) -> usize {
        (self.end - self.begin) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }
}

#[derive(Debug, Clone, Copy)]
struct Forming {
    pool: usize,
    begin: usize,
    kind: TokenKind,
    line: u32,
}

#[derive(Debug)]
struct Pool {
    text: String,
    limit: usize,
}

impl Pool {
    fn with_limit(limit: usize) -> Self {
        Pool {
            text: String::with_capacity(limit),
            limit,
        }
    }
}

#[derive(Debug, Default)]
pub struct TokenBuffer {
    pools: Vec<Pool>,
    tokens: Vec<Token>,
    forming: Option<Forming>,
    generation: u32,
}

impl TokenBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Invalidates every token and releases pooled text.
    pub fn clear(&mut self) {
        self.pools.clear();
        self.tokens.clear();
        self.forming = None;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Starts a new token. An unfinished token is discarded.
    pub fn new_token(&mut self, kind: TokenKind, line: usize) {
        if let Some(forming) = self.forming.take() {
            self.pools[forming.pool].text.truncate(forming.begin);
        }
        if self.pools.is_empty() {
            self.pools.push(Pool::with_limit(POOL_SIZE));
        }
        let pool = self.pools.len() - 1;
        self.forming = Some(Forming {
            pool,
            begin: self.pools[pool].text.len(),
            kind,
            line: line as u32,
        });
    }

    pub fn set_kind(&mut self, kind: TokenKind) {
        if let Some(forming) = self.forming.as_mut() {
            forming.kind = kind;
        }
    }

    pub fn is_forming(&self) -> bool {
        self.forming.is_some()
    }

    /// Length in bytes of the token being formed.
    pub fn forming_len(&self) -> usize {
        self.forming
            .map_or(0, |f| self.pools[f.pool].text.len() - f.begin)
    }

    pub fn forming_text(&self) -> &str {
        self.forming
            .and_then(|f| self.pools[f.pool].text.get(f.begin..))
            .unwrap_or("")
    }

    pub fn append_char(&mut self, c: char) {
        let Some(mut forming) = self.forming else {
            return;
        };
        let needed = c.len_utf8();
        let pool = &mut self.pools[forming.pool];
        if pool.text.len() + needed > pool.limit {
            // Move the partial token to a pool large enough to keep growing.
            let partial = pool.text[forming.begin..].to_string();
            pool.text.truncate(forming.begin);
            let mut fresh = Pool::with_limit(POOL_SIZE.max((partial.len() + needed) * 2));
            fresh.text.push_str(&partial);
            self.pools.push(fresh);
            forming.pool = self.pools.len() - 1;
            forming.begin = 0;
            self.forming = Some(forming);
        }
        self.pools[forming.pool].text.push(c);
    }

    pub fn append_str(&mut self, text: &str) {
        for c in text.chars() {
            self.append_char(c);
        }
    }

    /// Completes the forming token. Returns its index.
    pub fn end_token(&mut self) -> Option<usize> {
        let forming = self.forming.take()?;
        let end = self.pools[forming.pool].text.len();
        self.tokens.push(Token {
            pool: forming.pool as u32,
            begin: forming.begin as u32,
            end: end as u32,
            kind: forming.kind,
            line: forming.line,
            generation: self.generation,
        });
        Some(self.tokens.len() - 1)
    }

    /// Adds a complete token in one step.
    pub fn push(&mut self, kind: TokenKind, line: usize, text: &str) -> usize {
        self.new_token(kind, line);
        self.append_str(text);
        // new_token just opened a token, so end_token always yields an index
        self.end_token().unwrap_or(self.tokens.len())
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Token> {
        self.tokens.get(index)
    }

    /// Text of a token, or `None` if it was issued before the last clear.
    pub fn text(&self, token: &Token) -> Option<&str> {
        if token.generation != self.generation {
            return None;
        }
        self.pools
            .get(token.pool as usize)?
            .text
            .get(token.begin as usize..token.end as usize)
    }

    /// Text of the token at `index`, or "" when out of range.
    pub fn text_at(&self, index: usize) -> &str {
        self.tokens
            .get(index)
            .and_then(|t| self.text(t))
            .unwrap_or("")
    }

    pub fn range(&self) -> TokenRange<'_> {
        TokenRange {
            buffer: self,
            start: 0,
            end: self.tokens.len(),
        }
    }
}

impl fmt::Display for TokenBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, token) in self.tokens.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", self.text(token).unwrap_or("?"))?;
        }
        Ok(())
    }
}

/// A half-open window `[start, end)` into a buffer's tokens.
///
/// Positions passed to and returned from range methods are relative to the
/// start of the range.
#[derive(Clone, Copy)]
pub struct TokenRange<'a> {
    buffer: &'a TokenBuffer,
    start: usize,
    end: usize,
}

impl<'a> TokenRange<'a> {
    pub fn buffer(&self) -> &'a TokenBuffer {
        self.buffer
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn token(&self, pos: usize) -> Option<&'a Token> {
        if pos < self.len() {
            self.buffer.get(self.start + pos)
        } else {
            None
        }
    }

    pub fn text(&self, pos: usize) -> &'a str {
        self.token(pos)
            .and_then(|t| self.buffer.text(t))
            .unwrap_or("")
    }

    pub fn kind(&self, pos: usize) -> Option<TokenKind> {
        self.token(pos).map(|t| t.kind())
    }

    pub fn is(&self, pos: usize, text: &str) -> bool {
        self.token(pos).is_some() && self.text(pos) == text
    }

    /// True for a keyword or punctuation/operator token with this text.
    /// Text literals never match.
    pub fn is_symbol(&self, pos: usize, text: &str) -> bool {
        matches!(self.kind(pos), Some(k) if k != TokenKind::Text) && self.text(pos) == text
    }

    pub fn first_text(&self) -> &'a str {
        self.text(0)
    }

    pub fn last_text(&self) -> &'a str {
        if self.is_empty() {
            ""
        } else {
            self.text(self.len() - 1)
        }
    }

    /// Line of the token at `pos`, falling back to the nearest token.
    pub fn line(&self, pos: usize) -> usize {
        if let Some(token) = self.token(pos) {
            return token.line();
        }
        if !self.is_empty() {
            if let Some(token) = self.token(self.len() - 1) {
                return token.line();
            }
        }
        if self.start > 0 {
            if let Some(token) = self.buffer.get(self.start - 1) {
                return token.line();
            }
        }
        1
    }

    pub fn sub(&self, from: usize, to: usize) -> TokenRange<'a> {
        let from = from.min(self.len());
        let to = to.clamp(from, self.len());
        TokenRange {
            buffer: self.buffer,
            start: self.start + from,
            end: self.start + to,
        }
    }

    pub fn starting_from(&self, pos: usize) -> TokenRange<'a> {
        self.sub(pos, self.len())
    }

    pub fn ending_at(&self, pos: usize) -> TokenRange<'a> {
        self.sub(0, pos)
    }

    /// Position of the first symbol token equal to `text` at or after `from`,
    /// ignoring nesting.
    pub fn find(&self, text: &str, from: usize) -> Option<usize> {
        (from..self.len()).find(|&i| self.is_symbol(i, text))
    }

    /// Position of the first `text` at bracket depth zero at or after `from`.
    pub fn find_at_depth_zero(&self, text: &str, from: usize) -> Option<usize> {
        let mut depth = 0usize;
        for i in from..self.len() {
            if depth == 0 && self.is_symbol(i, text) {
                return Some(i);
            }
            if self.kind(i) == Some(TokenKind::Punctuation) {
                match self.text(i) {
                    "(" | "[" | "{" => depth += 1,
                    ")" | "]" | "}" => depth = depth.saturating_sub(1),
                    _ => {}
                }
            }
        }
        None
    }

    /// Position of the bracket closing the one at `open`.
    pub fn closing_bracket(&self, open: usize) -> Option<usize> {
        if self.kind(open) != Some(TokenKind::Punctuation) {
            return None;
        }
        let opener = self.text(open);
        let closer = match opener {
            "(" => ")",
            "[" => "]",
            "{" => "}",
            _ => return None,
        };
        let mut depth = 0usize;
        for i in open..self.len() {
            if self.kind(i) != Some(TokenKind::Punctuation) {
                continue;
            }
            let text = self.text(i);
            if text == opener {
                depth += 1;
            } else if text == closer {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
        }
        None
    }

    /// Position of the bracket opening the one at `close`.
    pub fn opening_bracket(&self, close: usize) -> Option<usize> {
        if self.kind(close) != Some(TokenKind::Punctuation) {
            return None;
        }
        let closer = self.text(close);
        let opener = match closer {
            ")" => "(",
            "]" => "[",
            "}" => "{",
            _ => return None,
        };
        let mut depth = 0usize;
        for i in (0..=close).rev() {
            if self.kind(i) != Some(TokenKind::Punctuation) {
                continue;
            }
            let text = self.text(i);
            if text == closer {
                depth += 1;
            } else if text == opener {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
        }
        None
    }

    /// Splits at every top-level `separator`.
    pub fn split(&self, separator: &str) -> Vec<TokenRange<'a>> {
        let mut parts = Vec::new();
        let mut begin = 0;
        while let Some(at) = self.find_at_depth_zero(separator, begin) {
            parts.push(self.sub(begin, at));
            begin = at + 1;
        }
        parts.push(self.starting_from(begin));
        parts
    }

    pub fn iter_text(&self) -> impl Iterator<Item = &'a str> + '_ {
        (0..self.len()).map(move |i| self.text(i))
    }
}

impl fmt::Display for TokenRange<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.len() {
            if i > 0 {
                write!(f, " ")?;
            }
            match self.kind(i) {
                Some(TokenKind::Text) => write!(f, "{:?}", self.text(i))?,
                _ => write!(f, "{}", self.text(i))?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for TokenRange<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenRange[{}..{}]({})", self.start, self.end, self)
    }
}
