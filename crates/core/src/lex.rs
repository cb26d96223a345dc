//! Tokenizer for script source.
//!
//! Produces a flat [`TokenBuffer`]. Whitespace and `#` comments are dropped.
//! A newline outside of brackets ends the statement and is emitted as a `;`
//! punctuation token, so the parser only ever sees explicit separators.
//! Unrecognized input becomes [`TokenKind::Unknown`] tokens; tokenizing
//! never fails.

use crate::token::{TokenBuffer, TokenKind};
use std::iter::Peekable;
use std::str::Chars;

pub const KEYWORDS: &[&str] = &[
    "and", "or", "not", "in", "if", "elsif", "else", "end", "while", "for", "def", "return",
    "break", "continue", "pass", "print", "import", "record", "del", "try", "catch", "throw",
    "const", "True", "False", "None", "Pi",
];

const TWO_CHAR_OPERATORS: &[&str] = &["==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "?="];

const ONE_CHAR_OPERATORS: &str = "+-*/%<>=.";

const PUNCTUATION: &str = "()[]{},:;";

pub fn is_keyword(text: &str) -> bool {
    KEYWORDS.contains(&text)
}

/// Tokenizes `source` into a fresh buffer.
pub fn tokenize(source: &str) -> TokenBuffer {
    let mut buffer = TokenBuffer::new();
    tokenize_into(source, &mut buffer);
    buffer
}

/// Clears `buffer` and fills it with the tokens of `source`.
pub fn tokenize_into(source: &str, buffer: &mut TokenBuffer) {
    buffer.clear();
    ScriptLex::new(source, buffer).run();
}

struct ScriptLex<'s, 'b> {
    chars: Peekable<Chars<'s>>,
    buffer: &'b mut TokenBuffer,
    line: usize,
    depth: usize,
    last_char: Option<char>,
}

impl<'s, 'b> ScriptLex<'s, 'b> {
    fn new(source: &'s str, buffer: &'b mut TokenBuffer) -> Self {
        ScriptLex {
            chars: source.chars().peekable(),
            buffer,
            line: 1,
            depth: 0,
            last_char: None,
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn peek_second(&self) -> Option<char> {
        let mut ahead = self.chars.clone();
        ahead.next();
        ahead.next()
    }

    fn get(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
        }
        self.last_char = Some(c);
        Some(c)
    }

    fn last_kind(&self) -> Option<TokenKind> {
        self.buffer.tokens().last().map(|t| t.kind())
    }

    fn last_text(&self) -> &str {
        match self.buffer.len() {
            0 => "",
            n => self.buffer.text_at(n - 1),
        }
    }

    /// Emits a statement separator unless one would be redundant.
    fn end_statement(&mut self, line: usize) {
        if self.buffer.is_empty()
            || (self.last_kind() == Some(TokenKind::Punctuation) && self.last_text() == ";")
        {
            return;
        }
        self.buffer.push(TokenKind::Punctuation, line, ";");
    }

    /// The previous token ends a value, so `.5` after it is member access.
    fn after_value(&self) -> bool {
        if self.last_char.is_none_or(char::is_whitespace) {
            return false;
        }
        match self.last_kind() {
            Some(TokenKind::Identifier | TokenKind::Number | TokenKind::Text) => true,
            Some(TokenKind::Punctuation) => matches!(self.last_text(), ")" | "]" | "}"),
            Some(TokenKind::Keyword) => {
                matches!(self.last_text(), "True" | "False" | "None" | "Pi")
            }
            _ => false,
        }
    }

    fn run(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                '\n' => {
                    let line = self.line;
                    self.get();
                    if self.depth == 0 {
                        self.end_statement(line);
                    }
                }
                c if c.is_whitespace() => {
                    self.get();
                }
                '#' => self.skip_comment(),
                '\\' => self.line_continuation(),
                '\'' | '"' => self.text_literal(c),
                c if c.is_ascii_digit() => self.number(),
                '.' if self.peek_second().is_some_and(|d| d.is_ascii_digit())
                    && !self.after_value() =>
                {
                    self.number()
                }
                c if c.is_alphabetic() || c == '_' => self.word(),
                _ => self.symbol(c),
            }
        }
        let line = self.line;
        self.end_statement(line);
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.get();
        }
    }

    fn line_continuation(&mut self) {
        let line = self.line;
        self.get();
        let mut ahead = self.chars.clone();
        let mut skip = 0;
        loop {
            match ahead.next() {
                Some(' ' | '\t' | '\r') => skip += 1,
                Some('#') | Some('\n') | None => break,
                Some(_) => {
                    self.buffer.push(TokenKind::Unknown, line, "\\");
                    return;
                }
            }
        }
        for _ in 0..skip {
            self.get();
        }
        self.skip_comment();
        // Swallow the newline without ending the statement.
        if self.peek() == Some('\n') {
            self.get();
        }
    }

    fn word(&mut self) {
        self.buffer.new_token(TokenKind::Identifier, self.line);
        while let Some(c) = self.peek() {
            if !(c.is_alphanumeric() || c == '_') {
                break;
            }
            self.buffer.append_char(c);
            self.get();
        }
        if is_keyword(self.buffer.forming_text()) {
            self.buffer.set_kind(TokenKind::Keyword);
        }
        self.buffer.end_token();
    }

    fn number(&mut self) {
        self.buffer.new_token(TokenKind::Number, self.line);
        if self.peek() == Some('0') && matches!(self.peek_second(), Some('x' | 'X')) {
            self.buffer.append_char('0');
            self.get();
            self.buffer.append_char('x');
            self.get();
            let mut digits = 0;
            while let Some(c) = self.peek() {
                if !c.is_ascii_hexdigit() {
                    break;
                }
                self.buffer.append_char(c);
                self.get();
                digits += 1;
            }
            if digits == 0 {
                self.buffer.set_kind(TokenKind::Unknown);
            }
            self.buffer.end_token();
            return;
        }
        let mut seen_dot = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.buffer.append_char(c);
                self.get();
            } else if c == '.'
                && !seen_dot
                && self.peek_second().is_some_and(|d| d.is_ascii_digit())
            {
                seen_dot = true;
                self.buffer.append_char(c);
                self.get();
            } else if c == 'e' || c == 'E' {
                let mut ahead = self.chars.clone();
                ahead.next();
                let sign = ahead.peek().copied();
                let exponent_ok = match sign {
                    Some('+' | '-') => {
                        ahead.next();
                        ahead.peek().is_some_and(|d| d.is_ascii_digit())
                    }
                    Some(d) => d.is_ascii_digit(),
                    None => false,
                };
                if !exponent_ok {
                    break;
                }
                self.buffer.append_char('e');
                self.get();
                if let Some(s @ ('+' | '-')) = self.peek() {
                    self.buffer.append_char(s);
                    self.get();
                }
                while let Some(d) = self.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    self.buffer.append_char(d);
                    self.get();
                }
                break;
            } else {
                break;
            }
        }
        self.buffer.end_token();
    }

    fn text_literal(&mut self, quote: char) {
        let line = self.line;
        self.get();
        let triple = self.peek() == Some(quote) && self.peek_second() == Some(quote);
        if triple {
            self.get();
            self.get();
        } else if self.peek() == Some(quote) {
            // Empty literal.
            self.get();
            self.buffer.push(TokenKind::Text, line, "");
            return;
        }
        self.buffer.new_token(TokenKind::Text, line);
        loop {
            let Some(c) = self.peek() else {
                self.buffer.set_kind(TokenKind::Unknown);
                break;
            };
            if c == '\n' && !triple {
                self.buffer.set_kind(TokenKind::Unknown);
                break;
            }
            self.get();
            if c == quote {
                if !triple {
                    break;
                }
                if self.peek() == Some(quote) && self.peek_second() == Some(quote) {
                    self.get();
                    self.get();
                    break;
                }
                self.buffer.append_char(c);
                continue;
            }
            if c == '\\' {
                match self.escape() {
                    Some(decoded) => self.buffer.append_char(decoded),
                    None => self.buffer.set_kind(TokenKind::Unknown),
                }
                continue;
            }
            self.buffer.append_char(c);
        }
        self.buffer.end_token();
    }

    fn escape(&mut self) -> Option<char> {
        let c = self.get()?;
        Some(match c {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            '0' => '\0',
            '\\' => '\\',
            '\'' => '\'',
            '"' => '"',
            '\n' => return self.escape_newline(),
            'x' => return self.hex_escape(2),
            'u' => return self.hex_escape(4),
            other => other,
        })
    }

    /// A backslash before a newline inside text joins the lines.
    fn escape_newline(&mut self) -> Option<char> {
        match self.get()? {
            '\\' => self.escape(),
            other => Some(other),
        }
    }

    fn hex_escape(&mut self, digits: usize) -> Option<char> {
        let mut code = 0u32;
        for _ in 0..digits {
            let d = self.peek()?.to_digit(16)?;
            self.get();
            code = code * 16 + d;
        }
        char::from_u32(code)
    }

    fn symbol(&mut self, c: char) {
        let line = self.line;
        if let Some(next) = self.peek_second() {
            let pair: String = [c, next].iter().collect();
            if TWO_CHAR_OPERATORS.contains(&pair.as_str()) {
                self.get();
                self.get();
                self.buffer.push(TokenKind::Operator, line, &pair);
                return;
            }
        }
        self.get();
        let mut text = [0u8; 4];
        let text = c.encode_utf8(&mut text);
        if ONE_CHAR_OPERATORS.contains(c) {
            self.buffer.push(TokenKind::Operator, line, text);
        } else if PUNCTUATION.contains(c) {
            match c {
                '(' | '[' | '{' => self.depth += 1,
                ')' | ']' | '}' => self.depth = self.depth.saturating_sub(1),
                _ => {}
            }
            if c == ';' {
                self.end_statement(line);
            } else {
                self.buffer.push(TokenKind::Punctuation, line, text);
            }
        } else {
            self.buffer.push(TokenKind::Unknown, line, text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(buffer: &TokenBuffer) -> Vec<String> {
        buffer.range().iter_text().map(str::to_string).collect()
    }

    fn kinds(buffer: &TokenBuffer) -> Vec<TokenKind> {
        buffer.tokens().iter().map(|t| t.kind()).collect()
    }

    #[test]
    fn test_statement_separators() {
        let buffer = tokenize("a = 1\n\n\nb = a + 2 # sum\nb");
        assert_eq!(
            texts(&buffer),
            vec!["a", "=", "1", ";", "b", "=", "a", "+", "2", ";", "b", ";"]
        );
        assert_eq!(buffer.tokens()[4].line(), 4);
    }

    #[test]
    fn test_newlines_inside_brackets_continue() {
        let buffer = tokenize("x = [1,\n 2]\ny");
        assert_eq!(
            texts(&buffer),
            vec!["x", "=", "[", "1", ",", "2", "]", ";", "y", ";"]
        );
    }

    #[test]
    fn test_backslash_continuation() {
        let buffer = tokenize("a = 1 + \\\n  2");
        assert_eq!(texts(&buffer), vec!["a", "=", "1", "+", "2", ";"]);
        assert_eq!(buffer.tokens()[4].line(), 2);
    }

    #[test]
    fn test_keywords_and_operators() {
        let buffer = tokenize("if a >= 2 and not b: c += 1");
        assert_eq!(
            kinds(&buffer),
            vec![
                TokenKind::Keyword,
                TokenKind::Identifier,
                TokenKind::Operator,
                TokenKind::Number,
                TokenKind::Keyword,
                TokenKind::Keyword,
                TokenKind::Identifier,
                TokenKind::Punctuation,
                TokenKind::Identifier,
                TokenKind::Operator,
                TokenKind::Number,
                TokenKind::Punctuation,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        let buffer = tokenize("12 1.5 .25 2e3 1.5E-2 0x1F a.b 3.x");
        assert_eq!(
            texts(&buffer),
            vec![
                "12", "1.5", ".25", "2e3", "1.5E-2", "0x1F", "a", ".", "b", "3", ".", "x", ";"
            ]
        );
    }

    #[test]
    fn test_text_literals_and_escapes() {
        let buffer = tokenize(r#"'it\'s' "tab\there" "\x41é" ''"#);
        assert_eq!(texts(&buffer), vec!["it's", "tab\there", "Aé", "", ";"]);
        assert!(kinds(&buffer)[..4].iter().all(|k| *k == TokenKind::Text));
    }

    #[test]
    fn test_triple_quoted_text() {
        let buffer = tokenize("t = '''first\nsecond 'quoted'\n'''\nu");
        assert_eq!(buffer.text_at(2), "first\nsecond 'quoted'\n");
        assert_eq!(buffer.tokens()[2].line(), 1);
        assert_eq!(buffer.tokens()[4].line(), 4);
    }

    #[test]
    fn test_unknown_never_fails() {
        let buffer = tokenize("a = $ 'open\nb ? !");
        let kinds = kinds(&buffer);
        assert_eq!(kinds[2], TokenKind::Unknown);
        assert_eq!(kinds[3], TokenKind::Unknown);
        assert!(kinds.contains(&TokenKind::Unknown));
        assert_eq!(buffer.text_at(3), "open");
    }
}
