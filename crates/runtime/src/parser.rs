//! Recursive-descent parser for Quill scripts
//!
//! The tokenizer has already turned line ends into `;` separators, so the
//! token buffer is split into statement ranges up front. Block statements
//! (`if`, `while`, `for`, `def`, `try`, and `record` with a scope) either
//! take the rest of their line after a `:` or consume the following
//! statements up to `end`. Nesting of blocks and of expressions is bounded
//! ([`MAX_BLOCK_NESTING`], [`MAX_NESTING`]).
//!
//! Expressions are split at the weakest operator found at bracket depth zero
//! (see [`find_lowest_operator`]); ties go to the rightmost operator, which
//! makes binary operators left-associative. Calls, indexing, array and
//! dictionary literals are recognized by their bracket shape.

use crate::ast::{
    CatchClause, Compound, Expression, FlowKind, Literal, Script, Statement, StatementKind,
};
use crate::builtins::BuiltIn;
use crate::error::{Error, Result, SyntaxErrorKind};
use crate::operator::{AssignOp, Operator};
use crate::value::NumberHint;
use quill_core::{TokenBuffer, TokenKind, TokenRange, tokenize};
use std::sync::Arc;

/// Statements that end a block body.
const CLOSERS: &[&str] = &["end", "elsif", "else", "catch"];

/// Deepest nesting of brackets and operators within one expression.
pub const MAX_NESTING: usize = 256;

/// Deepest nesting of statements with bodies.
pub const MAX_BLOCK_NESTING: usize = 64;

pub struct Parser {
    buffer: TokenBuffer,
    path: String,
}

impl Parser {
    pub fn new(source: &str) -> Self {
        Parser {
            buffer: tokenize(source),
            path: String::new(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn parse(&self) -> Result<Script> {
        let range = self.buffer.range();
        if let Some(pos) = (0..range.len()).find(|&i| range.kind(i) == Some(TokenKind::Unknown)) {
            return Err(Error::syntax(
                SyntaxErrorKind::UnexpectedToken,
                range.line(pos),
                format!("unexpected input '{}'", range.text(pos)),
            ));
        }
        let statements = range.split(";").into_iter().filter(|r| !r.is_empty()).collect();
        let mut state = ParseState {
            statements,
            pos: 0,
            depth: 0,
        };
        let (compound, closer) = state.parse_compound()?;
        if let Some(at) = closer {
            let stray = state.statements[at];
            return Err(unexpected(&stray, 0));
        }
        Ok(Script::new(self.path.clone(), compound))
    }
}

/// Parses `source` into a script with an empty path.
pub fn parse_script(source: &str) -> Result<Script> {
    Parser::new(source).parse()
}

fn syntax(kind: SyntaxErrorKind, line: usize, message: impl Into<String>) -> Error {
    Error::syntax(kind, line, message)
}

fn unexpected(range: &TokenRange<'_>, pos: usize) -> Error {
    syntax(
        SyntaxErrorKind::UnexpectedToken,
        range.line(pos),
        format!("unexpected '{}'", range.text(pos)),
    )
}

fn missing(range: &TokenRange<'_>, pos: usize, what: impl Into<String>) -> Error {
    syntax(SyntaxErrorKind::MissingToken, range.line(pos), what)
}

/// Options for [`ParseState::parse_conditional_compound`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CompoundFlags(u8);

impl CompoundFlags {
    /// Tokens between the keyword and the colon are a condition expression.
    const HAS_CONDITION: CompoundFlags = CompoundFlags(0x1);
    /// Leave the closing statement (`end`, `elsif`, ...) for the caller.
    const STAY_AT_CLOSING_STATEMENT: CompoundFlags = CompoundFlags(0x2);
    /// Tokens between the keyword and the colon belong to the caller.
    const IGNORE_EXTRA_BEFORE_COLON: CompoundFlags = CompoundFlags(0x4);

    fn has(self, flag: CompoundFlags) -> bool {
        self.0 & flag.0 != 0
    }
}

impl std::ops::BitOr for CompoundFlags {
    type Output = CompoundFlags;

    fn bitor(self, rhs: CompoundFlags) -> CompoundFlags {
        CompoundFlags(self.0 | rhs.0)
    }
}

struct CompoundParts<'a> {
    /// Tokens between the keyword and the colon (or the end of the line).
    header: TokenRange<'a>,
    condition: Option<Expression>,
    body: Arc<Compound>,
    /// Body spans following statements rather than the rest of the line.
    block_form: bool,
}

struct ParseState<'a> {
    statements: Vec<TokenRange<'a>>,
    pos: usize,
    /// Bodies currently open.
    depth: usize,
}

impl<'a> ParseState<'a> {
    fn peek(&self) -> Option<TokenRange<'a>> {
        self.statements.get(self.pos).copied()
    }

    fn peek_keyword(&self) -> Option<&'a str> {
        let next = self.peek()?;
        (next.kind(0) == Some(TokenKind::Keyword)).then(|| next.first_text())
    }

    fn last_line(&self) -> usize {
        self.statements
            .last()
            .map_or(1, |range| range.line(range.len().saturating_sub(1)))
    }

    /// Parses statements until the input ends or a closing statement is
    /// reached. Returns the closer's index without consuming it.
    fn parse_compound(&mut self) -> Result<(Compound, Option<usize>)> {
        let mut statements = Vec::new();
        while let Some(range) = self.peek() {
            if range.kind(0) == Some(TokenKind::Keyword) && CLOSERS.contains(&range.first_text()) {
                return Ok((Compound::new(statements), Some(self.pos)));
            }
            self.pos += 1;
            statements.push(self.parse_statement(range, false)?);
        }
        Ok((Compound::new(statements), None))
    }

    /// Consumes a bare `end` statement.
    fn expect_end(&mut self, keyword: &str, opened_at: usize) -> Result<()> {
        match self.peek() {
            Some(range) if range.is_symbol(0, "end") => {
                if range.len() > 1 {
                    return Err(unexpected(&range, 1));
                }
                self.pos += 1;
                Ok(())
            }
            Some(range) => Err(missing(
                &range,
                0,
                format!(
                    "expected 'end' to close '{}' from line {}, found '{}'",
                    keyword,
                    opened_at,
                    range.first_text()
                ),
            )),
            None => Err(syntax(
                SyntaxErrorKind::MissingToken,
                self.last_line(),
                format!("expected 'end' to close '{}' from line {}", keyword, opened_at),
            )),
        }
    }

    fn parse_statement(&mut self, range: TokenRange<'a>, inline: bool) -> Result<Statement> {
        let line = range.line(0);
        let kind = if range.kind(0) == Some(TokenKind::Keyword) {
            match range.first_text() {
                "if" => self.parse_if(range, inline)?,
                "while" => self.parse_while(range, inline)?,
                "for" => self.parse_for(range, inline)?,
                "def" => self.parse_def(range, inline)?,
                "try" => self.parse_try(range, inline)?,
                "print" => StatementKind::Print(parse_list(range.starting_from(1))?),
                "import" => parse_import(range)?,
                "record" => self.parse_record(range, inline)?,
                "del" => parse_delete(range)?,
                "const" => parse_assignment(range.starting_from(1), true)?
                    .ok_or_else(|| missing(&range, 1, "expected '=' after 'const' name"))?,
                keyword => match FlowKind::from_keyword(keyword) {
                    Some(flow) => parse_flow(range, flow)?,
                    None if CLOSERS.contains(&keyword) => return Err(unexpected(&range, 0)),
                    None => parse_simple(range)?,
                },
            }
        } else {
            parse_simple(range)?
        };
        Ok(Statement::new(kind, line))
    }

    /// Shared routine for every statement that carries a body.
    fn parse_conditional_compound(
        &mut self,
        range: TokenRange<'a>,
        flags: CompoundFlags,
        inline: bool,
    ) -> Result<CompoundParts<'a>> {
        if self.depth >= MAX_BLOCK_NESTING {
            return Err(syntax(
                SyntaxErrorKind::General,
                range.line(0),
                "blocks nested too deeply",
            ));
        }
        self.depth += 1;
        let parts = self.compound_parts(range, flags, inline);
        self.depth -= 1;
        parts
    }

    fn compound_parts(
        &mut self,
        range: TokenRange<'a>,
        flags: CompoundFlags,
        inline: bool,
    ) -> Result<CompoundParts<'a>> {
        let keyword = range.first_text();
        let line = range.line(0);
        let colon = range.find_at_depth_zero(":", 1);
        let header = range.sub(1, colon.unwrap_or(range.len()));

        let condition = if flags.has(CompoundFlags::HAS_CONDITION) {
            if header.is_empty() {
                return Err(missing(
                    &range,
                    0,
                    format!("expected a condition after '{}'", keyword),
                ));
            }
            Some(parse_expression(header)?)
        } else {
            if !header.is_empty() && !flags.has(CompoundFlags::IGNORE_EXTRA_BEFORE_COLON) {
                return Err(match colon {
                    None => syntax(
                        SyntaxErrorKind::MissingColon,
                        line,
                        format!("expected ':' after '{}'", keyword),
                    ),
                    Some(_) => unexpected(&range, 1),
                });
            }
            None
        };

        if let Some(at) = colon {
            let rest = range.starting_from(at + 1);
            if !rest.is_empty() {
                let statement = self.parse_statement(rest, true)?;
                return Ok(CompoundParts {
                    header,
                    condition,
                    body: Arc::new(Compound::new(vec![statement])),
                    block_form: false,
                });
            }
        }
        if inline {
            return Err(syntax(
                SyntaxErrorKind::MissingColon,
                line,
                format!("'{}' inside a single-line body needs ':' and a statement", keyword),
            ));
        }

        let (body, closer) = self.parse_compound()?;
        if closer.is_none() {
            return Err(syntax(
                SyntaxErrorKind::MissingToken,
                self.last_line(),
                format!("expected 'end' to close '{}' from line {}", keyword, line),
            ));
        }
        if !flags.has(CompoundFlags::STAY_AT_CLOSING_STATEMENT) {
            self.expect_end(keyword, line)?;
        }
        Ok(CompoundParts {
            header,
            condition,
            body: Arc::new(body),
            block_form: true,
        })
    }

    fn parse_if(&mut self, range: TokenRange<'a>, inline: bool) -> Result<StatementKind> {
        let flags = CompoundFlags::HAS_CONDITION | CompoundFlags::STAY_AT_CLOSING_STATEMENT;
        let first = self.parse_conditional_compound(range, flags, inline)?;
        let mut needs_end = first.block_form;
        let mut branches = vec![(first.condition.unwrap_or(Expression::Constant(Literal::None)), first.body)];
        let mut otherwise = None;
        while !inline {
            match self.peek_keyword() {
                Some("elsif") => {
                    let Some(next) = self.peek() else { break };
                    self.pos += 1;
                    let parts = self.parse_conditional_compound(next, flags, false)?;
                    needs_end |= parts.block_form;
                    if let Some(condition) = parts.condition {
                        branches.push((condition, parts.body));
                    }
                }
                Some("else") => {
                    let Some(next) = self.peek() else { break };
                    self.pos += 1;
                    let parts = self.parse_conditional_compound(
                        next,
                        CompoundFlags::STAY_AT_CLOSING_STATEMENT,
                        false,
                    )?;
                    needs_end |= parts.block_form;
                    otherwise = Some(parts.body);
                    break;
                }
                _ => break,
            }
        }
        if needs_end {
            self.expect_end("if", range.line(0))?;
        }
        Ok(StatementKind::If {
            branches,
            otherwise,
        })
    }

    fn parse_while(&mut self, range: TokenRange<'a>, inline: bool) -> Result<StatementKind> {
        let parts = self.parse_conditional_compound(range, CompoundFlags::HAS_CONDITION, inline)?;
        Ok(StatementKind::While {
            condition: parts.condition.unwrap_or(Expression::Constant(Literal::None)),
            body: parts.body,
        })
    }

    fn parse_for(&mut self, range: TokenRange<'a>, inline: bool) -> Result<StatementKind> {
        let parts =
            self.parse_conditional_compound(range, CompoundFlags::IGNORE_EXTRA_BEFORE_COLON, inline)?;
        let header = parts.header;
        if header.kind(0) != Some(TokenKind::Identifier) {
            return Err(missing(&range, 1, "expected a variable name after 'for'"));
        }
        if !header.is_symbol(1, "in") {
            return Err(missing(&header, 1, "expected 'in' after the loop variable"));
        }
        Ok(StatementKind::For {
            variable: header.first_text().to_string(),
            iterable: parse_expression(header.starting_from(2))?,
            body: parts.body,
        })
    }

    fn parse_def(&mut self, range: TokenRange<'a>, inline: bool) -> Result<StatementKind> {
        let parts =
            self.parse_conditional_compound(range, CompoundFlags::IGNORE_EXTRA_BEFORE_COLON, inline)?;
        let header = parts.header;
        if header.kind(0) != Some(TokenKind::Identifier) {
            return Err(missing(&range, 1, "expected a function name after 'def'"));
        }
        let name = header.first_text().to_string();
        let (params, defaults) = if header.len() == 1 {
            (Vec::new(), Vec::new())
        } else {
            if !header.is_symbol(1, "(") {
                return Err(unexpected(&header, 1));
            }
            let close = header
                .closing_bracket(1)
                .ok_or_else(|| missing(&header, 1, "expected ')' to close the parameter list"))?;
            if close + 1 != header.len() {
                return Err(unexpected(&header, close + 1));
            }
            parse_parameters(header.sub(2, close))?
        };
        Ok(StatementKind::Function {
            name,
            params,
            defaults,
            body: parts.body,
        })
    }

    /// `record a, b` declares subrecords; `record Name(Bases)` or
    /// `record Name:` opens a scope with a body.
    fn parse_record(&mut self, range: TokenRange<'a>, inline: bool) -> Result<StatementKind> {
        if !range.is_symbol(2, "(") && !range.is_symbol(2, ":") {
            return Ok(StatementKind::Declare(parse_names(range.starting_from(1), "record")?));
        }
        let parts =
            self.parse_conditional_compound(range, CompoundFlags::IGNORE_EXTRA_BEFORE_COLON, inline)?;
        let header = parts.header;
        if header.kind(0) != Some(TokenKind::Identifier) {
            return Err(missing(&range, 1, "expected a record name after 'record'"));
        }
        let bases = if header.len() == 1 {
            Vec::new()
        } else {
            let close = header
                .closing_bracket(1)
                .ok_or_else(|| missing(&header, 1, "expected ')' to close the super records"))?;
            if close + 1 != header.len() {
                return Err(unexpected(&header, close + 1));
            }
            parse_list(header.sub(2, close))?
        };
        Ok(StatementKind::Scope {
            name: header.first_text().to_string(),
            bases,
            body: parts.body,
        })
    }

    fn parse_try(&mut self, range: TokenRange<'a>, inline: bool) -> Result<StatementKind> {
        if inline {
            return Err(syntax(
                SyntaxErrorKind::General,
                range.line(0),
                "'try' cannot be used inside a single-line body",
            ));
        }
        let parts =
            self.parse_conditional_compound(range, CompoundFlags::STAY_AT_CLOSING_STATEMENT, false)?;
        let mut needs_end = parts.block_form;
        let mut catches = Vec::new();
        while self.peek_keyword() == Some("catch") {
            let Some(next) = self.peek() else { break };
            self.pos += 1;
            let clause = self.parse_conditional_compound(
                next,
                CompoundFlags::STAY_AT_CLOSING_STATEMENT | CompoundFlags::IGNORE_EXTRA_BEFORE_COLON,
                false,
            )?;
            needs_end |= clause.block_form;
            let (error_name, variable) = parse_catch_header(clause.header)?;
            catches.push(CatchClause {
                error_name,
                variable,
                body: clause.body,
            });
        }
        if catches.is_empty() {
            let line = self.peek().map_or(self.last_line(), |r| r.line(0));
            return Err(syntax(
                SyntaxErrorKind::MissingToken,
                line,
                format!("expected 'catch' after 'try' from line {}", range.line(0)),
            ));
        }
        if needs_end {
            self.expect_end("try", range.line(0))?;
        }
        Ok(StatementKind::Try {
            body: parts.body,
            catches,
        })
    }
}

fn parse_catch_header(header: TokenRange<'_>) -> Result<(Option<String>, Option<String>)> {
    if header.is_empty() {
        return Ok((None, None));
    }
    let parts = header.split(",");
    let single_name = |part: &TokenRange<'_>| -> Result<String> {
        if part.len() == 1 && part.kind(0) == Some(TokenKind::Identifier) {
            Ok(part.first_text().to_string())
        } else if part.is_empty() {
            Err(missing(&header, 0, "expected a name in 'catch'"))
        } else {
            Err(unexpected(part, part.len().min(1)))
        }
    };
    match parts.as_slice() {
        [name] => Ok((Some(single_name(name)?), None)),
        [name, var] => Ok((Some(single_name(name)?), Some(single_name(var)?))),
        _ => Err(unexpected(&header, header.len() - 1)),
    }
}

fn parse_parameters(range: TokenRange<'_>) -> Result<(Vec<String>, Vec<(String, Expression)>)> {
    let mut params = Vec::new();
    let mut defaults = Vec::new();
    if range.is_empty() {
        return Ok((params, defaults));
    }
    for part in range.split(",") {
        if part.kind(0) != Some(TokenKind::Identifier) {
            return Err(missing(&range, 0, "expected a parameter name"));
        }
        let name = part.first_text().to_string();
        if params.contains(&name) {
            return Err(syntax(
                SyntaxErrorKind::General,
                part.line(0),
                format!("duplicate parameter '{}'", name),
            ));
        }
        if part.len() > 1 {
            if !part.is_symbol(1, "=") {
                return Err(unexpected(&part, 1));
            }
            defaults.push((name.clone(), parse_expression(part.starting_from(2))?));
        } else if !defaults.is_empty() {
            return Err(syntax(
                SyntaxErrorKind::General,
                part.line(0),
                format!("parameter '{}' without a default follows one with a default", name),
            ));
        }
        params.push(name);
    }
    Ok((params, defaults))
}

fn parse_names(range: TokenRange<'_>, keyword: &str) -> Result<Vec<String>> {
    if range.is_empty() {
        return Err(missing(&range, 0, format!("expected a name after '{}'", keyword)));
    }
    range
        .split(",")
        .into_iter()
        .map(|part| {
            if part.len() == 1 && part.kind(0) == Some(TokenKind::Identifier) {
                Ok(part.first_text().to_string())
            } else if part.is_empty() {
                Err(missing(&range, 0, format!("expected a name after '{}'", keyword)))
            } else {
                Err(unexpected(&part, if part.len() > 1 { 1 } else { 0 }))
            }
        })
        .collect()
}

fn parse_import(range: TokenRange<'_>) -> Result<StatementKind> {
    let by_value = range.is_symbol(1, "record");
    let names = parse_names(range.starting_from(if by_value { 2 } else { 1 }), "import")?;
    Ok(StatementKind::Import { names, by_value })
}

fn parse_delete(range: TokenRange<'_>) -> Result<StatementKind> {
    let targets = parse_list(range.starting_from(1))?;
    if targets.is_empty() {
        return Err(missing(&range, 0, "expected a name after 'del'"));
    }
    if let Some(bad) = targets.iter().find(|t| !t.is_assignable()) {
        return Err(syntax(
            SyntaxErrorKind::General,
            range.line(0),
            format!("cannot delete '{}'", bad),
        ));
    }
    Ok(StatementKind::Delete(targets))
}

fn parse_flow(range: TokenRange<'_>, flow: FlowKind) -> Result<StatementKind> {
    let rest = range.starting_from(1);
    match flow {
        FlowKind::Return | FlowKind::Throw => {
            let value = if rest.is_empty() {
                None
            } else {
                Some(parse_expression(rest)?)
            };
            Ok(StatementKind::Flow(flow, value))
        }
        _ if !rest.is_empty() => Err(unexpected(&range, 1)),
        _ => Ok(StatementKind::Flow(flow, None)),
    }
}

/// Assignment or bare expression.
fn parse_simple(range: TokenRange<'_>) -> Result<StatementKind> {
    match parse_assignment(range, false)? {
        Some(assign) => Ok(assign),
        None => Ok(StatementKind::Expression(parse_expression(range)?)),
    }
}

fn find_assign_op(range: TokenRange<'_>) -> Option<(usize, AssignOp)> {
    let mut depth = 0usize;
    for i in 0..range.len() {
        match range.kind(i) {
            Some(TokenKind::Punctuation) => match range.text(i) {
                "(" | "[" | "{" => depth += 1,
                ")" | "]" | "}" => depth = depth.saturating_sub(1),
                _ => {}
            },
            Some(TokenKind::Operator) if depth == 0 => {
                if let Some(op) = AssignOp::from_text(range.text(i)) {
                    return Some((i, op));
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_assignment(range: TokenRange<'_>, read_only: bool) -> Result<Option<StatementKind>> {
    let Some((at, op)) = find_assign_op(range) else {
        return Ok(None);
    };
    if at == 0 {
        return Err(missing(
            &range,
            0,
            format!("expected a target before '{}'", op.as_str()),
        ));
    }
    let value_range = range.starting_from(at + 1);
    if value_range.is_empty() {
        return Err(missing(
            &range,
            at,
            format!("expected a value after '{}'", op.as_str()),
        ));
    }
    let target = parse_expression(range.ending_at(at))?;
    if !target.is_assignable() {
        return Err(syntax(
            SyntaxErrorKind::General,
            range.line(0),
            format!("cannot assign to '{}'", target),
        ));
    }
    if read_only && (op != AssignOp::Set || !matches!(target, Expression::Name(_))) {
        return Err(syntax(
            SyntaxErrorKind::General,
            range.line(0),
            "'const' needs the form 'const name = value'",
        ));
    }
    Ok(Some(StatementKind::Assign {
        target,
        op,
        value: parse_expression(value_range)?,
        read_only,
    }))
}

/// The token ends an operand, so an operator after it is binary.
fn ends_value(range: &TokenRange<'_>, pos: usize) -> bool {
    match range.kind(pos) {
        Some(TokenKind::Identifier | TokenKind::Number | TokenKind::Text) => true,
        Some(TokenKind::Keyword) => matches!(range.text(pos), "True" | "False" | "None" | "Pi"),
        Some(TokenKind::Punctuation) => matches!(range.text(pos), ")" | "]" | "}"),
        _ => false,
    }
}

/// Finds the operator with the weakest binding at bracket depth zero.
///
/// Returns its position, the operator, and whether it is used as a prefix.
/// Prefix operators only count at the start of the range; elsewhere they
/// belong to the operand on their right.
pub fn find_lowest_operator(range: TokenRange<'_>) -> Result<Option<(usize, Operator, bool)>> {
    let mut best: Option<(usize, Operator, bool, usize)> = None;
    let mut depth = 0usize;
    for i in 0..range.len() {
        let kind = range.kind(i);
        if kind == Some(TokenKind::Punctuation) {
            match range.text(i) {
                "(" | "[" | "{" => depth += 1,
                ")" | "]" | "}" => depth = depth.saturating_sub(1),
                _ => {}
            }
            continue;
        }
        if depth > 0 || !matches!(kind, Some(TokenKind::Operator | TokenKind::Keyword)) {
            continue;
        }
        let Some(op) = Operator::from_text(range.text(i)) else {
            continue;
        };
        let prefix = i == 0 || !ends_value(&range, i - 1);
        let level = if prefix {
            if i > 0 {
                if op.is_unary_capable() {
                    continue;
                }
                return Err(missing(
                    &range,
                    i,
                    format!("expected an operand before '{}'", op),
                ));
            }
            op.unary_level().ok_or_else(|| {
                missing(&range, i, format!("expected an operand before '{}'", op))
            })?
        } else {
            op.binary_level().ok_or_else(|| unexpected(&range, i))?
        };
        // Ties go right so that `a - b - c` splits as `(a - b) - c`.
        if best.is_none_or(|(_, _, _, lowest)| level <= lowest) {
            best = Some((i, op, prefix, level));
        }
    }
    Ok(best.map(|(pos, op, prefix, _)| (pos, op, prefix)))
}

pub fn parse_expression(range: TokenRange<'_>) -> Result<Expression> {
    expression_at(range, 0)
}

/// Parses an expression found `depth` levels inside another one.
fn expression_at(range: TokenRange<'_>, depth: usize) -> Result<Expression> {
    if range.is_empty() {
        return Err(missing(&range, 0, "expected an expression"));
    }
    if depth > MAX_NESTING {
        return Err(syntax(
            SyntaxErrorKind::General,
            range.line(0),
            "expression nested too deeply",
        ));
    }
    let inner = depth + 1;
    if let Some((pos, op, prefix)) = find_lowest_operator(range)? {
        if prefix {
            let operand = range.starting_from(1);
            if operand.is_empty() {
                return Err(missing(&range, 0, format!("expected an operand after '{}'", op)));
            }
            return Ok(Expression::Unary {
                op,
                operand: Box::new(expression_at(operand, inner)?),
            });
        }
        let rhs = range.starting_from(pos + 1);
        if rhs.is_empty() {
            return Err(missing(
                &range,
                pos,
                format!("expected an operand after '{}'", op),
            ));
        }
        return Ok(Expression::binary(
            op,
            expression_at(range.ending_at(pos), inner)?,
            expression_at(rhs, inner)?,
        ));
    }
    parse_primary(range, inner)
}

/// Literals, names and bracketed forms. Sub-expressions are parsed at
/// `depth`.
fn parse_primary(range: TokenRange<'_>, depth: usize) -> Result<Expression> {
    let len = range.len();
    if len == 1 {
        return parse_single(range);
    }
    let last = len - 1;
    if range.kind(last) == Some(TokenKind::Punctuation) && matches!(range.text(last), ")" | "]" | "}")
    {
        let open = range
            .opening_bracket(last)
            .ok_or_else(|| unexpected(&range, last))?;
        let inner = range.sub(open + 1, last);
        if open == 0 {
            return match range.text(0) {
                "(" => {
                    if let Some(comma) = inner.find_at_depth_zero(",", 0) {
                        return Err(unexpected(&inner, comma));
                    }
                    expression_at(inner, depth)
                }
                "[" => Ok(Expression::Array(list_at(inner, depth)?)),
                _ => Ok(Expression::Dictionary(parse_dictionary(inner, depth)?)),
            };
        }
        let prefix = range.ending_at(open);
        match range.text(open) {
            "(" => return parse_call(prefix, inner, depth),
            "[" => {
                let target = Box::new(expression_at(prefix, depth)?);
                return match inner.find_at_depth_zero(":", 0) {
                    Some(colon) => {
                        let bound = |r: TokenRange<'_>| -> Result<Option<Box<Expression>>> {
                            if r.is_empty() {
                                Ok(None)
                            } else {
                                Ok(Some(Box::new(expression_at(r, depth)?)))
                            }
                        };
                        Ok(Expression::Slice {
                            target,
                            start: bound(inner.ending_at(colon))?,
                            end: bound(inner.starting_from(colon + 1))?,
                        })
                    }
                    None => {
                        if inner.is_empty() {
                            return Err(missing(&range, open, "expected an index inside '[]'"));
                        }
                        Ok(Expression::Index {
                            target,
                            index: Box::new(expression_at(inner, depth)?),
                        })
                    }
                };
            }
            _ => return Err(unexpected(&range, open)),
        }
    }
    if len >= 3 && range.kind(last - 1) == Some(TokenKind::Operator) && range.text(last - 1) == "."
    {
        if range.kind(last) != Some(TokenKind::Identifier) {
            return Err(unexpected(&range, last));
        }
        return Ok(Expression::Member {
            target: Box::new(expression_at(range.ending_at(last - 1), depth)?),
            name: range.text(last).to_string(),
        });
    }
    if range.kind(0) == Some(TokenKind::Operator) && range.text(0) == "." {
        return Err(missing(&range, 0, "expected an expression before '.'"));
    }
    Err(unexpected(&range, 1))
}

fn parse_single(range: TokenRange<'_>) -> Result<Expression> {
    let text = range.text(0);
    match range.kind(0) {
        Some(TokenKind::Number) => parse_number_literal(text)
            .map(Expression::Constant)
            .ok_or_else(|| {
                syntax(
                    SyntaxErrorKind::General,
                    range.line(0),
                    format!("invalid number '{}'", text),
                )
            }),
        Some(TokenKind::Text) => Ok(Expression::text(text)),
        Some(TokenKind::Identifier) => Ok(Expression::name(text)),
        Some(TokenKind::Keyword) => match text {
            "True" => Ok(Expression::Constant(Literal::Number(1.0, NumberHint::Boolean))),
            "False" => Ok(Expression::Constant(Literal::Number(0.0, NumberHint::Boolean))),
            "None" => Ok(Expression::Constant(Literal::None)),
            "Pi" => Ok(Expression::number(std::f64::consts::PI)),
            _ => Err(unexpected(&range, 0)),
        },
        _ => Err(unexpected(&range, 0)),
    }
}

fn parse_number_literal(text: &str) -> Option<Literal> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        let value = u64::from_str_radix(hex, 16).ok()?;
        return Some(Literal::Number(value as f64, NumberHint::Hex));
    }
    let value = text.parse::<f64>().ok()?;
    Some(Literal::Number(value, NumberHint::Plain))
}

fn parse_call(prefix: TokenRange<'_>, inner: TokenRange<'_>, depth: usize) -> Result<Expression> {
    let (args, keywords) = parse_arguments(inner, depth)?;
    if prefix.len() == 1 && prefix.kind(0) == Some(TokenKind::Identifier) {
        if let Some(kind) = BuiltIn::from_name(prefix.first_text()) {
            if !keywords.is_empty() {
                return Err(syntax(
                    SyntaxErrorKind::General,
                    prefix.line(0),
                    format!("'{}' does not take keyword arguments", kind.name()),
                ));
            }
            return Ok(Expression::BuiltIn { kind, args });
        }
    }
    Ok(Expression::Call {
        callee: Box::new(expression_at(prefix, depth)?),
        args,
        keywords,
    })
}

type Arguments = (Vec<Expression>, Vec<(String, Expression)>);

fn parse_arguments(range: TokenRange<'_>, depth: usize) -> Result<Arguments> {
    let mut args = Vec::new();
    let mut keywords: Vec<(String, Expression)> = Vec::new();
    for part in list_items(range)? {
        let is_keyword = part.len() >= 2
            && part.kind(0) == Some(TokenKind::Identifier)
            && part.kind(1) == Some(TokenKind::Operator)
            && part.text(1) == "=";
        if is_keyword {
            let name = part.first_text().to_string();
            if keywords.iter().any(|(n, _)| *n == name) {
                return Err(syntax(
                    SyntaxErrorKind::General,
                    part.line(0),
                    format!("keyword argument '{}' given twice", name),
                ));
            }
            keywords.push((name, expression_at(part.starting_from(2), depth)?));
        } else {
            if !keywords.is_empty() {
                return Err(syntax(
                    SyntaxErrorKind::General,
                    part.line(0),
                    "positional argument follows keyword argument",
                ));
            }
            args.push(expression_at(part, depth)?);
        }
    }
    Ok((args, keywords))
}

/// Comma-separated items; a single trailing comma is allowed.
fn list_items(range: TokenRange<'_>) -> Result<Vec<TokenRange<'_>>> {
    if range.is_empty() {
        return Ok(Vec::new());
    }
    let mut parts = range.split(",");
    if parts.len() > 1 && parts.last().is_some_and(|p| p.is_empty()) {
        parts.pop();
    }
    if parts.iter().any(|p| p.is_empty()) {
        return Err(missing(&range, 0, "expected an expression before ','"));
    }
    Ok(parts)
}

pub fn parse_list(range: TokenRange<'_>) -> Result<Vec<Expression>> {
    list_at(range, 0)
}

fn list_at(range: TokenRange<'_>, depth: usize) -> Result<Vec<Expression>> {
    list_items(range)?
        .into_iter()
        .map(|item| expression_at(item, depth))
        .collect()
}

fn parse_dictionary(range: TokenRange<'_>, depth: usize) -> Result<Vec<(Expression, Expression)>> {
    list_items(range)?
        .into_iter()
        .map(|entry| {
            let colon = entry.find_at_depth_zero(":", 0).ok_or_else(|| {
                syntax(
                    SyntaxErrorKind::MissingColon,
                    entry.line(0),
                    "expected ':' between dictionary key and value",
                )
            })?;
            let value = entry.starting_from(colon + 1);
            if colon == 0 || value.is_empty() {
                return Err(missing(&entry, colon, "expected key and value around ':'"));
            }
            Ok((
                expression_at(entry.ending_at(colon), depth)?,
                expression_at(value, depth)?,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Script {
        parse_script(source).unwrap()
    }

    fn expr(source: &str) -> Expression {
        let script = parse(source);
        match &script.compound().statements()[0].kind {
            StatementKind::Expression(e) => e.clone(),
            other => panic!("expected an expression statement, got {:?}", other),
        }
    }

    fn syntax_kind(source: &str) -> (SyntaxErrorKind, usize) {
        match parse_script(source) {
            Err(Error::Syntax { kind, line, .. }) => (kind, line),
            other => panic!("expected a syntax error, got {:?}", other),
        }
    }

    #[test]
    fn test_lowest_operator_split() {
        let buffer = tokenize("1 + 2 * 3");
        let range = buffer.range().split(";")[0];
        assert_eq!(find_lowest_operator(range).unwrap(), Some((1, Operator::Plus, false)));

        let buffer = tokenize("(1 + 2) * 3");
        let range = buffer.range().split(";")[0];
        assert_eq!(
            find_lowest_operator(range).unwrap(),
            Some((5, Operator::Multiply, false))
        );
    }

    #[test]
    fn test_precedence_and_associativity() {
        assert_eq!(expr("1 + 2 * 3").to_string(), "(1 + (2 * 3))");
        assert_eq!(expr("1 - 2 - 3").to_string(), "((1 - 2) - 3)");
        assert_eq!(expr("-a * b").to_string(), "((-a) * b)");
        assert_eq!(expr("a - -b").to_string(), "(a - (-b))");
        assert_eq!(expr("not a == b and c").to_string(), "((not (a == b)) and c)");
        assert_eq!(expr("a or b and c").to_string(), "(a or (b and c))");
        assert_eq!(expr("x in [1, 2] == True").to_string(), "((x in [1, 2]) == True)");
    }

    #[test]
    fn test_postfix_forms() {
        assert_eq!(expr("a.b.c(1, k=2)[0]").to_string(), "a.b.c(1, k=2)[0]");
        assert_eq!(expr("s[1:]").to_string(), "s[1:]");
        assert_eq!(expr("s[:-1]").to_string(), "s[:(-1)]");
        assert_eq!(expr("-f(x).y").to_string(), "(-f(x).y)");
        assert!(matches!(expr("len(x)"), Expression::BuiltIn { kind: BuiltIn::Len, .. }));
        assert!(matches!(expr("f(x)"), Expression::Call { .. }));
    }

    #[test]
    fn test_literals() {
        assert_eq!(expr("{'a': [1, 2], 'b': {}}").to_string(), "{'a': [1, 2], 'b': {}}");
        assert_eq!(
            expr("0x1F"),
            Expression::Constant(Literal::Number(31.0, NumberHint::Hex))
        );
        assert_eq!(expr("[1, 2,]").to_string(), "[1, 2]");
        assert_eq!(expr("True").to_string(), "True");
    }

    #[test]
    fn test_block_statements() {
        let script = parse(
            "if a\n  x = 1\nelsif b: x = 2\nelse\n  x = 3\nend\nwhile x < 10: x += 1\n",
        );
        let statements = script.compound().statements();
        assert_eq!(statements.len(), 2);
        match &statements[0].kind {
            StatementKind::If {
                branches,
                otherwise,
            } => {
                assert_eq!(branches.len(), 2);
                assert!(otherwise.is_some());
            }
            other => panic!("expected if, got {:?}", other),
        }
        assert_eq!(statements[1].line, 7);
    }

    #[test]
    fn test_colon_form_needs_no_end() {
        let script = parse("if a: b = 1\nc = 2");
        assert_eq!(script.compound().len(), 2);
    }

    #[test]
    fn test_def_and_try() {
        let script = parse(
            "def f(a, b=2)\n  return a + b\nend\ntry\n  f()\ncatch WrongArgumentsError, e\n  print e\ncatch\n  pass\nend",
        );
        let statements = script.compound().statements();
        match &statements[0].kind {
            StatementKind::Function {
                name,
                params,
                defaults,
                ..
            } => {
                assert_eq!(name, "f");
                assert_eq!(params, &vec!["a".to_string(), "b".to_string()]);
                assert_eq!(defaults.len(), 1);
            }
            other => panic!("expected def, got {:?}", other),
        }
        match &statements[1].kind {
            StatementKind::Try { catches, .. } => {
                assert_eq!(catches.len(), 2);
                assert_eq!(catches[0].variable.as_deref(), Some("e"));
                assert_eq!(catches[1].error_name, None);
            }
            other => panic!("expected try, got {:?}", other),
        }
    }

    #[test]
    fn test_simple_statements() {
        let script = parse("import record Config, Version\nrecord a, b\ndel a.x, c\nconst K = 1\nn ?= 3\nprint");
        let kinds: Vec<_> = script
            .compound()
            .statements()
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "import record Config, Version\n",
                "record a, b\n",
                "del a.x, c\n",
                "const K = 1\n",
                "n ?= 3\n",
                "print\n"
            ]
        );
    }

    #[test]
    fn test_missing_operand_reports_line() {
        assert_eq!(syntax_kind("if a ==\n"), (SyntaxErrorKind::MissingToken, 1));
        assert_eq!(syntax_kind("x = 1\ny = 2 *\n"), (SyntaxErrorKind::MissingToken, 2));
    }

    #[test]
    fn test_syntax_error_kinds() {
        assert_eq!(syntax_kind("x = 1\nelse\n").0, SyntaxErrorKind::UnexpectedToken);
        assert_eq!(syntax_kind("if a\n b\n").0, SyntaxErrorKind::MissingToken);
        assert_eq!(syntax_kind("if a\nb\nelse c\nend").0, SyntaxErrorKind::MissingColon);
        assert_eq!(syntax_kind("{'a' 1}").0, SyntaxErrorKind::MissingColon);
        assert_eq!(syntax_kind("a b").0, SyntaxErrorKind::UnexpectedToken);
        assert_eq!(syntax_kind("x = $").0, SyntaxErrorKind::UnexpectedToken);
        assert_eq!(syntax_kind("1 = 2").0, SyntaxErrorKind::General);
    }

    #[test]
    fn test_deep_nesting_is_a_syntax_error() {
        let source = format!("x = {}1{}", "(".repeat(2000), ")".repeat(2000));
        match parse_script(&source) {
            Err(Error::Syntax { kind, line, message }) => {
                assert_eq!(kind, SyntaxErrorKind::General);
                assert_eq!(line, 1);
                assert_eq!(message, "expression nested too deeply");
            }
            other => panic!("expected a syntax error, got {:?}", other),
        }
        let brackets = format!("{}1{}", "[".repeat(MAX_NESTING + 8), "]".repeat(MAX_NESTING + 8));
        assert_eq!(syntax_kind(&brackets), (SyntaxErrorKind::General, 1));
        let calls = format!("{}1{}", "f(".repeat(MAX_NESTING + 8), ")".repeat(MAX_NESTING + 8));
        assert_eq!(syntax_kind(&calls), (SyntaxErrorKind::General, 1));

        let within = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(expr(&within), Expression::number(1.0));
    }

    #[test]
    fn test_deep_blocks_are_a_syntax_error() {
        let depth = MAX_BLOCK_NESTING + 1;
        let source = format!("{}x = 1\n{}", "if a\n".repeat(depth), "end\n".repeat(depth));
        assert_eq!(syntax_kind(&source).0, SyntaxErrorKind::General);
        let inline = format!("{}x = 1", "if a: ".repeat(depth));
        assert_eq!(syntax_kind(&inline).0, SyntaxErrorKind::General);

        let depth = MAX_BLOCK_NESTING;
        let source = format!("{}x = 1\n{}", "if a\n".repeat(depth), "end\n".repeat(depth));
        assert!(parse_script(&source).is_ok());
    }

    #[test]
    fn test_record_scope_forms() {
        let script = parse("record Base()\n  kind = 'base'\nend\nrecord Item(Base, lib.Mixin)\n  def name(): return 'item'\nend\nrecord Solo: x = 1\nrecord a, b");
        let statements = script.compound().statements();
        assert_eq!(statements.len(), 4);
        match &statements[1].kind {
            StatementKind::Scope { name, bases, body } => {
                assert_eq!(name, "Item");
                assert_eq!(bases.len(), 2);
                assert_eq!(bases[1].to_string(), "lib.Mixin");
                assert_eq!(body.len(), 1);
            }
            other => panic!("expected a record scope, got {:?}", other),
        }
        assert!(matches!(&statements[2].kind, StatementKind::Scope { bases, .. } if bases.is_empty()));
        assert!(matches!(&statements[3].kind, StatementKind::Declare(names) if names.len() == 2));
        assert_eq!(parse(&script.to_string()), script);

        assert_eq!(syntax_kind("record A(B\n").0, SyntaxErrorKind::MissingToken);
        assert_eq!(syntax_kind("record A()\nx = 1\n").0, SyntaxErrorKind::MissingToken);
    }

    #[test]
    fn test_pretty_print_reparses() {
        let source = r#"
def area(w, h=2)
    return w * h
end
total = 0
for i in [1, 2, 3]
    if i % 2 == 0: continue
    total += area(i, h=i) - -1
end
try
    throw 'bad ' + Text(total)
catch Error, message
    print message, total
end
d = {'k': 'it\'s', 'n': 0x10}
d['k'] = d['k'][1:3]
"#;
        let first = parse(source);
        let printed = first.to_string();
        let second = parse(&printed);
        assert_eq!(first, second);
        assert_eq!(printed, second.to_string());
    }
}
