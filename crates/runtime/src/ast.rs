//! Abstract Syntax Tree for Quill scripts
//!
//! A parsed [`Script`] is immutable and holds no runtime values, so one
//! script can be shared between any number of processes (and threads).
//! Block bodies are reference-counted so the evaluator can keep them alive
//! in its frames without copying.
//!
//! `Display` prints the tree back as source text that parses to an equal
//! tree; binary and unary operations are fully parenthesized.

use crate::builtins::BuiltIn;
use crate::operator::{AssignOp, Operator};
use crate::value::{NumberHint, format_number, quote_text};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    path: String,
    compound: Arc<Compound>,
}

impl Script {
    pub fn new(path: impl Into<String>, compound: Compound) -> Self {
        Script {
            path: path.into(),
            compound: Arc::new(compound),
        }
    }

    pub fn from_compound(path: impl Into<String>, compound: Arc<Compound>) -> Self {
        Script {
            path: path.into(),
            compound,
        }
    }

    /// Source path used to resolve relative imports. May be empty.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
    }

    pub fn compound(&self) -> &Arc<Compound> {
        &self.compound
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_compound(f, &self.compound, 0)
    }
}

/// An ordered list of statements.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Compound {
    statements: Vec<Statement>,
}

impl Compound {
    pub fn new(statements: Vec<Statement>) -> Self {
        Compound { statements }
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn get(&self, index: usize) -> Option<&Statement> {
        self.statements.get(index)
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Statement {
    pub kind: StatementKind,
    /// 1-based source line.
    pub line: usize,
}

/// Line numbers are not part of a statement's structure.
impl PartialEq for Statement {
    fn eq(&self, other: &Statement) -> bool {
        self.kind == other.kind
    }
}

impl Statement {
    pub fn new(kind: StatementKind, line: usize) -> Self {
        Statement { kind, line }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    Expression(Expression),
    Assign {
        target: Expression,
        op: AssignOp,
        value: Expression,
        /// `const`: the variable becomes read-only.
        read_only: bool,
    },
    If {
        branches: Vec<(Expression, Arc<Compound>)>,
        otherwise: Option<Arc<Compound>>,
    },
    While {
        condition: Expression,
        body: Arc<Compound>,
    },
    For {
        variable: String,
        iterable: Expression,
        body: Arc<Compound>,
    },
    Function {
        name: String,
        /// All parameter names, in order.
        params: Vec<String>,
        /// Default expressions for some of `params`.
        defaults: Vec<(String, Expression)>,
        body: Arc<Compound>,
    },
    Print(Vec<Expression>),
    Import {
        names: Vec<String>,
        /// `import record`: bind an owned copy of the module namespace.
        by_value: bool,
    },
    /// `record A, B`: declare empty subrecords.
    Declare(Vec<String>),
    /// `record A(B, C)` with a body: runs the body with subrecord `A` as the
    /// local namespace, after listing `B` and `C` as its super records.
    Scope {
        name: String,
        bases: Vec<Expression>,
        body: Arc<Compound>,
    },
    Delete(Vec<Expression>),
    Flow(FlowKind, Option<Expression>),
    Try {
        body: Arc<Compound>,
        catches: Vec<CatchClause>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    Pass,
    Continue,
    Break,
    Return,
    Throw,
}

impl FlowKind {
    pub fn keyword(self) -> &'static str {
        match self {
            FlowKind::Pass => "pass",
            FlowKind::Continue => "continue",
            FlowKind::Break => "break",
            FlowKind::Return => "return",
            FlowKind::Throw => "throw",
        }
    }

    pub fn from_keyword(text: &str) -> Option<FlowKind> {
        Some(match text {
            "pass" => FlowKind::Pass,
            "continue" => FlowKind::Continue,
            "break" => FlowKind::Break,
            "return" => FlowKind::Return,
            "throw" => FlowKind::Throw,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatchClause {
    /// `None` catches every error.
    pub error_name: Option<String>,
    pub variable: Option<String>,
    pub body: Arc<Compound>,
}

impl CatchClause {
    pub fn catches(&self, error: &crate::error::Error) -> bool {
        match &self.error_name {
            None => true,
            Some(name) => error.matches(name),
        }
    }
}

/// Constant operand as written in source.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    None,
    Number(f64, NumberHint),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Constant(Literal),
    Name(String),
    Array(Vec<Expression>),
    Dictionary(Vec<(Expression, Expression)>),
    Unary {
        op: Operator,
        operand: Box<Expression>,
    },
    Binary {
        op: Operator,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    Member {
        target: Box<Expression>,
        name: String,
    },
    Index {
        target: Box<Expression>,
        index: Box<Expression>,
    },
    Slice {
        target: Box<Expression>,
        start: Option<Box<Expression>>,
        end: Option<Box<Expression>>,
    },
    Call {
        callee: Box<Expression>,
        args: Vec<Expression>,
        keywords: Vec<(String, Expression)>,
    },
    BuiltIn {
        kind: BuiltIn,
        args: Vec<Expression>,
    },
}

impl Expression {
    pub fn number(value: f64) -> Self {
        Expression::Constant(Literal::Number(value, NumberHint::Plain))
    }

    pub fn text(value: impl Into<String>) -> Self {
        Expression::Constant(Literal::Text(value.into()))
    }

    pub fn name(value: impl Into<String>) -> Self {
        Expression::Name(value.into())
    }

    pub fn binary(op: Operator, lhs: Expression, rhs: Expression) -> Self {
        Expression::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Whether the expression can appear on the left of an assignment.
    pub fn is_assignable(&self) -> bool {
        match self {
            Expression::Name(_) | Expression::Member { .. } => true,
            Expression::Index { target, .. } => target.is_assignable(),
            _ => false,
        }
    }
}

fn write_list<T>(
    f: &mut fmt::Formatter<'_>,
    items: &[T],
    mut each: impl FnMut(&mut fmt::Formatter<'_>, &T) -> fmt::Result,
) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        each(f, item)?;
    }
    Ok(())
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::None => write!(f, "None"),
            Literal::Number(n, hint) => write!(f, "{}", format_number(*n, *hint)),
            Literal::Text(text) => write!(f, "{}", quote_text(text)),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Constant(literal) => write!(f, "{}", literal),
            Expression::Name(name) => write!(f, "{}", name),
            Expression::Array(items) => {
                write!(f, "[")?;
                write_list(f, items, |f, item| write!(f, "{}", item))?;
                write!(f, "]")
            }
            Expression::Dictionary(entries) => {
                write!(f, "{{")?;
                write_list(f, entries, |f, (k, v)| write!(f, "{}: {}", k, v))?;
                write!(f, "}}")
            }
            Expression::Unary { op, operand } => match op {
                Operator::Not => write!(f, "(not {})", operand),
                _ => write!(f, "({}{})", op, operand),
            },
            Expression::Binary { op, lhs, rhs } => write!(f, "({} {} {})", lhs, op, rhs),
            Expression::Member { target, name } => write!(f, "{}.{}", target, name),
            Expression::Index { target, index } => write!(f, "{}[{}]", target, index),
            Expression::Slice { target, start, end } => {
                write!(f, "{}[", target)?;
                if let Some(start) = start {
                    write!(f, "{}", start)?;
                }
                write!(f, ":")?;
                if let Some(end) = end {
                    write!(f, "{}", end)?;
                }
                write!(f, "]")
            }
            Expression::Call {
                callee,
                args,
                keywords,
            } => {
                write!(f, "{}(", callee)?;
                write_list(f, args, |f, arg| write!(f, "{}", arg))?;
                if !args.is_empty() && !keywords.is_empty() {
                    write!(f, ", ")?;
                }
                write_list(f, keywords, |f, (name, value)| write!(f, "{}={}", name, value))?;
                write!(f, ")")
            }
            Expression::BuiltIn { kind, args } => {
                write!(f, "{}(", kind.name())?;
                write_list(f, args, |f, arg| write!(f, "{}", arg))?;
                write!(f, ")")
            }
        }
    }
}

const INDENT: &str = "    ";

fn write_compound(f: &mut fmt::Formatter<'_>, compound: &Compound, depth: usize) -> fmt::Result {
    for statement in compound.statements() {
        write_statement(f, statement, depth)?;
    }
    Ok(())
}

fn write_block(
    f: &mut fmt::Formatter<'_>,
    header: fmt::Arguments<'_>,
    body: &Compound,
    depth: usize,
) -> fmt::Result {
    writeln!(f, "{}{}", INDENT.repeat(depth), header)?;
    write_compound(f, body, depth + 1)
}

fn write_statement(f: &mut fmt::Formatter<'_>, statement: &Statement, depth: usize) -> fmt::Result {
    let pad = INDENT.repeat(depth);
    match &statement.kind {
        StatementKind::Expression(expr) => writeln!(f, "{}{}", pad, expr),
        StatementKind::Assign {
            target,
            op,
            value,
            read_only,
        } => {
            let prefix = if *read_only { "const " } else { "" };
            writeln!(f, "{}{}{} {} {}", pad, prefix, target, op.as_str(), value)
        }
        StatementKind::If {
            branches,
            otherwise,
        } => {
            for (i, (condition, body)) in branches.iter().enumerate() {
                let keyword = if i == 0 { "if" } else { "elsif" };
                write_block(f, format_args!("{} {}", keyword, condition), body, depth)?;
            }
            if let Some(body) = otherwise {
                write_block(f, format_args!("else"), body, depth)?;
            }
            writeln!(f, "{}end", pad)
        }
        StatementKind::While { condition, body } => {
            write_block(f, format_args!("while {}", condition), body, depth)?;
            writeln!(f, "{}end", pad)
        }
        StatementKind::For {
            variable,
            iterable,
            body,
        } => {
            write_block(f, format_args!("for {} in {}", variable, iterable), body, depth)?;
            writeln!(f, "{}end", pad)
        }
        StatementKind::Function {
            name,
            params,
            defaults,
            body,
        } => {
            let signature: Vec<String> = params
                .iter()
                .map(|param| match defaults.iter().find(|(name, _)| name == param) {
                    Some((_, default)) => format!("{}={}", param, default),
                    None => param.clone(),
                })
                .collect();
            let signature = signature.join(", ");
            write_block(f, format_args!("def {}({})", name, signature), body, depth)?;
            writeln!(f, "{}end", pad)
        }
        StatementKind::Print(args) => {
            write!(f, "{}print", pad)?;
            if !args.is_empty() {
                write!(f, " ")?;
                write_list(f, args, |f, arg| write!(f, "{}", arg))?;
            }
            writeln!(f)
        }
        StatementKind::Import { names, by_value } => {
            let record = if *by_value { "record " } else { "" };
            writeln!(f, "{}import {}{}", pad, record, names.join(", "))
        }
        StatementKind::Declare(names) => writeln!(f, "{}record {}", pad, names.join(", ")),
        StatementKind::Scope { name, bases, body } => {
            write!(f, "{}record {}(", pad, name)?;
            write_list(f, bases, |f, base| write!(f, "{}", base))?;
            writeln!(f, ")")?;
            write_compound(f, body, depth + 1)?;
            writeln!(f, "{}end", pad)
        }
        StatementKind::Delete(targets) => {
            write!(f, "{}del ", pad)?;
            write_list(f, targets, |f, target| write!(f, "{}", target))?;
            writeln!(f)
        }
        StatementKind::Flow(kind, value) => match value {
            Some(value) => writeln!(f, "{}{} {}", pad, kind.keyword(), value),
            None => writeln!(f, "{}{}", pad, kind.keyword()),
        },
        StatementKind::Try { body, catches } => {
            write_block(f, format_args!("try"), body, depth)?;
            for clause in catches {
                let header = match (&clause.error_name, &clause.variable) {
                    (Some(name), Some(var)) => format!("catch {}, {}", name, var),
                    (Some(name), None) => format!("catch {}", name),
                    (None, _) => "catch".to_string(),
                };
                write_block(f, format_args!("{}", header), &clause.body, depth)?;
            }
            writeln!(f, "{}end", pad)
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_statement(f, self, 0)
    }
}

impl fmt::Display for Compound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_compound(f, self, 0)
    }
}
