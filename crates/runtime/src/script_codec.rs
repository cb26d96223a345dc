//! Binary form of parsed scripts
//!
//! Used for serializing script functions and for the compiled-script cache.
//! Each node starts with a one-byte serial id; statements also carry their
//! source line so that errors from a cached script point at the same place.

use crate::ast::{
    CatchClause, Compound, Expression, FlowKind, Literal, Script, Statement, StatementKind,
};
use crate::builtins::BuiltIn;
use crate::error::{Error, Result};
use crate::operator::{AssignOp, Operator};
use crate::value::NumberHint;
use quill_core::{Reader, Writer};
use std::sync::Arc;

mod statement_id {
    pub const EXPRESSION: u8 = 1;
    pub const ASSIGN: u8 = 2;
    pub const IF: u8 = 3;
    pub const WHILE: u8 = 4;
    pub const FOR: u8 = 5;
    pub const FUNCTION: u8 = 6;
    pub const PRINT: u8 = 7;
    pub const IMPORT: u8 = 8;
    pub const DECLARE: u8 = 9;
    pub const DELETE: u8 = 10;
    pub const FLOW: u8 = 11;
    pub const TRY: u8 = 12;
    pub const SCOPE: u8 = 13;
}

mod expression_id {
    pub const CONSTANT: u8 = 1;
    pub const NAME: u8 = 2;
    pub const ARRAY: u8 = 3;
    pub const DICTIONARY: u8 = 4;
    pub const UNARY: u8 = 5;
    pub const BINARY: u8 = 6;
    pub const MEMBER: u8 = 7;
    pub const INDEX: u8 = 8;
    pub const SLICE: u8 = 9;
    pub const CALL: u8 = 10;
    pub const BUILT_IN: u8 = 11;
}

/// Nesting limit shared by a script body and any value it is embedded in,
/// so corrupt input cannot exhaust the stack.
pub const MAX_DEPTH: usize = 512;

fn invalid(what: &str, id: u8) -> Error {
    Error::Deserialization(format!("invalid {} id {}", what, id))
}

pub fn write_script(script: &Script, to: &mut Writer) -> Result<()> {
    to.write_text(script.path())?;
    write_compound(script.compound(), to)
}

pub fn read_script(from: &mut Reader<'_>) -> Result<Script> {
    let path = from.read_text()?;
    let compound = read_compound(from)?;
    Ok(Script::from_compound(path, compound))
}

pub fn write_compound(compound: &Compound, to: &mut Writer) -> Result<()> {
    to.write_len(compound.len())?;
    for statement in compound.statements() {
        write_statement(statement, to)?;
    }
    Ok(())
}

pub fn read_compound(from: &mut Reader<'_>) -> Result<Arc<Compound>> {
    read_compound_at(from, 0)
}

/// Reads a compound found `depth` levels into an enclosing value.
pub fn read_compound_at(from: &mut Reader<'_>, depth: usize) -> Result<Arc<Compound>> {
    let mut decoder = Decoder { from, depth };
    decoder.compound()
}

fn write_names(names: &[String], to: &mut Writer) -> Result<()> {
    to.write_len(names.len())?;
    for name in names {
        to.write_text(name)?;
    }
    Ok(())
}

fn write_optional(expr: Option<&Expression>, to: &mut Writer) -> Result<()> {
    to.write_bool(expr.is_some());
    match expr {
        Some(expr) => write_expression(expr, to),
        None => Ok(()),
    }
}

fn write_optional_text(text: Option<&str>, to: &mut Writer) -> Result<()> {
    to.write_bool(text.is_some());
    if let Some(text) = text {
        to.write_text(text)?;
    }
    Ok(())
}

fn write_list(items: &[Expression], to: &mut Writer) -> Result<()> {
    to.write_len(items.len())?;
    for item in items {
        write_expression(item, to)?;
    }
    Ok(())
}

fn write_statement(statement: &Statement, to: &mut Writer) -> Result<()> {
    use statement_id::*;
    let line = u32::try_from(statement.line).unwrap_or(u32::MAX);
    match &statement.kind {
        StatementKind::Expression(expr) => {
            to.write_u8(EXPRESSION).write_u32(line);
            write_expression(expr, to)
        }
        StatementKind::Assign {
            target,
            op,
            value,
            read_only,
        } => {
            to.write_u8(ASSIGN)
                .write_u32(line)
                .write_u8(op.serial_id())
                .write_bool(*read_only);
            write_expression(target, to)?;
            write_expression(value, to)
        }
        StatementKind::If {
            branches,
            otherwise,
        } => {
            to.write_u8(IF).write_u32(line).write_len(branches.len())?;
            for (condition, body) in branches {
                write_expression(condition, to)?;
                write_compound(body, to)?;
            }
            to.write_bool(otherwise.is_some());
            match otherwise {
                Some(body) => write_compound(body, to),
                None => Ok(()),
            }
        }
        StatementKind::While { condition, body } => {
            to.write_u8(WHILE).write_u32(line);
            write_expression(condition, to)?;
            write_compound(body, to)
        }
        StatementKind::For {
            variable,
            iterable,
            body,
        } => {
            to.write_u8(FOR).write_u32(line).write_text(variable)?;
            write_expression(iterable, to)?;
            write_compound(body, to)
        }
        StatementKind::Function {
            name,
            params,
            defaults,
            body,
        } => {
            to.write_u8(FUNCTION).write_u32(line).write_text(name)?;
            write_names(params, to)?;
            to.write_len(defaults.len())?;
            for (param, default) in defaults {
                to.write_text(param)?;
                write_expression(default, to)?;
            }
            write_compound(body, to)
        }
        StatementKind::Print(args) => {
            to.write_u8(PRINT).write_u32(line);
            write_list(args, to)
        }
        StatementKind::Import { names, by_value } => {
            to.write_u8(IMPORT).write_u32(line).write_bool(*by_value);
            write_names(names, to)
        }
        StatementKind::Declare(names) => {
            to.write_u8(DECLARE).write_u32(line);
            write_names(names, to)
        }
        StatementKind::Scope { name, bases, body } => {
            to.write_u8(SCOPE).write_u32(line).write_text(name)?;
            write_list(bases, to)?;
            write_compound(body, to)
        }
        StatementKind::Delete(targets) => {
            to.write_u8(DELETE).write_u32(line);
            write_list(targets, to)
        }
        StatementKind::Flow(kind, value) => {
            to.write_u8(FLOW).write_u32(line).write_text(kind.keyword())?;
            write_optional(value.as_ref(), to)
        }
        StatementKind::Try { body, catches } => {
            to.write_u8(TRY).write_u32(line);
            write_compound(body, to)?;
            to.write_len(catches.len())?;
            for clause in catches {
                write_optional_text(clause.error_name.as_deref(), to)?;
                write_optional_text(clause.variable.as_deref(), to)?;
                write_compound(&clause.body, to)?;
            }
            Ok(())
        }
    }
}

fn write_literal(literal: &Literal, to: &mut Writer) -> Result<()> {
    match literal {
        Literal::None => {
            to.write_u8(0);
        }
        Literal::Number(n, hint) => {
            let hint = match hint {
                NumberHint::Plain => 0,
                NumberHint::Boolean => 1,
                NumberHint::Hex => 2,
            };
            to.write_u8(1).write_u8(hint).write_f64(*n);
        }
        Literal::Text(text) => {
            to.write_u8(2).write_text(text)?;
        }
    }
    Ok(())
}

fn write_expression(expr: &Expression, to: &mut Writer) -> Result<()> {
    use expression_id::*;
    match expr {
        Expression::Constant(literal) => {
            to.write_u8(CONSTANT);
            write_literal(literal, to)
        }
        Expression::Name(name) => {
            to.write_u8(NAME).write_text(name)?;
            Ok(())
        }
        Expression::Array(items) => {
            to.write_u8(ARRAY);
            write_list(items, to)
        }
        Expression::Dictionary(entries) => {
            to.write_u8(DICTIONARY).write_len(entries.len())?;
            for (key, value) in entries {
                write_expression(key, to)?;
                write_expression(value, to)?;
            }
            Ok(())
        }
        Expression::Unary { op, operand } => {
            to.write_u8(UNARY).write_u8(op.serial_id());
            write_expression(operand, to)
        }
        Expression::Binary { op, lhs, rhs } => {
            to.write_u8(BINARY).write_u8(op.serial_id());
            write_expression(lhs, to)?;
            write_expression(rhs, to)
        }
        Expression::Member { target, name } => {
            to.write_u8(MEMBER).write_text(name)?;
            write_expression(target, to)
        }
        Expression::Index { target, index } => {
            to.write_u8(INDEX);
            write_expression(target, to)?;
            write_expression(index, to)
        }
        Expression::Slice { target, start, end } => {
            to.write_u8(SLICE);
            write_expression(target, to)?;
            write_optional(start.as_deref(), to)?;
            write_optional(end.as_deref(), to)
        }
        Expression::Call {
            callee,
            args,
            keywords,
        } => {
            to.write_u8(CALL);
            write_expression(callee, to)?;
            write_list(args, to)?;
            to.write_len(keywords.len())?;
            for (name, value) in keywords {
                to.write_text(name)?;
                write_expression(value, to)?;
            }
            Ok(())
        }
        Expression::BuiltIn { kind, args } => {
            to.write_u8(BUILT_IN).write_u8(kind.serial_id());
            write_list(args, to)
        }
    }
}

struct Decoder<'r, 'a> {
    from: &'r mut Reader<'a>,
    depth: usize,
}

impl Decoder<'_, '_> {
    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(Error::Deserialization(
                "script is nested too deeply".to_string(),
            ));
        }
        Ok(())
    }

    fn compound(&mut self) -> Result<Arc<Compound>> {
        self.enter()?;
        let count = self.from.read_len(5)?;
        let mut statements = Vec::with_capacity(count);
        for _ in 0..count {
            statements.push(self.statement()?);
        }
        self.depth -= 1;
        Ok(Arc::new(Compound::new(statements)))
    }

    fn names(&mut self) -> Result<Vec<String>> {
        let count = self.from.read_len(4)?;
        (0..count)
            .map(|_| self.from.read_text().map_err(Error::from))
            .collect()
    }

    fn optional(&mut self) -> Result<Option<Expression>> {
        if self.from.read_bool()? {
            Ok(Some(self.expression()?))
        } else {
            Ok(None)
        }
    }

    fn optional_text(&mut self) -> Result<Option<String>> {
        if self.from.read_bool()? {
            Ok(Some(self.from.read_text()?))
        } else {
            Ok(None)
        }
    }

    fn list(&mut self) -> Result<Vec<Expression>> {
        let count = self.from.read_len(1)?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.expression()?);
        }
        Ok(items)
    }

    fn statement(&mut self) -> Result<Statement> {
        use statement_id::*;
        let id = self.from.read_u8()?;
        let line = self.from.read_u32()? as usize;
        let kind = match id {
            EXPRESSION => StatementKind::Expression(self.expression()?),
            ASSIGN => {
                let op_id = self.from.read_u8()?;
                let op = AssignOp::from_serial_id(op_id).ok_or_else(|| invalid("assignment", op_id))?;
                let read_only = self.from.read_bool()?;
                StatementKind::Assign {
                    target: self.expression()?,
                    op,
                    value: self.expression()?,
                    read_only,
                }
            }
            IF => {
                let count = self.from.read_len(2)?;
                let mut branches = Vec::with_capacity(count);
                for _ in 0..count {
                    let condition = self.expression()?;
                    branches.push((condition, self.compound()?));
                }
                let otherwise = if self.from.read_bool()? {
                    Some(self.compound()?)
                } else {
                    None
                };
                StatementKind::If {
                    branches,
                    otherwise,
                }
            }
            WHILE => StatementKind::While {
                condition: self.expression()?,
                body: self.compound()?,
            },
            FOR => StatementKind::For {
                variable: self.from.read_text()?,
                iterable: self.expression()?,
                body: self.compound()?,
            },
            FUNCTION => {
                let name = self.from.read_text()?;
                let params = self.names()?;
                let count = self.from.read_len(5)?;
                let mut defaults = Vec::with_capacity(count);
                for _ in 0..count {
                    let param = self.from.read_text()?;
                    defaults.push((param, self.expression()?));
                }
                StatementKind::Function {
                    name,
                    params,
                    defaults,
                    body: self.compound()?,
                }
            }
            PRINT => StatementKind::Print(self.list()?),
            IMPORT => {
                let by_value = self.from.read_bool()?;
                StatementKind::Import {
                    names: self.names()?,
                    by_value,
                }
            }
            DECLARE => StatementKind::Declare(self.names()?),
            SCOPE => StatementKind::Scope {
                name: self.from.read_text()?,
                bases: self.list()?,
                body: self.compound()?,
            },
            DELETE => StatementKind::Delete(self.list()?),
            FLOW => {
                let keyword = self.from.read_text()?;
                let kind = FlowKind::from_keyword(&keyword).ok_or_else(|| {
                    Error::Deserialization(format!("invalid flow statement '{}'", keyword))
                })?;
                StatementKind::Flow(kind, self.optional()?)
            }
            TRY => {
                let body = self.compound()?;
                let count = self.from.read_len(6)?;
                let mut catches = Vec::with_capacity(count);
                for _ in 0..count {
                    catches.push(CatchClause {
                        error_name: self.optional_text()?,
                        variable: self.optional_text()?,
                        body: self.compound()?,
                    });
                }
                StatementKind::Try { body, catches }
            }
            other => return Err(invalid("statement", other)),
        };
        Ok(Statement::new(kind, line))
    }

    fn literal(&mut self) -> Result<Literal> {
        Ok(match self.from.read_u8()? {
            0 => Literal::None,
            1 => {
                let hint = match self.from.read_u8()? {
                    0 => NumberHint::Plain,
                    1 => NumberHint::Boolean,
                    2 => NumberHint::Hex,
                    other => return Err(invalid("number hint", other)),
                };
                Literal::Number(self.from.read_f64()?, hint)
            }
            2 => Literal::Text(self.from.read_text()?),
            other => return Err(invalid("literal", other)),
        })
    }

    fn operator(&mut self) -> Result<Operator> {
        let id = self.from.read_u8()?;
        Operator::from_serial_id(id).ok_or_else(|| invalid("operator", id))
    }

    fn expression(&mut self) -> Result<Expression> {
        use expression_id::*;
        self.enter()?;
        let id = self.from.read_u8()?;
        let expr = match id {
            CONSTANT => Expression::Constant(self.literal()?),
            NAME => Expression::Name(self.from.read_text()?),
            ARRAY => Expression::Array(self.list()?),
            DICTIONARY => {
                let count = self.from.read_len(2)?;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = self.expression()?;
                    entries.push((key, self.expression()?));
                }
                Expression::Dictionary(entries)
            }
            UNARY => Expression::Unary {
                op: self.operator()?,
                operand: Box::new(self.expression()?),
            },
            BINARY => Expression::Binary {
                op: self.operator()?,
                lhs: Box::new(self.expression()?),
                rhs: Box::new(self.expression()?),
            },
            MEMBER => {
                let name = self.from.read_text()?;
                Expression::Member {
                    target: Box::new(self.expression()?),
                    name,
                }
            }
            INDEX => Expression::Index {
                target: Box::new(self.expression()?),
                index: Box::new(self.expression()?),
            },
            SLICE => Expression::Slice {
                target: Box::new(self.expression()?),
                start: self.optional()?.map(Box::new),
                end: self.optional()?.map(Box::new),
            },
            CALL => {
                let callee = Box::new(self.expression()?);
                let args = self.list()?;
                let count = self.from.read_len(5)?;
                let mut keywords = Vec::with_capacity(count);
                for _ in 0..count {
                    let name = self.from.read_text()?;
                    keywords.push((name, self.expression()?));
                }
                Expression::Call {
                    callee,
                    args,
                    keywords,
                }
            }
            BUILT_IN => {
                let kind_id = self.from.read_u8()?;
                let kind =
                    BuiltIn::from_serial_id(kind_id).ok_or_else(|| invalid("built-in", kind_id))?;
                Expression::BuiltIn {
                    kind,
                    args: self.list()?,
                }
            }
            other => return Err(invalid("expression", other)),
        };
        self.depth -= 1;
        Ok(expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_script;

    #[test]
    fn test_script_round_trip_keeps_lines() {
        let source = "def f(a, b=[1, {'k': 0x2}])\n    return a[1:] + b\nend\n\
                      try\n    del x\ncatch NotFoundError, e\n    print e\nend\n\
                      for i in 'abc': n ?= len(i)\nimport record M\nconst C = not -1 or True\n\
                      record R(M, lib.N)\n    x = 1\nend\n";
        let mut script = parse_script(source).unwrap();
        script.set_path("/tmp/test.qs");
        let mut writer = Writer::new();
        write_script(&script, &mut writer).unwrap();

        let mut reader = Reader::new(writer.as_bytes());
        let back = read_script(&mut reader).unwrap();
        assert!(reader.at_end());
        assert_eq!(back, script);
        assert_eq!(back.path(), "/tmp/test.qs");
        let lines: Vec<usize> = back.compound().statements().iter().map(|s| s.line).collect();
        assert_eq!(lines, vec![1, 4, 9, 10, 11, 12]);
    }

    #[test]
    fn test_starting_depth_counts_toward_limit() {
        let mut writer = Writer::new();
        write_compound(script_body("x = (1 + 2) * 3").as_ref(), &mut writer).unwrap();

        let mut reader = Reader::new(writer.as_bytes());
        assert!(read_compound_at(&mut reader, MAX_DEPTH - 8).is_ok());
        let mut reader = Reader::new(writer.as_bytes());
        assert!(matches!(
            read_compound_at(&mut reader, MAX_DEPTH - 1),
            Err(Error::Deserialization(_))
        ));
    }

    fn script_body(source: &str) -> Arc<Compound> {
        parse_script(source).unwrap().compound().clone()
    }

    #[test]
    fn test_invalid_ids_rejected() {
        let mut writer = Writer::new();
        writer.write_len(1).unwrap().write_u8(99).write_u32(1);
        let mut reader = Reader::new(writer.as_bytes());
        assert!(matches!(read_compound(&mut reader), Err(Error::Deserialization(_))));
    }
}
