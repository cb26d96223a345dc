//! Built-in functions
//!
//! Calls to these names are resolved when the script is parsed and become
//! [`Expression::BuiltIn`](crate::ast::Expression::BuiltIn) nodes, so a
//! script variable called `len` cannot shadow them. Each built-in checks its
//! argument count and argument types and fails with `WrongArgumentsError`.

use crate::error::{Error, Result};
use crate::process::Process;
use crate::record::{Record, RecordValue};
use crate::serialize;
use crate::value::{DictionaryValue, Value};
use quill_core::Time;

/// Declares the built-in table: enum variant and script-visible name.
/// Serial ids are positions in the table, so new entries go at the end.
macro_rules! builtins {
    ($($variant:ident => $name:literal),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum BuiltIn {
            $($variant),*
        }

        impl BuiltIn {
            pub const ALL: &'static [BuiltIn] = &[$(BuiltIn::$variant),*];

            pub fn name(self) -> &'static str {
                match self {
                    $(BuiltIn::$variant => $name),*
                }
            }
        }
    };
}

builtins! {
    Len => "len",
    Dir => "dir",
    Members => "members",
    Subrecords => "subrecords",
    Serialize => "serialize",
    Deserialize => "deserialize",
    AsNumber => "Number",
    AsText => "Text",
    AsRecord => "Record",
    AsTime => "Time",
    TimeDelta => "timedelta",
    Floor => "floor",
    Evaluate => "eval",
    Locals => "locals",
    Globals => "globals",
    DictionaryKeys => "dictkeys",
    DictionaryValues => "dictvalues",
    TypeOf => "typeof",
}

impl BuiltIn {
    pub fn from_name(name: &str) -> Option<BuiltIn> {
        Self::ALL.iter().copied().find(|b| b.name() == name)
    }

    pub fn serial_id(self) -> u8 {
        Self::ALL.iter().position(|b| *b == self).unwrap_or(0) as u8
    }

    pub fn from_serial_id(id: u8) -> Option<BuiltIn> {
        Self::ALL.get(id as usize).copied()
    }

    /// Accepted argument counts, inclusive.
    fn arity(self) -> (usize, usize) {
        match self {
            BuiltIn::Locals | BuiltIn::Globals => (0, 0),
            BuiltIn::Dir | BuiltIn::AsRecord | BuiltIn::AsTime => (0, 1),
            BuiltIn::TimeDelta => (2, 2),
            _ => (1, 1),
        }
    }
}

fn check_arity(kind: BuiltIn, args: &[Value]) -> Result<()> {
    let (min, max) = kind.arity();
    if (min..=max).contains(&args.len()) {
        return Ok(());
    }
    let expected = match (min, max) {
        (0, 0) => "no arguments".to_string(),
        (a, b) if a == b => format!("exactly {} argument{}", a, if a == 1 { "" } else { "s" }),
        (a, b) => format!("{} to {} arguments", a, b),
    };
    Err(Error::WrongArguments(format!(
        "{}() takes {} ({} given)",
        kind.name(),
        expected,
        args.len()
    )))
}

fn wrong_type(kind: BuiltIn, position: usize, expected: &str, got: &Value) -> Error {
    Error::WrongArguments(format!(
        "argument {} of {}() must be {}, not {}",
        position,
        kind.name(),
        expected,
        got.type_name()
    ))
}

fn record_arg(kind: BuiltIn, args: &[Value], position: usize) -> Result<RecordValue> {
    match &args[position - 1] {
        Value::Record(rv) => Ok(rv.clone()),
        other => Err(wrong_type(kind, position, "a Record", other)),
    }
}

fn time_arg(kind: BuiltIn, args: &[Value], position: usize) -> Result<Time> {
    match &args[position - 1] {
        Value::Time(time) => Ok(*time),
        other => Err(wrong_type(kind, position, "a Time", other)),
    }
}

fn dictionary_arg(kind: BuiltIn, args: &[Value]) -> Result<&DictionaryValue> {
    match &args[0] {
        Value::Dictionary(dict) => Ok(dict),
        other => Err(wrong_type(kind, 1, "a Dictionary", other)),
    }
}

fn names_of(record: &Record) -> Value {
    Value::Array(record.member_names().into_iter().map(Value::Text).collect())
}

/// Evaluates built-in `kind` with already evaluated `args`.
pub fn call(process: &mut Process, kind: BuiltIn, args: Vec<Value>) -> Result<Value> {
    check_arity(kind, &args)?;
    match kind {
        BuiltIn::Len => Ok(Value::from(args[0].size()?)),
        BuiltIn::Dir => match args.first() {
            None => {
                let names = process.local_namespace();
                let names = names
                    .try_borrow()
                    .map_err(|_| Error::Illegal("namespace is being modified".to_string()))?;
                Ok(names_of(&names))
            }
            Some(_) => record_arg(kind, &args, 1)?.with(names_of),
        },
        BuiltIn::Members => record_arg(kind, &args, 1)?.with(|record| {
            let mut dict = DictionaryValue::new();
            for variable in record.members() {
                dict.insert(Value::from(variable.name()), variable.value().clone());
            }
            Value::Dictionary(dict)
        }),
        BuiltIn::Subrecords => record_arg(kind, &args, 1)?.with(|record| {
            let mut dict = DictionaryValue::new();
            for (name, sub) in record.subrecords() {
                dict.insert(Value::Text(name), Value::Record(RecordValue::reference(&sub)));
            }
            Value::Dictionary(dict)
        }),
        BuiltIn::Serialize => Ok(Value::Block(serialize::to_bytes(&args[0])?)),
        BuiltIn::Deserialize => match &args[0] {
            Value::Block(bytes) => serialize::from_bytes(bytes),
            other => Err(wrong_type(kind, 1, "a Block", other)),
        },
        BuiltIn::AsNumber => Ok(Value::number(args[0].as_number()?)),
        BuiltIn::AsText => Ok(Value::Text(args[0].as_text())),
        BuiltIn::AsRecord => match args.first() {
            None => Ok(Value::Record(RecordValue::new_owned(Record::new()))),
            Some(_) => {
                let copy = record_arg(kind, &args, 1)?.with(|r| r.duplicate())??;
                Ok(Value::Record(RecordValue::new_owned(copy)))
            }
        },
        BuiltIn::AsTime => match args.first() {
            None => Ok(Value::Time(Time::now())),
            Some(Value::Time(time)) => Ok(Value::Time(*time)),
            Some(other) => {
                let text = other.as_text();
                Time::from_text(&text)
                    .map(Value::Time)
                    .ok_or_else(|| Error::Invalid(format!("'{}' is not a valid time", text)))
            }
        },
        BuiltIn::TimeDelta => {
            let from = time_arg(kind, &args, 1)?;
            let to = time_arg(kind, &args, 2)?;
            Ok(Value::number(to.seconds_since(&from)))
        }
        BuiltIn::Floor => Ok(Value::number(args[0].as_number()?.floor())),
        BuiltIn::Evaluate => {
            let source = args[0].as_text();
            process.evaluate_text(&source)?.duplicate()
        }
        BuiltIn::Locals => Ok(Value::Record(RecordValue::reference(
            &process.local_namespace(),
        ))),
        BuiltIn::Globals => Ok(Value::Record(RecordValue::reference(process.globals()))),
        BuiltIn::DictionaryKeys => Ok(Value::Array(dictionary_arg(kind, &args)?.keys())),
        BuiltIn::DictionaryValues => Ok(Value::Array(dictionary_arg(kind, &args)?.values())),
        BuiltIn::TypeOf => Ok(Value::from(args[0].type_name())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_name_table() {
        let names: HashSet<_> = BuiltIn::ALL.iter().map(|b| b.name()).collect();
        assert_eq!(names.len(), BuiltIn::ALL.len());
        assert_eq!(BuiltIn::from_name("len"), Some(BuiltIn::Len));
        assert_eq!(BuiltIn::from_name("Record"), Some(BuiltIn::AsRecord));
        assert_eq!(BuiltIn::from_name("record"), None);
    }

    #[test]
    fn test_serial_ids_are_positions() {
        for (i, kind) in BuiltIn::ALL.iter().enumerate() {
            assert_eq!(kind.serial_id() as usize, i);
            assert_eq!(BuiltIn::from_serial_id(i as u8), Some(*kind));
        }
        assert_eq!(BuiltIn::from_serial_id(200), None);
    }

    #[test]
    fn test_arity_messages() {
        let err = check_arity(BuiltIn::Len, &[]).unwrap_err();
        assert_eq!(err.to_string(), "len() takes exactly 1 argument (0 given)");
        let err = check_arity(BuiltIn::Locals, &[Value::None]).unwrap_err();
        assert_eq!(err.to_string(), "locals() takes no arguments (1 given)");
        let err = check_arity(BuiltIn::Dir, &[Value::None, Value::None]).unwrap_err();
        assert_eq!(err.to_string(), "dir() takes 0 to 1 arguments (2 given)");
        assert!(check_arity(BuiltIn::TimeDelta, &[Value::None, Value::None]).is_ok());
    }
}
