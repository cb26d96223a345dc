//! Binary serialization of values and records
//!
//! Every value is written as a one-byte tag followed by a tag-specific
//! payload. Tags are stable across protocol versions; the version carried by
//! the [`Writer`]/[`Reader`] only gates optional payload parts (see
//! [`Time`](quill_core::Time)). Unknown tags are rejected.
//!
//! Script functions serialize their parsed body. Native functions are host
//! code, not data, and refuse to serialize.

use crate::error::{Error, Result};
use crate::function::{Function, FunctionBody};
use crate::record::{Record, RecordValue};
use crate::script_codec::{self, MAX_DEPTH};
use crate::value::{DictionaryValue, KeyComparison, NumberHint, Value};
use crate::variable::{Mode, Variable};
use quill_core::{Reader, Time, Writer};
use std::rc::Rc;

pub const TAG_NONE: u8 = 0;
pub const TAG_NUMBER: u8 = 1;
pub const TAG_TEXT: u8 = 2;
pub const TAG_ARRAY: u8 = 3;
pub const TAG_DICTIONARY: u8 = 4;
pub const TAG_BLOCK: u8 = 5;
pub const TAG_FUNCTION: u8 = 6;
pub const TAG_RECORD: u8 = 7;
pub const TAG_TIME: u8 = 8;

const HINT_BOOLEAN: u8 = 0x01;
const HINT_HEX: u8 = 0x02;

pub fn serialize_value(value: &Value, to: &mut Writer) -> Result<()> {
    match value {
        Value::None => {
            to.write_u8(TAG_NONE);
        }
        Value::Number(n, hint) => {
            let flags = match hint {
                NumberHint::Plain => 0,
                NumberHint::Boolean => HINT_BOOLEAN,
                NumberHint::Hex => HINT_HEX,
            };
            to.write_u8(TAG_NUMBER).write_u8(flags).write_f64(*n);
        }
        Value::Text(text) => {
            to.write_u8(TAG_TEXT).write_text(text)?;
        }
        Value::Array(items) => {
            to.write_u8(TAG_ARRAY).write_len(items.len())?;
            for item in items {
                serialize_value(item, to)?;
            }
        }
        Value::Dictionary(dict) => {
            let comparison = match dict.comparison() {
                KeyComparison::CaseSensitive => 0,
                KeyComparison::CaseInsensitive => 1,
            };
            to.write_u8(TAG_DICTIONARY)
                .write_u8(comparison)
                .write_len(dict.len())?;
            for (key, value) in dict.iter() {
                serialize_value(key, to)?;
                serialize_value(value, to)?;
            }
        }
        Value::Block(bytes) => {
            to.write_u8(TAG_BLOCK).write_block(bytes)?;
        }
        Value::Function(function) => {
            to.write_u8(TAG_FUNCTION);
            serialize_function(function, to)?;
        }
        Value::Record(rv) => {
            to.write_u8(TAG_RECORD).write_bool(rv.is_owner());
            let record = rv.dereference()?;
            let record = record
                .try_borrow()
                .map_err(|_| Error::Illegal("record is being modified".to_string()))?;
            serialize_record(&record, to)?;
        }
        Value::Time(time) => {
            to.write_u8(TAG_TIME);
            time.serialize(to);
        }
    }
    Ok(())
}

pub fn deserialize_value(from: &mut Reader<'_>) -> Result<Value> {
    read_value(from, 0)
}

fn read_value(from: &mut Reader<'_>, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(Error::Deserialization(
            "values are nested too deeply".to_string(),
        ));
    }
    let offset = from.position();
    let tag = from.read_u8()?;
    Ok(match tag {
        TAG_NONE => Value::None,
        TAG_NUMBER => {
            let flags = from.read_u8()?;
            let hint = match flags {
                0 => NumberHint::Plain,
                HINT_BOOLEAN => NumberHint::Boolean,
                HINT_HEX => NumberHint::Hex,
                other => {
                    return Err(Error::Deserialization(format!(
                        "invalid number flags {:#04x} at offset {}",
                        other, offset
                    )));
                }
            };
            Value::Number(from.read_f64()?, hint)
        }
        TAG_TEXT => Value::Text(from.read_text()?),
        TAG_ARRAY => {
            let count = from.read_len(1)?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(read_value(from, depth + 1)?);
            }
            Value::Array(items)
        }
        TAG_DICTIONARY => {
            let comparison = match from.read_u8()? {
                0 => KeyComparison::CaseSensitive,
                1 => KeyComparison::CaseInsensitive,
                other => {
                    return Err(Error::Deserialization(format!(
                        "invalid key comparison {} at offset {}",
                        other, offset
                    )));
                }
            };
            let count = from.read_len(2)?;
            let mut dict = DictionaryValue::with_comparison(comparison);
            for _ in 0..count {
                let key = read_value(from, depth + 1)?;
                let value = read_value(from, depth + 1)?;
                dict.insert(key, value);
            }
            Value::Dictionary(dict)
        }
        TAG_BLOCK => Value::Block(from.read_block()?),
        TAG_FUNCTION => Value::Function(Rc::new(read_function(from, depth + 1)?)),
        TAG_RECORD => {
            // Owned or not when written, a deserialized record has no other
            // owner, so the value owns it.
            let _was_owner = from.read_bool()?;
            Value::Record(RecordValue::new_owned(read_record(from, depth + 1)?))
        }
        TAG_TIME => Value::Time(Time::deserialize(from)?),
        other => {
            return Err(Error::Deserialization(format!(
                "unknown value tag {} at offset {}",
                other, offset
            )));
        }
    })
}

/// Writes the members of `record`, skipping those marked `NO_SERIALIZE`.
pub fn serialize_record(record: &Record, to: &mut Writer) -> Result<()> {
    let members: Vec<&Variable> = record
        .members()
        .filter(|v| !v.mode().contains(Mode::NO_SERIALIZE))
        .collect();
    to.write_len(members.len())?;
    for variable in members {
        to.write_text(variable.name())?
            .write_u32(variable.mode().bits());
        serialize_value(variable.value(), to)?;
    }
    Ok(())
}

pub fn deserialize_record(from: &mut Reader<'_>) -> Result<Record> {
    read_record(from, 0)
}

fn read_record(from: &mut Reader<'_>, depth: usize) -> Result<Record> {
    let count = from.read_len(6)?;
    let mut record = Record::new();
    for _ in 0..count {
        let name = from.read_text()?;
        let mode = Mode::from_bits_truncate(from.read_u32()?);
        let value = read_value(from, depth + 1)?;
        let variable = Variable::with_mode(name, value, mode)
            .map_err(|e| Error::Deserialization(format!("inconsistent member: {}", e)))?;
        record.add(variable);
    }
    Ok(record)
}

pub fn serialize_function(function: &Function, to: &mut Writer) -> Result<()> {
    let body = match function.body() {
        FunctionBody::Script(body) => body,
        FunctionBody::Native(_) => {
            return Err(Error::Type(format!(
                "native function '{}' cannot be serialized: code is not data",
                function.name()
            )));
        }
    };
    to.write_text(function.name())?
        .write_len(function.params().len())?;
    for param in function.params() {
        to.write_text(param)?;
    }
    to.write_len(function.defaults().len())?;
    for (name, value) in function.defaults() {
        to.write_text(name)?;
        serialize_value(value, to)?;
    }
    script_codec::write_compound(body, to)
}

pub fn deserialize_function(from: &mut Reader<'_>) -> Result<Function> {
    read_function(from, 0)
}

/// Defaults and body continue the nesting count of the enclosing value.
fn read_function(from: &mut Reader<'_>, depth: usize) -> Result<Function> {
    let name = from.read_text()?;
    let count = from.read_len(4)?;
    let params = (0..count)
        .map(|_| from.read_text())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let count = from.read_len(5)?;
    let mut defaults = Vec::with_capacity(count);
    for _ in 0..count {
        let param = from.read_text()?;
        if !params.contains(&param) {
            return Err(Error::Deserialization(format!(
                "default for unknown parameter '{}'",
                param
            )));
        }
        defaults.push((param, read_value(from, depth + 1)?));
    }
    let body = script_codec::read_compound_at(from, depth)?;
    Ok(Function::script(name, params, defaults, body))
}

/// Serializes `value` with a leading protocol header.
pub fn to_bytes(value: &Value) -> Result<Vec<u8>> {
    let mut writer = Writer::new();
    writer.write_header();
    serialize_value(value, &mut writer)?;
    Ok(writer.into_bytes())
}

/// Reads a value written by [`to_bytes`]; trailing bytes are an error.
pub fn from_bytes(bytes: &[u8]) -> Result<Value> {
    let mut reader = Reader::with_header(bytes)?;
    let value = deserialize_value(&mut reader)?;
    if !reader.at_end() {
        return Err(Error::Deserialization(format!(
            "{} unexpected bytes after value",
            reader.remaining()
        )));
    }
    Ok(value)
}
