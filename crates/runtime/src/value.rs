//! Runtime values
//!
//! `Value` is a closed sum type. Containers own their elements; record values
//! either own their record or refer to one owned elsewhere (see
//! [`RecordValue`]). Cloning a `Value` never deep-copies an owned record: the
//! clone is a reference. Use [`Value::duplicate`] for an independent copy.

use crate::error::{Error, Result};
use crate::function::Function;
use crate::record::RecordValue;
use quill_core::Time;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

/// Display hint carried by numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NumberHint {
    #[default]
    Plain,
    Boolean,
    Hex,
}

#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    None,
    Number(f64, NumberHint),
    Text(String),
    Array(Vec<Value>),
    Dictionary(DictionaryValue),
    Block(Vec<u8>),
    Time(Time),
    Record(RecordValue),
    Function(Rc<Function>),
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value, NumberHint::Plain)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value as f64, NumberHint::Plain)
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::Number(value as f64, NumberHint::Plain)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::boolean(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::Array(value)
    }
}

impl From<Time> for Value {
    fn from(value: Time) -> Self {
        Value::Time(value)
    }
}

impl From<RecordValue> for Value {
    fn from(value: RecordValue) -> Self {
        Value::Record(value)
    }
}

impl From<DictionaryValue> for Value {
    fn from(value: DictionaryValue) -> Self {
        Value::Dictionary(value)
    }
}

impl Value {
    pub fn boolean(value: bool) -> Self {
        Value::Number(if value { 1.0 } else { 0.0 }, NumberHint::Boolean)
    }

    pub fn number(value: f64) -> Self {
        Value::Number(value, NumberHint::Plain)
    }

    /// Name of the variant as shown in error messages and by `typeof`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Number(..) => "Number",
            Value::Text(_) => "Text",
            Value::Array(_) => "Array",
            Value::Dictionary(_) => "Dictionary",
            Value::Block(_) => "Block",
            Value::Time(_) => "Time",
            Value::Record(_) => "Record",
            Value::Function(_) => "Function",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Deep copy. Owned records are copied; record references stay references.
    pub fn duplicate(&self) -> Result<Value> {
        Ok(match self {
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(Value::duplicate)
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::Dictionary(dict) => Value::Dictionary(dict.duplicate()?),
            Value::Record(record) => Value::Record(record.duplicate()?),
            other => other.clone(),
        })
    }

    pub fn as_text(&self) -> String {
        match self {
            Value::None => "None".to_string(),
            Value::Number(n, hint) => format_number(*n, *hint),
            Value::Text(text) => text.clone(),
            Value::Array(items) => {
                let parts: Vec<String> = items.iter().map(Value::repr).collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Dictionary(dict) => {
                let parts: Vec<String> = dict
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.repr(), v.repr()))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Block(bytes) => format!("(Block of {} bytes)", bytes.len()),
            Value::Time(time) => time.as_text(),
            Value::Record(record) => match record.with(|r| r.as_text()) {
                Ok(text) => text,
                Err(_) => "(dangling record)".to_string(),
            },
            Value::Function(function) => function.describe(),
        }
    }

    /// Text form inside containers: text is quoted.
    pub fn repr(&self) -> String {
        match self {
            Value::Text(text) => quote_text(text),
            Value::Record(record) => match record.with(|r| r.id()) {
                Ok(id) => format!("(Record {:x})", id),
                Err(_) => "(dangling record)".to_string(),
            },
            other => other.as_text(),
        }
    }

    pub fn as_number(&self) -> Result<f64> {
        match self {
            Value::Number(n, _) => Ok(*n),
            Value::Text(text) => parse_number(text).ok_or_else(|| {
                Error::Type(format!("cannot convert Text '{}' to Number", text))
            }),
            other => Err(Error::Type(format!(
                "cannot convert {} to Number",
                other.type_name()
            ))),
        }
    }

    pub fn is_true(&self) -> bool {
        match self {
            Value::None => false,
            Value::Number(n, _) => *n != 0.0,
            Value::Text(text) => text.chars().any(|c| !c.is_whitespace()),
            Value::Array(items) => !items.is_empty(),
            Value::Dictionary(dict) => !dict.is_empty(),
            Value::Block(bytes) => !bytes.is_empty(),
            Value::Time(time) => time.is_valid(),
            Value::Record(_) | Value::Function(_) => true,
        }
    }

    /// Number of elements, for values that have them.
    pub fn size(&self) -> Result<usize> {
        match self {
            Value::Text(text) => Ok(text.chars().count()),
            Value::Array(items) => Ok(items.len()),
            Value::Dictionary(dict) => Ok(dict.len()),
            Value::Block(bytes) => Ok(bytes.len()),
            Value::Record(record) => record.with(|r| r.len()),
            other => Err(Error::Type(format!("{} has no size", other.type_name()))),
        }
    }

    /// Ordering between two values of the same variant.
    pub fn compare(&self, other: &Value) -> Result<Ordering> {
        match (self, other) {
            (Value::None, Value::None) => Ok(Ordering::Equal),
            (Value::Number(a, _), Value::Number(b, _)) => {
                Ok(a.partial_cmp(b).unwrap_or(Ordering::Equal))
            }
            (Value::Text(a), Value::Text(b)) => Ok(a.cmp(b)),
            (Value::Time(a), Value::Time(b)) => Ok(a.compare(b)),
            (Value::Block(a), Value::Block(b)) => Ok(a.cmp(b)),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b) {
                    match x.compare(y)? {
                        Ordering::Equal => continue,
                        unequal => return Ok(unequal),
                    }
                }
                Ok(a.len().cmp(&b.len()))
            }
            (a, b) => Err(Error::Type(format!(
                "cannot compare {} with {}",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    /// Script-level `==`. Different variants are never equal; records and
    /// functions compare by identity.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Number(a, _), Value::Number(b, _)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Time(a), Value::Time(b)) => a.compare(b) == Ordering::Equal,
            (Value::Block(a), Value::Block(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equals(y))
            }
            (Value::Dictionary(a), Value::Dictionary(b)) => a.equals(b),
            (Value::Record(a), Value::Record(b)) => a.same_record(b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Membership test for `needle in self`.
    pub fn contains(&self, needle: &Value) -> Result<bool> {
        match self {
            Value::Array(items) => Ok(items.iter().any(|item| item.equals(needle))),
            Value::Dictionary(dict) => Ok(dict.contains(needle)),
            Value::Text(text) => match needle {
                Value::Text(sub) => Ok(text.contains(sub.as_str())),
                other => Err(Error::Type(format!(
                    "cannot look for {} in Text",
                    other.type_name()
                ))),
            },
            Value::Record(record) => {
                let name = needle.as_text();
                record.with(|r| r.has(&name))
            }
            other => Err(Error::Type(format!(
                "{} does not contain elements",
                other.type_name()
            ))),
        }
    }

    /// `self[index]`.
    pub fn element(&self, index: &Value) -> Result<Value> {
        match self {
            Value::Array(items) => {
                let at = resolve_index(index, items.len(), "Array")?;
                Ok(items[at].clone())
            }
            Value::Text(text) => {
                let chars: Vec<char> = text.chars().collect();
                let at = resolve_index(index, chars.len(), "Text")?;
                Ok(Value::Text(chars[at].to_string()))
            }
            Value::Block(bytes) => {
                let at = resolve_index(index, bytes.len(), "Block")?;
                Ok(Value::number(bytes[at] as f64))
            }
            Value::Dictionary(dict) => dict.element(index).cloned().ok_or_else(|| {
                Error::NotFound(format!("key {} not found in Dictionary", index.repr()))
            }),
            Value::Record(record) => {
                let name = index.as_text();
                record.with(|r| r.value(&name))?
            }
            other => Err(Error::Type(format!(
                "{} cannot be indexed",
                other.type_name()
            ))),
        }
    }

    /// `self[index] = value`.
    pub fn set_element(&mut self, index: &Value, value: Value) -> Result<()> {
        match self {
            Value::Array(items) => {
                let at = resolve_index(index, items.len(), "Array")?;
                items[at] = value;
                Ok(())
            }
            Value::Dictionary(dict) => {
                dict.insert(index.clone(), value);
                Ok(())
            }
            Value::Record(record) => {
                let name = index.as_text();
                record.with_mut(|r| r.set(&name, value))?
            }
            other => Err(Error::Type(format!(
                "cannot assign to an element of {}",
                other.type_name()
            ))),
        }
    }

    /// Mutable access to an element, for nested element assignment.
    pub fn element_mut(&mut self, index: &Value) -> Result<&mut Value> {
        match self {
            Value::Array(items) => {
                let at = resolve_index(index, items.len(), "Array")?;
                Ok(&mut items[at])
            }
            Value::Dictionary(dict) => dict.element_mut(index).ok_or_else(|| {
                Error::NotFound(format!("key {} not found in Dictionary", index.repr()))
            }),
            other => Err(Error::Type(format!(
                "cannot assign inside an element of {}",
                other.type_name()
            ))),
        }
    }

    /// `del self[index]`.
    pub fn remove_element(&mut self, index: &Value) -> Result<()> {
        match self {
            Value::Array(items) => {
                let at = resolve_index(index, items.len(), "Array")?;
                items.remove(at);
                Ok(())
            }
            Value::Dictionary(dict) => {
                if dict.remove(index).is_none() {
                    return Err(Error::NotFound(format!(
                        "key {} not found in Dictionary",
                        index.repr()
                    )));
                }
                Ok(())
            }
            other => Err(Error::Type(format!(
                "cannot delete an element of {}",
                other.type_name()
            ))),
        }
    }

    /// `self[start:end]`; missing bounds select from the beginning/to the end.
    pub fn slice(&self, start: Option<&Value>, end: Option<&Value>) -> Result<Value> {
        let len = match self {
            Value::Array(items) => items.len(),
            Value::Text(text) => text.chars().count(),
            Value::Block(bytes) => bytes.len(),
            other => {
                return Err(Error::Type(format!(
                    "{} cannot be sliced",
                    other.type_name()
                )));
            }
        };
        let from = match start {
            Some(v) => clamp_index(v, len)?,
            None => 0,
        };
        let to = match end {
            Some(v) => clamp_index(v, len)?,
            None => len,
        }
        .max(from);
        Ok(match self {
            Value::Array(items) => Value::Array(items[from..to].to_vec()),
            Value::Text(text) => Value::Text(text.chars().skip(from).take(to - from).collect()),
            Value::Block(bytes) => Value::Block(bytes[from..to].to_vec()),
            _ => Value::None,
        })
    }

    pub fn as_record(&self) -> Result<&RecordValue> {
        match self {
            Value::Record(record) => Ok(record),
            other => Err(Error::Type(format!(
                "expected a Record, got {}",
                other.type_name()
            ))),
        }
    }
}

/// Structural equality, used by tests and round-trip checks. Records compare
/// by content rather than identity.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a, ha), Value::Number(b, hb)) => a == b && ha == hb,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Dictionary(a), Value::Dictionary(b)) => {
                a.comparison() == b.comparison()
                    && a.len() == b.len()
                    && a.iter().zip(b.iter()).all(|(x, y)| x.0 == y.0 && x.1 == y.1)
            }
            (Value::Record(a), Value::Record(b)) => a.same_contents(b),
            (Value::Time(a), Value::Time(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b) || **a == **b,
            (a, b) => a.equals(b),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_text())
    }
}

pub(crate) fn format_number(n: f64, hint: NumberHint) -> String {
    match hint {
        NumberHint::Boolean => (if n != 0.0 { "True" } else { "False" }).to_string(),
        NumberHint::Hex if n >= 0.0 && n.fract() == 0.0 && n < 1.8e19 => {
            format!("0x{:x}", n as u64)
        }
        _ => {
            if n.is_nan() {
                "NaN".to_string()
            } else if n.is_infinite() {
                (if n > 0.0 { "Inf" } else { "-Inf" }).to_string()
            } else if n.fract() == 0.0 && n.abs() < 1e16 {
                format!("{}", n as i64)
            } else {
                format!("{}", n)
            }
        }
    }
}

/// Parses decimal or `0x` hexadecimal text.
pub(crate) fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        return u64::from_str_radix(hex, 16).ok().map(|n| n as f64);
    }
    match text {
        "True" => Some(1.0),
        "False" => Some(0.0),
        _ => text.parse::<f64>().ok().filter(|n| !n.is_nan() || text == "NaN"),
    }
}

/// Single-quoted text literal that the tokenizer reads back unchanged.
pub(crate) fn quote_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\x{:02x}", c as u32))
            }
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn index_number(index: &Value, what: &str) -> Result<i64> {
    match index {
        Value::Number(n, _) if n.fract() == 0.0 => Ok(*n as i64),
        other => Err(Error::Type(format!(
            "{} index must be an integer Number, got {}",
            what,
            other.repr()
        ))),
    }
}

/// Negative indices count from the end.
fn resolve_index(index: &Value, len: usize, what: &str) -> Result<usize> {
    let raw = index_number(index, what)?;
    let at = if raw < 0 { raw + len as i64 } else { raw };
    if at < 0 || at >= len as i64 {
        return Err(Error::NotFound(format!(
            "index {} out of range for {} of size {}",
            raw, what, len
        )));
    }
    Ok(at as usize)
}

fn clamp_index(index: &Value, len: usize) -> Result<usize> {
    let raw = index_number(index, "slice")?;
    let at = if raw < 0 { raw + len as i64 } else { raw };
    Ok(at.clamp(0, len as i64) as usize)
}

/// How dictionary keys are matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyComparison {
    #[default]
    CaseSensitive,
    CaseInsensitive,
}

/// Insertion-ordered key/value mapping.
///
/// Every lookup goes through [`DictionaryValue::find`], so membership tests
/// and element access always agree.
#[derive(Debug, Clone, Default)]
pub struct DictionaryValue {
    entries: Vec<(Value, Value)>,
    comparison: KeyComparison,
}

impl DictionaryValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_comparison(comparison: KeyComparison) -> Self {
        DictionaryValue {
            entries: Vec::new(),
            comparison,
        }
    }

    pub fn comparison(&self) -> KeyComparison {
        self.comparison
    }

    pub fn set_comparison(&mut self, comparison: KeyComparison) {
        self.comparison = comparison;
    }

    fn keys_match(&self, a: &Value, b: &Value) -> bool {
        match (self.comparison, a, b) {
            (KeyComparison::CaseInsensitive, Value::Text(x), Value::Text(y)) => {
                x.to_lowercase() == y.to_lowercase()
            }
            _ => a.equals(b),
        }
    }

    pub fn find(&self, key: &Value) -> Option<usize> {
        self.entries.iter().position(|(k, _)| self.keys_match(k, key))
    }

    pub fn contains(&self, key: &Value) -> bool {
        self.find(key).is_some()
    }

    pub fn element(&self, key: &Value) -> Option<&Value> {
        self.find(key).map(|at| &self.entries[at].1)
    }

    pub fn element_mut(&mut self, key: &Value) -> Option<&mut Value> {
        let at = self.find(key)?;
        Some(&mut self.entries[at].1)
    }

    /// Replaces the value of an existing key in place, keeping its position.
    pub fn insert(&mut self, key: Value, value: Value) {
        match self.find(&key) {
            Some(at) => self.entries[at].1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &Value) -> Option<Value> {
        let at = self.find(key)?;
        Some(self.entries.remove(at).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> Vec<Value> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.entries.iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn duplicate(&self) -> Result<DictionaryValue> {
        let mut entries = Vec::with_capacity(self.entries.len());
        for (k, v) in &self.entries {
            entries.push((k.duplicate()?, v.duplicate()?));
        }
        Ok(DictionaryValue {
            entries,
            comparison: self.comparison,
        })
    }

    /// Same keys mapping to equal values, in any order.
    pub fn equals(&self, other: &DictionaryValue) -> bool {
        self.len() == other.len()
            && self
                .entries
                .iter()
                .all(|(k, v)| other.element(k).is_some_and(|o| o.equals(v)))
    }

    /// Adds all entries of `other`, overwriting existing keys.
    pub fn merge(&mut self, other: &DictionaryValue) {
        for (k, v) in &other.entries {
            self.insert(k.clone(), v.clone());
        }
    }
}

impl FromIterator<(Value, Value)> for DictionaryValue {
    fn from_iter<I: IntoIterator<Item = (Value, Value)>>(iter: I) -> Self {
        let mut dict = DictionaryValue::new();
        for (k, v) in iter {
            dict.insert(k, v);
        }
        dict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Value {
        Value::from(s)
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::None.is_true());
        assert!(!Value::number(0.0).is_true());
        assert!(Value::number(-2.0).is_true());
        assert!(!text("   ").is_true());
        assert!(text(" x ").is_true());
        assert!(!Value::Array(vec![]).is_true());
        assert!(!Value::Dictionary(DictionaryValue::new()).is_true());
    }

    #[test]
    fn test_number_text() {
        assert_eq!(Value::number(3.0).as_text(), "3");
        assert_eq!(Value::number(2.5).as_text(), "2.5");
        assert_eq!(Value::boolean(true).as_text(), "True");
        assert_eq!(Value::Number(255.0, NumberHint::Hex).as_text(), "0xff");
        assert_eq!(text("0x10").as_number().unwrap(), 16.0);
        assert!(text("abc").as_number().is_err());
    }

    #[test]
    fn test_container_text() {
        let value = Value::Array(vec![Value::number(1.0), text("a'b")]);
        assert_eq!(value.as_text(), "[1, 'a\\'b']");
        let dict: DictionaryValue = [(text("k"), Value::None)].into_iter().collect();
        assert_eq!(Value::Dictionary(dict).as_text(), "{'k': None}");
    }

    #[test]
    fn test_cross_variant_rules() {
        assert!(!Value::number(1.0).equals(&text("1")));
        assert!(Value::number(1.0).compare(&text("1")).is_err());
        assert_eq!(
            text("a").compare(&text("b")).unwrap(),
            Ordering::Less
        );
    }

    #[test]
    fn test_case_insensitive_dictionary_lookup_agrees() {
        let mut dict = DictionaryValue::with_comparison(KeyComparison::CaseInsensitive);
        dict.insert(text("Key"), Value::number(1.0));
        for probe in ["key", "KEY", "Key", "other"] {
            let key = text(probe);
            assert_eq!(dict.contains(&key), dict.element(&key).is_some());
        }
        assert!(dict.contains(&text("kEy")));
        dict.insert(text("KEY"), Value::number(2.0));
        assert_eq!(dict.len(), 1);

        dict.set_comparison(KeyComparison::CaseSensitive);
        assert!(!dict.contains(&text("key")));
        assert_eq!(dict.contains(&text("key")), dict.element(&text("key")).is_some());
    }

    #[test]
    fn test_indexing_and_slicing() {
        let array = Value::Array((1..=5).map(|n| Value::from(n as i64)).collect());
        assert_eq!(array.element(&Value::from(-1i64)).unwrap(), Value::from(5i64));
        assert!(array.element(&Value::from(5i64)).is_err());
        assert_eq!(
            array
                .slice(Some(&Value::from(1i64)), Some(&Value::from(3i64)))
                .unwrap()
                .as_text(),
            "[2, 3]"
        );
        assert_eq!(
            text("hello").slice(None, Some(&Value::from(-2i64))).unwrap(),
            text("hel")
        );
    }

    #[test]
    fn test_duplicate_is_deep() {
        let original = Value::Array(vec![Value::Array(vec![Value::number(1.0)])]);
        let mut copy = original.duplicate().unwrap();
        copy.element_mut(&Value::from(0i64))
            .unwrap()
            .set_element(&Value::from(0i64), Value::number(9.0))
            .unwrap();
        assert_eq!(original.as_text(), "[[1]]");
        assert_eq!(copy.as_text(), "[[9]]");
    }
}
