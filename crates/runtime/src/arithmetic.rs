//! Arithmetic on values
//!
//! Each operation either produces a new value or fails with an error naming
//! the operation and both operand variants. Mixed variants are rejected
//! except for the combinations listed per operation.

use crate::error::{Error, Result};
use crate::value::Value;

/// Longest text, in bytes, that `*` and `%` will build.
pub const MAX_TEXT_LEN: usize = 1 << 26;

fn too_long(what: &str) -> Error {
    Error::Arithmetic(format!("{} would exceed {} bytes", what, MAX_TEXT_LEN))
}

fn mismatch(op: &str, a: &Value, b: &Value) -> Error {
    Error::Type(format!(
        "cannot {} {} and {}",
        op,
        a.type_name(),
        b.type_name()
    ))
}

impl Value {
    /// `+`: numbers add, text/arrays/blocks concatenate, dictionaries merge,
    /// times shift by seconds.
    pub fn sum(&self, other: &Value) -> Result<Value> {
        match (self, other) {
            (Value::Number(a, _), Value::Number(b, _)) => Ok(Value::number(a + b)),
            (Value::Text(a), Value::Text(b)) => Ok(Value::Text(format!("{}{}", a, b))),
            (Value::Array(a), Value::Array(b)) => {
                let mut joined = a.clone();
                joined.extend(b.iter().cloned());
                Ok(Value::Array(joined))
            }
            (Value::Dictionary(a), Value::Dictionary(b)) => {
                let mut merged = a.clone();
                merged.merge(b);
                Ok(Value::Dictionary(merged))
            }
            (Value::Block(a), Value::Block(b)) => {
                let mut joined = a.clone();
                joined.extend_from_slice(b);
                Ok(Value::Block(joined))
            }
            (Value::Time(t), Value::Number(secs, _)) => Ok(Value::Time(t.add_seconds(*secs))),
            (a, b) => Err(mismatch("add", a, b)),
        }
    }

    /// `-`: numbers subtract; `Time - Time` is seconds, `Time - Number` shifts.
    pub fn subtract(&self, other: &Value) -> Result<Value> {
        match (self, other) {
            (Value::Number(a, _), Value::Number(b, _)) => Ok(Value::number(a - b)),
            (Value::Time(a), Value::Time(b)) => Ok(Value::number(a.seconds_since(b))),
            (Value::Time(t), Value::Number(secs, _)) => {
                Ok(Value::Time(t.add_seconds(-secs)))
            }
            (a, b) => Err(mismatch("subtract", a, b)),
        }
    }

    /// `*`: numbers multiply; `Text * Number` repeats the text, keeping a
    /// proportional prefix for a fractional factor.
    pub fn multiply(&self, other: &Value) -> Result<Value> {
        match (self, other) {
            (Value::Number(a, _), Value::Number(b, _)) => Ok(Value::number(a * b)),
            (Value::Text(text), Value::Number(factor, _)) => Ok(Value::Text(repeat(text, *factor)?)),
            (a, b) => Err(mismatch("multiply", a, b)),
        }
    }

    /// `/`: numbers divide; `Text / Text` joins file system paths.
    pub fn divide(&self, other: &Value) -> Result<Value> {
        match (self, other) {
            (Value::Number(a, _), Value::Number(b, _)) => {
                if *b == 0.0 {
                    return Err(Error::Arithmetic(format!("division by zero ({} / 0)", a)));
                }
                Ok(Value::number(a / b))
            }
            (Value::Text(a), Value::Text(b)) => Ok(Value::Text(join_path(a, b))),
            (a, b) => Err(mismatch("divide", a, b)),
        }
    }

    /// `%`: integer remainder of numbers; `Text % args` formats.
    pub fn modulo(&self, other: &Value) -> Result<Value> {
        match (self, other) {
            (Value::Number(a, _), Value::Number(b, _)) => {
                let divisor = *b as i64;
                if divisor == 0 {
                    return Err(Error::Arithmetic(format!("modulo by zero ({} % {})", a, b)));
                }
                Ok(Value::number((*a as i64 % divisor) as f64))
            }
            (Value::Text(pattern), Value::Array(args)) => {
                Ok(Value::Text(format_text(pattern, args)?))
            }
            (Value::Text(pattern), arg) => {
                Ok(Value::Text(format_text(pattern, std::slice::from_ref(arg))?))
            }
            (a, b) => Err(mismatch("take the remainder of", a, b)),
        }
    }

    /// Unary `-`.
    pub fn negate(&self) -> Result<Value> {
        match self {
            Value::Number(n, _) => Ok(Value::number(-n)),
            other => Err(Error::Type(format!(
                "cannot negate {}",
                other.type_name()
            ))),
        }
    }
}

/// NaN repeats nothing.
fn repeat(text: &str, factor: f64) -> Result<String> {
    if factor.is_nan() || factor <= 0.0 || text.is_empty() {
        return Ok(String::new());
    }
    let whole = factor.floor();
    // Compared as floats: an infinite or huge factor must not saturate.
    if whole * text.len() as f64 > MAX_TEXT_LEN as f64 {
        return Err(too_long("repeated text"));
    }
    let mut out = text.repeat(whole as usize);
    let chars = text.chars().count();
    let partial = ((factor - whole) * chars as f64).round() as usize;
    out.extend(text.chars().take(partial));
    Ok(out)
}

/// Appends a decimal digit to a width or precision being read.
fn push_digit(value: usize, digit: u32, what: &str) -> Result<usize> {
    value
        .checked_mul(10)
        .and_then(|v| v.checked_add(digit as usize))
        .filter(|&v| v <= MAX_TEXT_LEN)
        .ok_or_else(|| too_long(what))
}

pub(crate) fn join_path(base: &str, tail: &str) -> String {
    if base.is_empty() || tail.starts_with('/') {
        return tail.to_string();
    }
    if tail.is_empty() {
        return base.to_string();
    }
    if base.ends_with('/') {
        format!("{}{}", base, tail)
    } else {
        format!("{}/{}", base, tail)
    }
}

/// printf-style substitution of `%s %d %i %f %x %X %%` with optional `-`,
/// width and `.precision`.
fn format_text(pattern: &str, args: &[Value]) -> Result<String> {
    let mut out = String::with_capacity(pattern.len());
    let mut args = args.iter();
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }
        let mut left_align = false;
        if chars.peek() == Some(&'-') {
            left_align = true;
            chars.next();
        }
        let mut width = 0usize;
        while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
            width = push_digit(width, d, "format width")?;
            chars.next();
        }
        let mut precision = None;
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut p = 0usize;
            while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                p = push_digit(p, d, "format precision")?;
                chars.next();
            }
            precision = Some(p);
        }
        let Some(conversion) = chars.next() else {
            return Err(Error::Type("incomplete format placeholder at end of text".into()));
        };
        let arg = args.next().ok_or_else(|| {
            Error::Type(format!("not enough arguments for format '{}'", pattern))
        })?;
        let field = match conversion {
            's' => {
                let text = arg.as_text();
                match precision {
                    Some(p) => text.chars().take(p).collect(),
                    None => text,
                }
            }
            'd' | 'i' => format!("{}", arg.as_number()?.trunc() as i64),
            'f' => format!("{:.*}", precision.unwrap_or(6), arg.as_number()?),
            'x' => format!("{:x}", arg.as_number()? as i64),
            'X' => format!("{:X}", arg.as_number()? as i64),
            other => {
                return Err(Error::Type(format!(
                    "unknown format placeholder '%{}'",
                    other
                )));
            }
        };
        let pad = width.saturating_sub(field.chars().count());
        if out.len() + field.len() + pad > MAX_TEXT_LEN {
            return Err(too_long("formatted text"));
        }
        if left_align {
            out.push_str(&field);
            out.extend(std::iter::repeat_n(' ', pad));
        } else {
            out.extend(std::iter::repeat_n(' ', pad));
            out.push_str(&field);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::Time;

    fn n(v: f64) -> Value {
        Value::number(v)
    }

    fn t(s: &str) -> Value {
        Value::from(s)
    }

    #[test]
    fn test_number_arithmetic() {
        assert_eq!(n(1.0).sum(&n(2.0)).unwrap(), n(3.0));
        assert_eq!(n(7.0).modulo(&n(3.0)).unwrap(), n(1.0));
        assert_eq!(n(-7.0).modulo(&n(3.0)).unwrap(), n(-1.0));
        assert!(matches!(n(1.0).divide(&n(0.0)), Err(Error::Arithmetic(_))));
        assert!(matches!(n(1.0).modulo(&n(0.5)), Err(Error::Arithmetic(_))));
    }

    #[test]
    fn test_mismatch_names_operation_and_types() {
        let err = n(1.0).sum(&t("x")).unwrap_err();
        assert_eq!(err, Error::Type("cannot add Number and Text".into()));
    }

    #[test]
    fn test_text_operations() {
        assert_eq!(t("ab").sum(&t("cd")).unwrap(), t("abcd"));
        assert_eq!(t("ab").multiply(&n(2.5)).unwrap(), t("ababa"));
        assert_eq!(t("dir").divide(&t("file.qs")).unwrap(), t("dir/file.qs"));
        assert_eq!(t("dir/").divide(&t("/abs")).unwrap(), t("/abs"));
    }

    #[test]
    fn test_text_formatting() {
        let args = Value::Array(vec![t("x"), n(3.7), n(2.0), n(255.0)]);
        assert_eq!(
            t("%s=%d %.2f %x%%").modulo(&args).unwrap(),
            t("x=3 2.00 ff%")
        );
        assert_eq!(t("[%5s|%-3i]").modulo(&Value::Array(vec![t("ab"), n(7.0)])).unwrap(), t("[   ab|7  ]"));
        assert_eq!(t("%s!").modulo(&n(1.0)).unwrap(), t("1!"));
        assert!(t("%s %s").modulo(&t("one")).is_err());
    }

    #[test]
    fn test_oversized_text_results_fail() {
        assert!(matches!(t("ab").multiply(&n(1e300)), Err(Error::Arithmetic(_))));
        assert!(matches!(t("ab").multiply(&n(f64::INFINITY)), Err(Error::Arithmetic(_))));
        assert_eq!(t("ab").multiply(&n(f64::NAN)).unwrap(), t(""));
        assert!(matches!(
            t("%99999999999999999999999s").modulo(&t("x")),
            Err(Error::Arithmetic(_))
        ));
        assert!(matches!(
            t("%.99999999999999999999999f").modulo(&n(1.0)),
            Err(Error::Arithmetic(_))
        ));
        assert!(matches!(t("%999999999s").modulo(&t("x")), Err(Error::Arithmetic(_))));
        assert_eq!(t("%12s").modulo(&t("x")).unwrap().as_text().len(), 12);
    }

    #[test]
    fn test_container_concatenation() {
        let a = Value::Array(vec![n(1.0)]);
        let b = Value::Array(vec![n(2.0)]);
        assert_eq!(a.sum(&b).unwrap().as_text(), "[1, 2]");
        assert_eq!(
            Value::Block(vec![1]).sum(&Value::Block(vec![2])).unwrap(),
            Value::Block(vec![1, 2])
        );
    }

    #[test]
    fn test_time_arithmetic() {
        let start = Value::Time(Time::from_text("2024-01-01").unwrap());
        let later = start.sum(&n(60.0)).unwrap();
        assert_eq!(later.subtract(&start).unwrap(), n(60.0));
        assert_eq!(later.subtract(&n(60.0)).unwrap(), start);
        assert!(n(1.0).sum(&start).is_err());
    }
}
