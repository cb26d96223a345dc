//! Named, mode-flagged value slots
//!
//! A [`Variable`] holds one [`Value`]. Its [`Mode`] decides whether the value
//! may change and which variants it accepts. Failed assignments leave the
//! variable untouched.

use crate::error::{Error, Result};
use crate::value::{KeyComparison, Value};
use quill_core::Audience;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mode(u32);

impl Mode {
    pub const READ_ONLY: Mode = Mode(0x0001);
    pub const NO_SERIALIZE: Mode = Mode(0x0002);
    pub const ALLOW_NONE: Mode = Mode(0x0004);
    pub const ALLOW_NUMBER: Mode = Mode(0x0008);
    pub const ALLOW_TEXT: Mode = Mode(0x0010);
    pub const ALLOW_ARRAY: Mode = Mode(0x0020);
    pub const ALLOW_DICTIONARY: Mode = Mode(0x0040);
    pub const ALLOW_BLOCK: Mode = Mode(0x0080);
    pub const ALLOW_FUNCTION: Mode = Mode(0x0100);
    pub const ALLOW_RECORD: Mode = Mode(0x0200);
    pub const ALLOW_TIME: Mode = Mode(0x0400);
    /// Dictionaries stored in the variable match text keys ignoring case.
    pub const CASE_INSENSITIVE_KEYS: Mode = Mode(0x0800);

    pub const ALLOW_ALL: Mode = Mode(0x07fc);
    pub const DEFAULT: Mode = Mode::ALLOW_ALL;

    const KNOWN: u32 = 0x0fff;

    pub const fn empty() -> Mode {
        Mode(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Unknown bits are dropped.
    pub const fn from_bits_truncate(bits: u32) -> Mode {
        Mode(bits & Self::KNOWN)
    }

    pub const fn contains(self, other: Mode) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn without(self, other: Mode) -> Mode {
        Mode(self.0 & !other.0)
    }

    /// The `ALLOW_*` flag that admits `value`.
    pub fn allow_flag_for(value: &Value) -> Mode {
        match value {
            Value::None => Mode::ALLOW_NONE,
            Value::Number(..) => Mode::ALLOW_NUMBER,
            Value::Text(_) => Mode::ALLOW_TEXT,
            Value::Array(_) => Mode::ALLOW_ARRAY,
            Value::Dictionary(_) => Mode::ALLOW_DICTIONARY,
            Value::Block(_) => Mode::ALLOW_BLOCK,
            Value::Function(_) => Mode::ALLOW_FUNCTION,
            Value::Record(_) => Mode::ALLOW_RECORD,
            Value::Time(_) => Mode::ALLOW_TIME,
        }
    }

    pub fn allows(self, value: &Value) -> bool {
        self.contains(Mode::allow_flag_for(value))
    }
}

impl Default for Mode {
    fn default() -> Self {
        Mode::DEFAULT
    }
}

impl BitOr for Mode {
    type Output = Mode;

    fn bitor(self, rhs: Mode) -> Mode {
        Mode(self.0 | rhs.0)
    }
}

impl BitOrAssign for Mode {
    fn bitor_assign(&mut self, rhs: Mode) {
        self.0 |= rhs.0;
    }
}

pub type ChangeObserver = dyn Fn(&Variable, &Value);
pub type ChangeFromObserver = dyn Fn(&Variable, &Value, &Value);
pub type DeletionObserver = dyn Fn(&Variable);

pub struct Variable {
    name: String,
    value: Value,
    mode: Mode,
    change: Audience<ChangeObserver>,
    change_from: Audience<ChangeFromObserver>,
    deletion: Audience<DeletionObserver>,
}

impl Variable {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Variable {
            name: name.into(),
            value,
            mode: Mode::DEFAULT,
            change: Audience::new(),
            change_from: Audience::new(),
            deletion: Audience::new(),
        }
    }

    /// Creates a variable whose initial value must satisfy `mode`.
    pub fn with_mode(name: impl Into<String>, value: Value, mode: Mode) -> Result<Self> {
        let mut variable = Variable::new(name, Value::None);
        variable.mode = mode;
        variable.verify_type(&value)?;
        variable.value = value;
        variable.apply_key_comparison();
        Ok(variable)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_read_only(&self) -> bool {
        self.mode.contains(Mode::READ_ONLY)
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
        self.apply_key_comparison();
    }

    pub fn set_read_only(&mut self) {
        self.mode |= Mode::READ_ONLY;
    }

    fn verify_writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(Error::ReadOnly(format!(
                "variable '{}' is read-only",
                self.name
            )));
        }
        Ok(())
    }

    fn verify_type(&self, value: &Value) -> Result<()> {
        if !self.mode.allows(value) {
            return Err(Error::Invalid(format!(
                "variable '{}' does not accept {} values",
                self.name,
                value.type_name()
            )));
        }
        Ok(())
    }

    fn apply_key_comparison(&mut self) {
        if let Value::Dictionary(dict) = &mut self.value {
            if self.mode.contains(Mode::CASE_INSENSITIVE_KEYS) {
                dict.set_comparison(KeyComparison::CaseInsensitive);
            }
        }
    }

    /// Replaces the value and notifies observers.
    pub fn set(&mut self, value: Value) -> Result<()> {
        self.verify_writable()?;
        self.verify_type(&value)?;
        let old = std::mem::replace(&mut self.value, value);
        self.apply_key_comparison();
        let this: &Variable = self;
        this.change.notify(|observer| observer(this, &this.value));
        this.change_from
            .notify(|observer| observer(this, &old, &this.value));
        Ok(())
    }

    /// Modifies the value in place, e.g. one element of an array. The
    /// value's type stays the same, so only writability is checked.
    pub fn update(&mut self, modify: impl FnOnce(&mut Value) -> Result<()>) -> Result<()> {
        self.verify_writable()?;
        let old = self.value.clone();
        modify(&mut self.value)?;
        self.apply_key_comparison();
        let this: &Variable = self;
        this.change.notify(|observer| observer(this, &this.value));
        this.change_from
            .notify(|observer| observer(this, &old, &this.value));
        Ok(())
    }

    pub fn audience_for_change(&mut self) -> &mut Audience<ChangeObserver> {
        &mut self.change
    }

    pub fn audience_for_change_from(&mut self) -> &mut Audience<ChangeFromObserver> {
        &mut self.change_from
    }

    pub fn audience_for_deletion(&mut self) -> &mut Audience<DeletionObserver> {
        &mut self.deletion
    }

    pub fn on_change(&mut self, observer: impl Fn(&Variable, &Value) + 'static) {
        self.change.add(Rc::new(observer));
    }

    /// Independent copy without observers.
    pub fn duplicate(&self) -> Result<Variable> {
        Ok(Variable {
            name: self.name.clone(),
            value: self.value.duplicate()?,
            mode: self.mode,
            change: Audience::new(),
            change_from: Audience::new(),
            deletion: Audience::new(),
        })
    }
}

impl Drop for Variable {
    fn drop(&mut self) {
        let this: &Variable = self;
        this.deletion.notify(|observer| observer(this));
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("name", &self.name)
            .field("value", &self.value)
            .field("mode", &self.mode)
            .finish()
    }
}
