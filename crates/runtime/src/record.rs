//! Records: ordered collections of variables
//!
//! A [`Record`] maps unique names to [`Variable`]s in insertion order. Nested
//! records are stored as variables holding an owning [`RecordValue`].
//! Records live behind [`RecordRef`] handles; every other holder keeps a weak
//! reference, so using a record after its owner dropped it is reported as a
//! `Null` error instead of touching freed state.

use crate::error::{Error, Result};
use crate::function::{Function, NativeEntry};
use crate::value::{DictionaryValue, Value};
use crate::variable::Variable;
use quill_core::{Audience, Time};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

pub type RecordRef = Rc<RefCell<Record>>;

/// Array member listing the records a record inherits members from.
pub const SUPER_NAME: &str = "__super__";

pub type MemberObserver = dyn Fn(&Record, &Variable);
pub type RecordDeletionObserver = dyn Fn(&Record);

fn next_record_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

pub struct Record {
    id: u64,
    members: Vec<Variable>,
    index: HashMap<String, usize>,
    additions: Audience<MemberObserver>,
    removals: Audience<MemberObserver>,
    deletion: Audience<RecordDeletionObserver>,
}

impl Record {
    pub fn new() -> Self {
        Record {
            id: next_record_id(),
            members: Vec::new(),
            index: HashMap::new(),
            additions: Audience::new(),
            removals: Audience::new(),
            deletion: Audience::new(),
        }
    }

    pub fn new_ref() -> RecordRef {
        Rc::new(RefCell::new(Record::new()))
    }

    pub fn into_ref(self) -> RecordRef {
        Rc::new(RefCell::new(self))
    }

    /// Process-unique identity, stable for the record's lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn has(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.index.get(name).map(|&at| &self.members[at])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Variable> {
        let at = *self.index.get(name)?;
        Some(&mut self.members[at])
    }

    pub fn member(&self, name: &str) -> Result<&Variable> {
        self.get(name)
            .ok_or_else(|| Error::NotFound(format!("'{}' not found", name)))
    }

    /// Copy of a member's value.
    pub fn value(&self, name: &str) -> Result<Value> {
        Ok(self.member(name)?.value().clone())
    }

    /// Adds a variable, replacing (and removing) any member of the same name.
    pub fn add(&mut self, variable: Variable) -> &mut Variable {
        if self.has(variable.name()) {
            let name = variable.name().to_string();
            self.remove_member(&name);
        }
        let at = self.members.len();
        self.index.insert(variable.name().to_string(), at);
        self.members.push(variable);
        let this: &Record = self;
        let added = &this.members[at];
        this.additions.notify(|observer| observer(this, added));
        &mut self.members[at]
    }

    /// Sets an existing member (checking its mode) or adds a new one.
    pub fn set(&mut self, name: &str, value: Value) -> Result<()> {
        match self.get_mut(name) {
            Some(variable) => variable.set(value),
            None => {
                self.add(Variable::new(name, value));
                Ok(())
            }
        }
    }

    pub fn add_number(&mut self, name: &str, number: f64) -> &mut Variable {
        self.add(Variable::new(name, Value::number(number)))
    }

    pub fn add_boolean(&mut self, name: &str, value: bool) -> &mut Variable {
        self.add(Variable::new(name, Value::boolean(value)))
    }

    pub fn add_text(&mut self, name: &str, text: impl Into<String>) -> &mut Variable {
        self.add(Variable::new(name, Value::Text(text.into())))
    }

    pub fn add_array(&mut self, name: &str, items: Vec<Value>) -> &mut Variable {
        self.add(Variable::new(name, Value::Array(items)))
    }

    pub fn add_dictionary(&mut self, name: &str, dict: DictionaryValue) -> &mut Variable {
        self.add(Variable::new(name, Value::Dictionary(dict)))
    }

    pub fn add_block(&mut self, name: &str, bytes: Vec<u8>) -> &mut Variable {
        self.add(Variable::new(name, Value::Block(bytes)))
    }

    pub fn add_time(&mut self, name: &str, time: Time) -> &mut Variable {
        self.add(Variable::new(name, Value::Time(time)))
    }

    pub fn add_function(&mut self, name: &str, function: Rc<Function>) -> &mut Variable {
        self.add(Variable::new(name, Value::Function(function)))
    }

    /// Adds a native function member under `name`.
    pub fn add_native(&mut self, name: &str, entry: NativeEntry) -> &mut Variable {
        let function = Function::native(name, entry);
        self.add_function(name, Rc::new(function))
    }

    /// Adds `record` as an owned subrecord and returns its handle.
    pub fn add_subrecord(&mut self, name: &str, record: Record) -> RecordRef {
        let handle = record.into_ref();
        self.add(Variable::new(
            name,
            Value::Record(RecordValue::owning(Rc::clone(&handle))),
        ));
        handle
    }

    /// Fetches the subrecord `name`, creating an empty one if the member does
    /// not exist.
    pub fn subrecord(&mut self, name: &str) -> Result<RecordRef> {
        match self.get(name) {
            Some(variable) => match variable.value() {
                Value::Record(rv) => rv.dereference(),
                other => Err(Error::Type(format!(
                    "member '{}' is {}, not a Record",
                    name,
                    other.type_name()
                ))),
            },
            None => Ok(self.add_subrecord(name, Record::new())),
        }
    }

    pub fn has_subrecord(&self, name: &str) -> bool {
        matches!(
            self.get(name).map(Variable::value),
            Some(Value::Record(rv)) if rv.is_owner()
        )
    }

    /// Removes a member. Observers of the removal see the variable before it
    /// is dropped; its own deletion observers fire as it drops.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        if self.remove_member(name) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("'{}' not found", name)))
        }
    }

    fn remove_member(&mut self, name: &str) -> bool {
        let Some(at) = self.index.get(name).copied() else {
            return false;
        };
        {
            let this: &Record = self;
            let leaving = &this.members[at];
            this.removals.notify(|observer| observer(this, leaving));
        }
        self.index.remove(name);
        let removed = self.members.remove(at);
        for slot in self.index.values_mut() {
            if *slot > at {
                *slot -= 1;
            }
        }
        drop(removed);
        true
    }

    /// Removes every member, in insertion order.
    pub fn clear(&mut self) {
        while let Some(name) = self.members.first().map(|v| v.name().to_string()) {
            self.remove_member(&name);
        }
    }

    /// Members in insertion order.
    pub fn members(&self) -> impl Iterator<Item = &Variable> {
        self.members.iter()
    }

    pub fn member_names(&self) -> Vec<String> {
        self.members.iter().map(|v| v.name().to_string()).collect()
    }

    /// Owned subrecords in insertion order.
    pub fn subrecords(&self) -> Vec<(String, RecordRef)> {
        self.members
            .iter()
            .filter_map(|v| match v.value() {
                Value::Record(rv) if rv.is_owner() => rv
                    .dereference()
                    .ok()
                    .map(|r| (v.name().to_string(), r)),
                _ => None,
            })
            .collect()
    }

    /// Live records listed in `__super__`, in order.
    pub fn super_records(&self) -> Vec<RecordRef> {
        match self.get(SUPER_NAME).map(Variable::value) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| match item {
                    Value::Record(rv) => rv.dereference().ok(),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Appends a reference to `base` to `__super__` unless it is listed.
    pub fn add_super_record(&mut self, base: &RecordRef) -> Result<()> {
        let mut supers = match self.get(SUPER_NAME).map(Variable::value) {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => {
                return Err(Error::Type(format!(
                    "'{}' is {}, not an Array",
                    SUPER_NAME,
                    other.type_name()
                )));
            }
            None => Vec::new(),
        };
        let listed = supers.iter().any(|item| match item {
            Value::Record(rv) => rv.dereference().is_ok_and(|r| Rc::ptr_eq(&r, base)),
            _ => false,
        });
        if listed {
            return Ok(());
        }
        supers.push(Value::Record(RecordValue::reference(base)));
        self.set(SUPER_NAME, Value::Array(supers))
    }

    /// Value at a dotted path such as `window.size.width`.
    pub fn value_at_path(&self, path: &str) -> Result<Value> {
        match path.split_once('.') {
            None => self.value(path),
            Some((head, rest)) => {
                let record = self.member(head)?.value().as_record()?.dereference()?;
                let record = record.try_borrow().map_err(|_| busy(head))?;
                record.value_at_path(rest)
            }
        }
    }

    /// Sets a dotted path, creating intermediate subrecords as needed.
    pub fn set_path(&mut self, path: &str, value: Value) -> Result<()> {
        match path.split_once('.') {
            None => self.set(path, value),
            Some((head, rest)) => {
                let record = self.subrecord(head)?;
                let mut record = record.try_borrow_mut().map_err(|_| busy(head))?;
                record.set_path(rest, value)
            }
        }
    }

    /// Deep copy of all members. Observers are not copied.
    pub fn duplicate(&self) -> Result<Record> {
        let mut copy = Record::new();
        for variable in &self.members {
            copy.add(variable.duplicate()?);
        }
        Ok(copy)
    }

    /// Copies members of `other` into this record, replacing same-named ones.
    pub fn copy_members_from(&mut self, other: &Record) -> Result<()> {
        for variable in &other.members {
            self.add(variable.duplicate()?);
        }
        Ok(())
    }

    pub fn audience_for_addition(&mut self) -> &mut Audience<MemberObserver> {
        &mut self.additions
    }

    pub fn audience_for_removal(&mut self) -> &mut Audience<MemberObserver> {
        &mut self.removals
    }

    pub fn audience_for_deletion(&mut self) -> &mut Audience<RecordDeletionObserver> {
        &mut self.deletion
    }

    /// Multi-line `name: value` listing; subrecords are listed with dotted
    /// prefixes.
    pub fn as_text(&self) -> String {
        let mut lines = Vec::new();
        self.collect_lines("", &mut lines);
        lines.join("\n")
    }

    fn collect_lines(&self, prefix: &str, lines: &mut Vec<String>) {
        for variable in &self.members {
            let name = format!("{}{}", prefix, variable.name());
            match variable.value() {
                Value::Record(rv) if rv.is_owner() => {
                    match rv.with(|r| r.collect_lines(&format!("{}.", name), lines)) {
                        Ok(()) => {}
                        Err(_) => lines.push(format!("{}: (busy record)", name)),
                    }
                }
                value => lines.push(format!("{}: {}", name, value.repr())),
            }
        }
    }
}

impl Default for Record {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Record {
    fn drop(&mut self) {
        let this: &Record = self;
        this.deletion.notify(|observer| observer(this));
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("id", &self.id)
            .field("members", &self.member_names())
            .finish()
    }
}

fn busy(name: &str) -> Error {
    Error::Illegal(format!("record '{}' is already in use", name))
}

/// Looks `name` up in `record`, then depth-first through its super records.
/// Each record is visited once, so cyclic `__super__` lists end.
pub fn inherited_member(record: &RecordRef, name: &str) -> Result<Option<Value>> {
    let mut pending = vec![Rc::clone(record)];
    let mut visited = Vec::new();
    while let Some(next) = pending.pop() {
        if visited.contains(&Rc::as_ptr(&next)) {
            continue;
        }
        visited.push(Rc::as_ptr(&next));
        let current = next.try_borrow().map_err(|_| busy(name))?;
        if let Some(variable) = current.get(name) {
            return Ok(Some(variable.value().clone()));
        }
        pending.extend(current.super_records().into_iter().rev());
    }
    Ok(None)
}

/// A record as a value: either the owner of a record or a weak reference to
/// one owned elsewhere.
pub struct RecordValue {
    target: Weak<RefCell<Record>>,
    owned: Option<RecordRef>,
}

impl RecordValue {
    pub fn owning(record: RecordRef) -> Self {
        RecordValue {
            target: Rc::downgrade(&record),
            owned: Some(record),
        }
    }

    pub fn new_owned(record: Record) -> Self {
        Self::owning(record.into_ref())
    }

    pub fn reference(record: &RecordRef) -> Self {
        RecordValue {
            target: Rc::downgrade(record),
            owned: None,
        }
    }

    pub fn is_owner(&self) -> bool {
        self.owned.is_some()
    }

    pub fn is_alive(&self) -> bool {
        self.target.strong_count() > 0
    }

    /// Strong handle to the record, or a `Null` error if it no longer exists.
    pub fn dereference(&self) -> Result<RecordRef> {
        self.target
            .upgrade()
            .ok_or_else(|| Error::Null("record no longer exists".to_string()))
    }

    pub fn with<R>(&self, f: impl FnOnce(&Record) -> R) -> Result<R> {
        let record = self.dereference()?;
        let borrowed = record
            .try_borrow()
            .map_err(|_| Error::Illegal("record is being modified".to_string()))?;
        Ok(f(&borrowed))
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Record) -> R) -> Result<R> {
        let record = self.dereference()?;
        let mut borrowed = record
            .try_borrow_mut()
            .map_err(|_| Error::Illegal("record is already in use".to_string()))?;
        Ok(f(&mut borrowed))
    }

    pub fn same_record(&self, other: &RecordValue) -> bool {
        Weak::ptr_eq(&self.target, &other.target)
    }

    /// Same members with structurally equal values.
    pub fn same_contents(&self, other: &RecordValue) -> bool {
        if self.same_record(other) {
            return true;
        }
        let (Ok(a), Ok(b)) = (self.dereference(), other.dereference()) else {
            return false;
        };
        let (Ok(a), Ok(b)) = (a.try_borrow(), b.try_borrow()) else {
            return false;
        };
        a.len() == b.len()
            && a.members().zip(b.members()).all(|(x, y)| {
                x.name() == y.name() && x.mode() == y.mode() && x.value() == y.value()
            })
    }

    /// Owned records are copied deeply; references stay references.
    pub fn duplicate(&self) -> Result<RecordValue> {
        if self.is_owner() {
            let copy = self.with(|r| r.duplicate())??;
            Ok(RecordValue::new_owned(copy))
        } else {
            Ok(self.clone())
        }
    }
}

/// Clones are always non-owning references.
impl Clone for RecordValue {
    fn clone(&self) -> Self {
        RecordValue {
            target: self.target.clone(),
            owned: None,
        }
    }
}

impl fmt::Debug for RecordValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.target.upgrade().and_then(|r| r.try_borrow().ok().map(|r| r.id()));
        f.debug_struct("RecordValue")
            .field("id", &id)
            .field("owned", &self.is_owner())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variable::Mode;

    #[test]
    fn test_insertion_order_and_unique_names() {
        let mut record = Record::new();
        record.add_number("b", 1.0);
        record.add_text("a", "x");
        record.add_number("b", 2.0);
        assert_eq!(record.member_names(), vec!["a", "b"]);
        assert_eq!(record.value("b").unwrap(), Value::number(2.0));
    }

    #[test]
    fn test_set_respects_mode() {
        let mut record = Record::new();
        record.add_number("n", 1.0).set_mode(Mode::ALLOW_NUMBER);
        assert!(matches!(
            record.set("n", Value::from("x")),
            Err(Error::Invalid(_))
        ));
        record.set("fresh", Value::from("x")).unwrap();
        assert_eq!(record.len(), 2);
    }

    #[test]
    fn test_member_audiences() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut record = Record::new();
        let l = Rc::clone(&log);
        record
            .audience_for_addition()
            .add(Rc::new(move |_, v| l.borrow_mut().push(format!("+{}", v.name()))));
        let l = Rc::clone(&log);
        record
            .audience_for_removal()
            .add(Rc::new(move |_, v| l.borrow_mut().push(format!("-{}", v.name()))));

        let l = Rc::clone(&log);
        record
            .add_number("x", 1.0)
            .audience_for_deletion()
            .add(Rc::new(move |v| l.borrow_mut().push(format!("~{}", v.name()))));
        record.remove("x").unwrap();
        assert!(record.remove("x").is_err());
        assert_eq!(*log.borrow(), vec!["+x", "-x", "~x"]);
    }

    #[test]
    fn test_subrecords_and_paths() {
        let mut root = Record::new();
        root.set_path("window.size.width", Value::number(640.0)).unwrap();
        root.add_number("scale", 2.0);
        assert!(root.has_subrecord("window"));
        assert_eq!(
            root.value_at_path("window.size.width").unwrap(),
            Value::number(640.0)
        );
        assert_eq!(root.subrecords().len(), 1);
        assert_eq!(root.as_text(), "window.size.width: 640\nscale: 2");

        root.add_text("label", "hi");
        assert!(root.subrecord("label").is_err());
    }

    #[test]
    fn test_reference_detects_dropped_record() {
        let mut root = Record::new();
        let child = root.subrecord("child").unwrap();
        let reference = RecordValue::reference(&child);
        drop(child);
        assert!(reference.is_alive());
        root.remove("child").unwrap();
        assert!(!reference.is_alive());
        assert!(matches!(reference.dereference(), Err(Error::Null(_))));
    }

    #[test]
    fn test_clone_is_reference_duplicate_is_copy() {
        let owner = RecordValue::new_owned(Record::new());
        owner.with_mut(|r| { r.add_number("v", 1.0); }).unwrap();

        let reference = owner.clone();
        assert!(!reference.is_owner());
        assert!(reference.same_record(&owner));

        let copy = owner.duplicate().unwrap();
        assert!(copy.is_owner());
        assert!(!copy.same_record(&owner));
        assert!(copy.same_contents(&owner));

        copy.with_mut(|r| r.set("v", Value::number(5.0))).unwrap().unwrap();
        assert_eq!(owner.with(|r| r.value("v")).unwrap().unwrap(), Value::number(1.0));
    }

    #[test]
    fn test_super_records_lookup() {
        let base = Record::new_ref();
        base.borrow_mut().add_text("kind", "base");
        base.borrow_mut().add_number("size", 1.0);
        let mixin = Record::new_ref();
        mixin.borrow_mut().add_text("kind", "mixin");
        mixin.borrow_mut().add_boolean("shiny", true);

        let item = Record::new_ref();
        item.borrow_mut().add_number("size", 3.0);
        item.borrow_mut().add_super_record(&base).unwrap();
        item.borrow_mut().add_super_record(&mixin).unwrap();
        item.borrow_mut().add_super_record(&base).unwrap();
        assert_eq!(item.borrow().super_records().len(), 2);

        assert_eq!(inherited_member(&item, "size").unwrap(), Some(Value::number(3.0)));
        assert_eq!(inherited_member(&item, "kind").unwrap(), Some(Value::from("base")));
        assert_eq!(inherited_member(&item, "shiny").unwrap(), Some(Value::boolean(true)));
        assert_eq!(inherited_member(&item, "missing").unwrap(), None);

        // A cycle through __super__ still terminates.
        base.borrow_mut().add_super_record(&item).unwrap();
        assert_eq!(inherited_member(&base, "missing").unwrap(), None);
        assert_eq!(inherited_member(&base, "shiny").unwrap(), Some(Value::boolean(true)));
    }

    #[test]
    fn test_super_member_must_be_array() {
        let base = Record::new_ref();
        let mut record = Record::new();
        record.add_text(SUPER_NAME, "oops");
        assert!(matches!(record.add_super_record(&base), Err(Error::Type(_))));
    }

    #[test]
    fn test_record_deletion_audience() {
        let deleted = Rc::new(RefCell::new(false));
        let mut record = Record::new();
        let d = Rc::clone(&deleted);
        record
            .audience_for_deletion()
            .add(Rc::new(move |_| *d.borrow_mut() = true));
        drop(record);
        assert!(*deleted.borrow());
    }
}
