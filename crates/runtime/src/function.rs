//! Callable values
//!
//! A [`Function`] is either defined by a script (`def`) or supplied by the
//! host as a native closure. Script functions remember the namespace they
//! were defined in so that names they use resolve there.

use crate::ast::Compound;
use crate::error::Result;
use crate::process::Context;
use crate::record::{Record, RecordRef};
use crate::value::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// Host function entry point. Receives the calling context (including the
/// instance for method calls) and the evaluated arguments; `None` means the
/// call produced no result.
pub type NativeEntry = Rc<dyn Fn(&Context, &[Value]) -> Result<Option<Value>>>;

#[derive(Clone)]
pub enum FunctionBody {
    Script(Arc<Compound>),
    Native(NativeEntry),
}

pub struct Function {
    name: String,
    params: Vec<String>,
    /// Default values for trailing parameters, evaluated at definition time.
    defaults: Vec<(String, Value)>,
    body: FunctionBody,
    globals: Option<Weak<RefCell<Record>>>,
}

impl Function {
    pub fn script(
        name: impl Into<String>,
        params: Vec<String>,
        defaults: Vec<(String, Value)>,
        body: Arc<Compound>,
    ) -> Self {
        Function {
            name: name.into(),
            params,
            defaults,
            body: FunctionBody::Script(body),
            globals: None,
        }
    }

    pub fn native(name: impl Into<String>, entry: NativeEntry) -> Self {
        Function {
            name: name.into(),
            params: Vec::new(),
            defaults: Vec::new(),
            body: FunctionBody::Native(entry),
            globals: None,
        }
    }

    pub fn with_globals(mut self, globals: &RecordRef) -> Self {
        self.globals = Some(Rc::downgrade(globals));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn defaults(&self) -> &[(String, Value)] {
        &self.defaults
    }

    pub fn default_for(&self, param: &str) -> Option<&Value> {
        self.defaults
            .iter()
            .find(|(name, _)| name == param)
            .map(|(_, value)| value)
    }

    pub fn body(&self) -> &FunctionBody {
        &self.body
    }

    pub fn is_native(&self) -> bool {
        matches!(self.body, FunctionBody::Native(_))
    }

    /// Namespace the function was defined in, if it still exists.
    pub fn globals(&self) -> Option<RecordRef> {
        self.globals.as_ref().and_then(Weak::upgrade)
    }

    pub fn describe(&self) -> String {
        if self.is_native() {
            format!("(native function {})", self.name)
        } else {
            format!("(function {}({}))", self.name, self.params.join(", "))
        }
    }
}

impl PartialEq for Function {
    fn eq(&self, other: &Function) -> bool {
        if self.name != other.name || self.params != other.params {
            return false;
        }
        match (&self.body, &other.body) {
            (FunctionBody::Script(a), FunctionBody::Script(b)) => {
                a == b && self.defaults == other.defaults
            }
            (FunctionBody::Native(a), FunctionBody::Native(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("native", &self.is_native())
            .finish()
    }
}
