//! The script system
//!
//! [`ScriptSystem`] is the composition root of the engine. Hosts create one
//! and hand it to every [`Process`]. It owns:
//! - the engine configuration and the module source resolver
//! - native modules registered by the host (held weakly)
//! - the built-in `Core`, `Version` and `Path` modules
//! - namespaces of script modules that have been imported
//! - the sink that receives `print` output
//! - an optional compiled-script cache
//!
//! Cloning a `ScriptSystem` gives another handle to the same system.

use crate::ast::Script;
use crate::config::EngineConfig;
use crate::corelib;
use crate::error::{Error, Result};
use crate::function::Function;
use crate::parser::Parser;
use crate::process::Process;
use crate::record::{Record, RecordRef};
use crate::resolver::{FileSystemResolver, SourceResolver};
use crate::script_cache::ScriptCache;
use crate::value::Value;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::{debug, info};

pub type PrintSink = Rc<dyn Fn(&str)>;

struct LoadedModule {
    name: String,
    path: String,
    namespace: RecordRef,
}

struct SystemInner {
    config: EngineConfig,
    resolver: Box<dyn SourceResolver>,
    native_modules: RefCell<Vec<(String, Weak<RefCell<Record>>)>>,
    builtin_modules: Vec<(String, RecordRef)>,
    modules: RefCell<Vec<LoadedModule>>,
    /// Names of modules whose scripts are running right now.
    loading: RefCell<Vec<String>>,
    print_sink: RefCell<PrintSink>,
    cache: RefCell<Option<ScriptCache>>,
}

#[derive(Clone)]
pub struct ScriptSystem {
    inner: Rc<SystemInner>,
}

impl ScriptSystem {
    pub fn new(config: EngineConfig, resolver: impl SourceResolver + 'static) -> Self {
        let builtin_modules = vec![
            ("Core".to_string(), corelib::core_module().into_ref()),
            ("Version".to_string(), corelib::version_module().into_ref()),
            ("Path".to_string(), corelib::path_module().into_ref()),
        ];
        let stdout: PrintSink = Rc::new(|text: &str| println!("{}", text));
        ScriptSystem {
            inner: Rc::new(SystemInner {
                config,
                resolver: Box::new(resolver),
                native_modules: RefCell::new(Vec::new()),
                builtin_modules,
                modules: RefCell::new(Vec::new()),
                loading: RefCell::new(Vec::new()),
                print_sink: RefCell::new(stdout),
                cache: RefCell::new(None),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Makes `module` importable as `name`. The system does not keep the
    /// record alive; once the host drops it the module is gone.
    pub fn add_native_module(&self, name: impl Into<String>, module: &RecordRef) {
        let name = name.into();
        let mut modules = self.inner.native_modules.borrow_mut();
        modules.retain(|(existing, _)| *existing != name);
        debug!(module = %name, "native module added");
        modules.push((name, Rc::downgrade(module)));
    }

    pub fn remove_native_module(&self, name: &str) {
        self.inner
            .native_modules
            .borrow_mut()
            .retain(|(existing, _)| existing != name);
    }

    /// A host-registered or built-in native module.
    pub fn native_module(&self, name: &str) -> Option<RecordRef> {
        let mut modules = self.inner.native_modules.borrow_mut();
        modules.retain(|(_, module)| module.strong_count() > 0);
        modules
            .iter()
            .find(|(existing, _)| existing == name)
            .and_then(|(_, module)| module.upgrade())
            .or_else(|| {
                self.inner
                    .builtin_modules
                    .iter()
                    .find(|(existing, _)| existing == name)
                    .map(|(_, module)| Rc::clone(module))
            })
    }

    /// Method `name` that values of type `class` support, from `Core`.
    pub fn core_method(&self, class: &str, name: &str) -> Option<Rc<Function>> {
        let core = self.native_module("Core")?;
        let core = core.try_borrow().ok()?;
        let class = core.value(class).ok()?;
        match class.as_record().ok()?.with(|r| r.value(name).ok()).ok()?? {
            Value::Function(function) => Some(function),
            _ => None,
        }
    }

    /// Namespace of module `name`, loading and running its script the first
    /// time. `importer` is the path of the importing script.
    pub fn import_module(&self, name: &str, importer: &str) -> Result<RecordRef> {
        if let Some(module) = self.native_module(name) {
            return Ok(module);
        }
        if let Some(loaded) = self
            .inner
            .modules
            .borrow()
            .iter()
            .find(|m| m.name == name)
        {
            return Ok(Rc::clone(&loaded.namespace));
        }
        if self.inner.loading.borrow().iter().any(|m| m == name) {
            return Err(Error::Illegal(format!("circular import of module '{}'", name)));
        }

        let Some(source) =
            self.inner
                .resolver
                .find_module_source(name, importer, &self.inner.config)?
        else {
            return Err(Error::NotFound(format!("cannot find module '{}'", name)));
        };
        debug!(module = name, path = %source.path, "loading module");

        self.inner.loading.borrow_mut().push(name.to_string());
        let outcome = self.run_module(&source.text, &source.path);
        self.inner.loading.borrow_mut().retain(|m| m != name);
        let namespace = outcome?;

        self.inner.modules.borrow_mut().push(LoadedModule {
            name: name.to_string(),
            path: source.path,
            namespace: Rc::clone(&namespace),
        });
        Ok(namespace)
    }

    fn run_module(&self, text: &str, path: &str) -> Result<RecordRef> {
        let script = self.parse_source(text, path)?;
        let mut process = Process::new(self);
        process.evaluate(&script).map_err(|failure| failure.error)?;
        Ok(Rc::clone(process.globals()))
    }

    /// Parses `text`, going through the compiled-script cache when one is
    /// set.
    pub fn parse_source(&self, text: &str, path: &str) -> Result<Script> {
        let cache = self.inner.cache.borrow();
        if let Some(cache) = cache.as_ref() {
            if let Some(mut script) = cache.load(text) {
                script.set_path(path);
                return Ok(script);
            }
        }
        let script = Parser::new(text).with_path(path).parse()?;
        if let Some(cache) = cache.as_ref() {
            if let Err(error) = cache.store(text, &script) {
                debug!(path, "could not cache compiled script: {}", error);
            }
        }
        Ok(script)
    }

    pub fn set_cache(&self, cache: Option<ScriptCache>) {
        *self.inner.cache.borrow_mut() = cache;
    }

    /// Replaces the destination of `print` output.
    pub fn set_print_sink(&self, sink: impl Fn(&str) + 'static) {
        *self.inner.print_sink.borrow_mut() = Rc::new(sink);
    }

    pub fn print(&self, text: &str) {
        info!(target: "quill::print", "{}", text);
        let sink = Rc::clone(&self.inner.print_sink.borrow());
        sink(text);
    }

    /// `(name, path)` of every imported script module, in load order.
    pub fn loaded_modules(&self) -> Vec<(String, String)> {
        self.inner
            .modules
            .borrow()
            .iter()
            .map(|m| (m.name.clone(), m.path.clone()))
            .collect()
    }
}

impl Default for ScriptSystem {
    fn default() -> Self {
        ScriptSystem::new(EngineConfig::default(), FileSystemResolver::new())
    }
}
