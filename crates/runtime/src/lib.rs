//! Quill: an embeddable scripting language
//!
//! Key design principles:
//! - Script: immutable parsed tree, shareable between processes and threads
//! - Value: closed sum type; records are owned by one value and referenced
//!   weakly by every other
//! - Process: step-wise evaluator with explicit frames, so a host can run a
//!   script a loop iteration at a time
//! - ScriptSystem: composition root holding configuration, modules and the
//!   print sink
//!
//! ```
//! use quill::{Process, ScriptSystem, parse_script};
//!
//! let system = ScriptSystem::default();
//! let script = parse_script("def twice(x)\n    return x * 2\nend\ntwice(21)").unwrap();
//! let result = Process::new(&system).evaluate(&script).unwrap();
//! assert_eq!(result.as_number().unwrap(), 42.0);
//! ```

pub mod arithmetic;
pub mod ast;
pub mod builtins;
pub mod config;
pub mod corelib;
pub mod error;
pub mod function;
pub mod operator;
pub mod parser;
pub mod process;
pub mod record;
pub mod resolver;
pub mod script_cache;
pub mod script_codec;
pub mod serialize;
pub mod system;
pub mod value;
pub mod variable;

pub use ast::{CatchClause, Compound, Expression, FlowKind, Literal, Script, Statement, StatementKind};
pub use builtins::BuiltIn;
pub use config::{EngineConfig, StepMode};
pub use error::{Error, Failure, Result, SyntaxErrorKind};
pub use function::{Function, FunctionBody, NativeEntry};
pub use operator::{AssignOp, Operator};
pub use parser::{Parser, parse_script};
pub use process::{Context, ContextKind, Process, State};
pub use record::{Record, RecordRef, RecordValue, SUPER_NAME, inherited_member};
pub use resolver::{FileSystemResolver, MemoryResolver, ModuleSource, SourceResolver};
pub use script_cache::ScriptCache;
pub use serialize::{from_bytes, to_bytes};
pub use system::ScriptSystem;
pub use value::{DictionaryValue, KeyComparison, NumberHint, Value};
pub use variable::{Mode, Variable};

// Leaf primitives hosts commonly need alongside the engine.
pub use quill_core::{ProtocolVersion, Reader, Time, Writer};
