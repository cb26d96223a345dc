//! Script execution
//!
//! A [`Process`] runs one [`Script`] against a stack of [`Context`]s. The
//! bottom context is the process itself with its global namespace; every
//! script function call pushes a context with a fresh local namespace, and
//! `eval()` pushes one that shares the caller's namespace.
//!
//! Within a context, execution state is a stack of frames, each a compound
//! statement plus a cursor. Block statements push a frame for their body
//! instead of recursing, so the process can stop between statements and
//! continue later ([`StepMode::PerIteration`]). Expressions are evaluated
//! with an explicit work stack.

use crate::ast::{Compound, Expression, FlowKind, Literal, Script, Statement, StatementKind};
use crate::builtins;
use crate::config::StepMode;
use crate::error::{Error, Failure, Result};
use crate::function::{Function, FunctionBody};
use crate::operator::{AssignOp, Operator};
use crate::parser::Parser;
use crate::record::{Record, RecordRef, RecordValue, inherited_member};
use crate::system::ScriptSystem;
use crate::value::{DictionaryValue, Value};
use crate::variable::Variable;
use std::cell::{Ref, RefCell, RefMut};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Nothing loaded yet.
    Idle,
    Running,
    /// Stopped between loop iterations; `resume()` continues.
    Suspended,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    BaseProcess,
    FunctionCall,
    /// Shares the namespace of the context below it (`eval`).
    Namespace,
}

#[derive(Debug)]
enum FrameKind {
    Root,
    Block,
    /// Body of a `while` or `for`. `items` holds the remaining `for` values.
    Loop { items: Vec<Value>, next: usize },
    Try,
    Catch(Error),
}

#[derive(Debug)]
struct Frame {
    compound: Arc<Compound>,
    index: usize,
    kind: FrameKind,
}

impl Frame {
    fn new(compound: Arc<Compound>, kind: FrameKind) -> Self {
        Frame {
            compound,
            index: 0,
            kind,
        }
    }
}

/// One namespace level of a running process.
pub struct Context {
    kind: ContextKind,
    names: RecordRef,
    frames: Vec<Frame>,
    instance: Option<Value>,
    /// Namespace the called function was defined in.
    globals: Option<RecordRef>,
    result: Value,
}

impl Context {
    pub fn new(kind: ContextKind, names: RecordRef) -> Self {
        Context {
            kind,
            names,
            frames: Vec::new(),
            instance: None,
            globals: None,
            result: Value::None,
        }
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn names(&self) -> &RecordRef {
        &self.names
    }

    /// The value a method was called on, e.g. `'a'` in `'a'.upper()`.
    pub fn instance(&self) -> Option<&Value> {
        self.instance.as_ref()
    }
}

enum Step {
    Continue,
    Suspend,
    /// The innermost context has no statements left.
    Done,
}

/// Work items of the expression evaluator.
enum Work<'e> {
    Eval(&'e Expression),
    /// Operands are on the result stack; combine them.
    Apply(&'e Expression),
    /// Left operand of `and`/`or` is on the result stack.
    ShortCircuit(Operator, &'e Expression),
    ToBoolean,
}

struct ErrorSite {
    line: usize,
    statement: String,
}

fn busy(what: &str) -> Error {
    Error::Illegal(format!("{} is already in use", what))
}

fn read(names: &RecordRef) -> Result<Ref<'_, Record>> {
    names.try_borrow().map_err(|_| busy("namespace"))
}

fn write(names: &RecordRef) -> Result<RefMut<'_, Record>> {
    names.try_borrow_mut().map_err(|_| busy("namespace"))
}

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::None => Value::None,
        Literal::Number(n, hint) => Value::Number(*n, *hint),
        Literal::Text(text) => Value::Text(text.clone()),
    }
}

/// Applies a binary operator other than `and`/`or`.
pub fn apply_operator(op: Operator, lhs: &Value, rhs: &Value) -> Result<Value> {
    use std::cmp::Ordering;
    Ok(match op {
        Operator::Plus => lhs.sum(rhs)?,
        Operator::Minus => lhs.subtract(rhs)?,
        Operator::Multiply => lhs.multiply(rhs)?,
        Operator::Divide => lhs.divide(rhs)?,
        Operator::Modulo => lhs.modulo(rhs)?,
        Operator::Equal => Value::boolean(lhs.equals(rhs)),
        Operator::NotEqual => Value::boolean(!lhs.equals(rhs)),
        Operator::Less => Value::boolean(lhs.compare(rhs)? == Ordering::Less),
        Operator::Greater => Value::boolean(lhs.compare(rhs)? == Ordering::Greater),
        Operator::LessOrEqual => Value::boolean(lhs.compare(rhs)? != Ordering::Greater),
        Operator::GreaterOrEqual => Value::boolean(lhs.compare(rhs)? != Ordering::Less),
        Operator::In => Value::boolean(rhs.contains(lhs)?),
        Operator::And | Operator::Or | Operator::Not => {
            return Err(Error::Illegal(format!("'{}' is not a binary value operator", op)));
        }
    })
}

fn iteration_items(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Dictionary(dict) => Ok(dict.keys()),
        Value::Text(text) => Ok(text.chars().map(|c| Value::Text(c.to_string())).collect()),
        other => Err(Error::Type(format!(
            "cannot iterate over {}",
            other.type_name()
        ))),
    }
}

pub struct Process {
    system: ScriptSystem,
    state: State,
    step_mode: StepMode,
    max_call_depth: usize,
    globals: RecordRef,
    contexts: Vec<Context>,
    result: Value,
    /// Path of the running script, for relative imports.
    path: String,
    /// Modules imported by this process, consulted after all namespaces.
    imports: Vec<(String, Weak<RefCell<Record>>)>,
    error_site: Option<ErrorSite>,
}

impl Process {
    pub fn new(system: &ScriptSystem) -> Self {
        Self::with_globals(system, Record::new_ref())
    }

    /// A process whose global namespace is `globals`, e.g. a host record
    /// that the script should configure.
    pub fn with_globals(system: &ScriptSystem, globals: RecordRef) -> Self {
        let config = system.config();
        Process {
            system: system.clone(),
            state: State::Idle,
            step_mode: config.step_mode,
            max_call_depth: config.max_call_depth,
            contexts: vec![Context::new(ContextKind::BaseProcess, Rc::clone(&globals))],
            globals,
            result: Value::None,
            path: String::new(),
            imports: Vec::new(),
            error_site: None,
        }
    }

    pub fn system(&self) -> &ScriptSystem {
        &self.system
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn step_mode(&self) -> StepMode {
        self.step_mode
    }

    pub fn set_step_mode(&mut self, mode: StepMode) {
        self.step_mode = mode;
    }

    pub fn set_max_call_depth(&mut self, depth: usize) {
        self.max_call_depth = depth.max(1);
    }

    pub fn globals(&self) -> &RecordRef {
        &self.globals
    }

    /// Namespace of the innermost context.
    pub fn local_namespace(&self) -> RecordRef {
        self.contexts
            .last()
            .map_or_else(|| Rc::clone(&self.globals), |c| Rc::clone(&c.names))
    }

    /// Value of the last expression statement of a finished run, or of
    /// `return` at the top level.
    pub fn result(&self) -> &Value {
        &self.result
    }

    /// Loads `script` for execution. The process must not be mid-run.
    pub fn run(&mut self, script: &Script) -> Result<()> {
        if matches!(self.state, State::Running | State::Suspended) {
            return Err(Error::Illegal("process is already running".to_string()));
        }
        self.contexts.truncate(1);
        let Some(base) = self.contexts.first_mut() else {
            return Err(Error::Illegal("process has no base context".to_string()));
        };
        base.frames.clear();
        base.frames
            .push(Frame::new(Arc::clone(script.compound()), FrameKind::Root));
        base.result = Value::None;
        self.result = Value::None;
        self.path = script.path().to_string();
        self.error_site = None;
        self.state = State::Running;
        debug!(path = %self.path, "process started");
        Ok(())
    }

    /// Executes until the script finishes, fails, or suspends.
    pub fn execute(&mut self) -> std::result::Result<State, Failure> {
        if !matches!(self.state, State::Running | State::Suspended) {
            return Ok(self.state);
        }
        self.state = State::Running;
        match self.run_frames() {
            Ok(Step::Suspend) => self.state = State::Suspended,
            Ok(_) => {
                if let Some(base) = self.contexts.first_mut() {
                    self.result = std::mem::take(&mut base.result);
                }
                self.state = State::Finished;
            }
            Err(error) => {
                let site = self.error_site.take();
                let failure = Failure {
                    line: site
                        .as_ref()
                        .map(|s| s.line)
                        .or_else(|| error.line())
                        .unwrap_or(0),
                    statement: site.map(|s| s.statement).unwrap_or_default(),
                    error,
                };
                warn!(path = %self.path, "uncaught error: {}", failure);
                self.contexts.truncate(1);
                if let Some(base) = self.contexts.first_mut() {
                    base.frames.clear();
                }
                self.state = State::Failed;
                return Err(failure);
            }
        }
        Ok(self.state)
    }

    /// Continues a suspended process.
    pub fn resume(&mut self) -> std::result::Result<State, Failure> {
        self.execute()
    }

    /// Runs `script` to completion, ignoring the step mode, and hands over
    /// its result.
    pub fn evaluate(&mut self, script: &Script) -> std::result::Result<Value, Failure> {
        self.run(script).map_err(|error| Failure {
            line: 0,
            statement: String::new(),
            error,
        })?;
        while self.execute()? == State::Suspended {}
        Ok(std::mem::take(&mut self.result))
    }

    /// Parses and runs `source` in the current local namespace (`eval`).
    pub fn evaluate_text(&mut self, source: &str) -> Result<Value> {
        let script = Parser::new(source).parse()?;
        self.check_depth()?;
        let mut context = Context::new(ContextKind::Namespace, self.local_namespace());
        context
            .frames
            .push(Frame::new(Arc::clone(script.compound()), FrameKind::Root));
        self.run_nested(context)
    }

    /// Calls `function` with positional arguments.
    pub fn call(&mut self, function: &Rc<Function>, args: Vec<Value>) -> Result<Value> {
        self.call_function(function, args, Vec::new(), None)
    }

    fn check_depth(&self) -> Result<()> {
        if self.contexts.len() >= self.max_call_depth {
            return Err(Error::Illegal(format!(
                "maximum call depth {} exceeded",
                self.max_call_depth
            )));
        }
        Ok(())
    }

    /// Runs a pushed context until it has no frames left and pops it again.
    fn run_nested(&mut self, context: Context) -> Result<Value> {
        self.contexts.push(context);
        let outcome = self.run_frames();
        let context = self.contexts.pop();
        outcome?;
        Ok(context.map(|c| c.result).unwrap_or_default())
    }

    fn context(&self) -> Result<&Context> {
        self.contexts
            .last()
            .ok_or_else(|| Error::Illegal("no active context".to_string()))
    }

    fn context_mut(&mut self) -> Result<&mut Context> {
        self.contexts
            .last_mut()
            .ok_or_else(|| Error::Illegal("no active context".to_string()))
    }

    fn run_frames(&mut self) -> Result<Step> {
        loop {
            match self.step() {
                Ok(Step::Continue) => {}
                Ok(step) => return Ok(step),
                Err(error) => self.catch_error(error)?,
            }
        }
    }

    fn step(&mut self) -> Result<Step> {
        let context = self.context()?;
        let Some(frame) = context.frames.last() else {
            return Ok(Step::Done);
        };
        let compound = Arc::clone(&frame.compound);
        let index = frame.index;
        match compound.get(index) {
            Some(statement) => {
                trace!(line = statement.line, "execute");
                self.execute_statement(statement)
                    .map(|_| Step::Continue)
                    .inspect_err(|_| self.note_error_site(statement))
            }
            None => {
                let parent = self.parent_statement();
                self.end_of_frame().inspect_err(|_| {
                    if let Some((compound, index)) = &parent {
                        if let Some(statement) = compound.get(*index) {
                            self.note_error_site(statement);
                        }
                    }
                })
            }
        }
    }

    fn note_error_site(&mut self, statement: &Statement) {
        if self.error_site.is_none() {
            let text = statement.to_string();
            self.error_site = Some(ErrorSite {
                line: statement.line,
                statement: text.lines().next().unwrap_or_default().to_string(),
            });
        }
    }

    /// The statement that owns the innermost frame.
    fn parent_statement(&self) -> Option<(Arc<Compound>, usize)> {
        let frames = &self.contexts.last()?.frames;
        let parent = frames.len().checked_sub(2).and_then(|at| frames.get(at))?;
        Some((Arc::clone(&parent.compound), parent.index))
    }

    fn advance(&mut self) -> Result<()> {
        if let Some(frame) = self.context_mut()?.frames.last_mut() {
            frame.index += 1;
        }
        Ok(())
    }

    fn push_frame(&mut self, compound: &Arc<Compound>, kind: FrameKind) -> Result<()> {
        self.context_mut()?
            .frames
            .push(Frame::new(Arc::clone(compound), kind));
        Ok(())
    }

    /// Leaves the innermost frame, or starts the next loop iteration.
    fn end_of_frame(&mut self) -> Result<Step> {
        let suspend_between_iterations =
            self.step_mode == StepMode::PerIteration && self.contexts.len() == 1;
        let in_loop = match self.context()?.frames.last() {
            Some(frame) => matches!(frame.kind, FrameKind::Loop { .. }),
            None => return Ok(Step::Done),
        };
        if in_loop && self.next_iteration()? {
            if let Some(frame) = self.context_mut()?.frames.last_mut() {
                frame.index = 0;
            }
            return Ok(if suspend_between_iterations {
                Step::Suspend
            } else {
                Step::Continue
            });
        }
        let context = self.context_mut()?;
        context.frames.pop();
        if context.frames.is_empty() {
            return Ok(Step::Done);
        }
        self.advance()?;
        Ok(Step::Continue)
    }

    /// Re-checks the `while` condition or binds the next `for` item.
    fn next_iteration(&mut self) -> Result<bool> {
        let Some((compound, index)) = self.parent_statement() else {
            return Err(Error::Illegal("loop frame without a loop".to_string()));
        };
        match compound.get(index).map(|s| &s.kind) {
            Some(StatementKind::While { condition, .. }) => {
                Ok(self.eval_expression(condition)?.is_true())
            }
            Some(StatementKind::For { variable, .. }) => {
                let item = match self.context_mut()?.frames.last_mut().map(|f| &mut f.kind) {
                    Some(FrameKind::Loop { items, next }) if *next < items.len() => {
                        let item = std::mem::take(&mut items[*next]);
                        *next += 1;
                        Some(item)
                    }
                    _ => None,
                };
                match item {
                    Some(item) => {
                        self.bind_local(variable, item)?;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            _ => Err(Error::Illegal("loop frame without a loop".to_string())),
        }
    }

    /// Unwinds to the innermost `try` in this context with a matching
    /// `catch`, or gives the error back when there is none.
    fn catch_error(&mut self, error: Error) -> Result<()> {
        let context = self.context_mut()?;
        let mut at = context.frames.len();
        while at > 1 {
            at -= 1;
            if !matches!(context.frames[at].kind, FrameKind::Try) {
                continue;
            }
            let parent = &context.frames[at - 1];
            let compound = Arc::clone(&parent.compound);
            let Some(StatementKind::Try { catches, .. }) =
                compound.get(parent.index).map(|s| &s.kind)
            else {
                continue;
            };
            let Some(clause) = catches.iter().find(|c| c.catches(&error)) else {
                continue;
            };
            debug!(error = error.name(), "caught");
            context.frames.truncate(at);
            let names = Rc::clone(&context.names);
            context
                .frames
                .push(Frame::new(Arc::clone(&clause.body), FrameKind::Catch(error.clone())));
            self.error_site = None;
            if let Some(variable) = &clause.variable {
                write(&names)?.set(variable, Value::Text(error.describe()))?;
            }
            return Ok(());
        }
        Err(error)
    }

    fn execute_statement(&mut self, statement: &Statement) -> Result<()> {
        match &statement.kind {
            StatementKind::Expression(expr) => {
                let value = self.eval_expression(expr)?;
                let context = self.context_mut()?;
                if context.kind != ContextKind::FunctionCall {
                    context.result = value;
                }
                self.advance()
            }
            StatementKind::Assign {
                target,
                op,
                value,
                read_only,
            } => {
                let value = self.eval_expression(value)?;
                self.assign(target, *op, value, *read_only)?;
                self.advance()
            }
            StatementKind::If {
                branches,
                otherwise,
            } => {
                for (condition, body) in branches {
                    if self.eval_expression(condition)?.is_true() {
                        return self.push_frame(body, FrameKind::Block);
                    }
                }
                match otherwise {
                    Some(body) => self.push_frame(body, FrameKind::Block),
                    None => self.advance(),
                }
            }
            StatementKind::While { condition, body } => {
                if self.eval_expression(condition)?.is_true() {
                    self.push_frame(
                        body,
                        FrameKind::Loop {
                            items: Vec::new(),
                            next: 0,
                        },
                    )
                } else {
                    self.advance()
                }
            }
            StatementKind::For {
                variable,
                iterable,
                body,
            } => {
                let mut items = iteration_items(self.eval_expression(iterable)?)?;
                if items.is_empty() {
                    return self.advance();
                }
                let first = std::mem::take(&mut items[0]);
                self.bind_local(variable, first)?;
                self.push_frame(body, FrameKind::Loop { items, next: 1 })
            }
            StatementKind::Function {
                name,
                params,
                defaults,
                body,
            } => {
                let mut values = Vec::with_capacity(defaults.len());
                for (param, default) in defaults {
                    values.push((param.clone(), self.eval_expression(default)?));
                }
                let names = self.local_namespace();
                let function = Function::script(name.clone(), params.clone(), values, Arc::clone(body))
                    .with_globals(&names);
                write(&names)?.set(name, Value::Function(Rc::new(function)))?;
                self.advance()
            }
            StatementKind::Print(args) => {
                let mut parts = Vec::with_capacity(args.len());
                for arg in args {
                    parts.push(self.eval_expression(arg)?.as_text());
                }
                self.system.print(&parts.join(" "));
                self.advance()
            }
            StatementKind::Import { names, by_value } => {
                for name in names {
                    self.import(name, *by_value)?;
                }
                self.advance()
            }
            StatementKind::Declare(names) => {
                let local = self.local_namespace();
                for name in names {
                    write(&local)?.subrecord(name)?;
                }
                self.advance()
            }
            StatementKind::Scope { name, bases, body } => {
                self.run_scope(name, bases, body)?;
                self.advance()
            }
            StatementKind::Delete(targets) => {
                for target in targets {
                    self.delete(target)?;
                }
                self.advance()
            }
            StatementKind::Flow(kind, value) => self.flow(*kind, value.as_ref()),
            StatementKind::Try { body, .. } => self.push_frame(body, FrameKind::Try),
        }
    }

    /// Runs `body` with subrecord `name` of the local namespace as the
    /// namespace, after adding `bases` to its super records.
    fn run_scope(&mut self, name: &str, bases: &[Expression], body: &Arc<Compound>) -> Result<()> {
        let mut supers = Vec::with_capacity(bases.len());
        for base in bases {
            supers.push(self.eval_expression(base)?.as_record()?.dereference()?);
        }
        let local = self.local_namespace();
        let scope = write(&local)?.subrecord(name)?;
        for base in &supers {
            write(&scope)?.add_super_record(base)?;
        }
        self.check_depth()?;
        debug!(record = name, supers = supers.len(), "record scope");
        let mut context = Context::new(ContextKind::Namespace, scope);
        context
            .frames
            .push(Frame::new(Arc::clone(body), FrameKind::Root));
        self.run_nested(context)?;
        Ok(())
    }

    fn flow(&mut self, kind: FlowKind, value: Option<&Expression>) -> Result<()> {
        match kind {
            FlowKind::Pass => self.advance(),
            FlowKind::Break | FlowKind::Continue => {
                let context = self.context_mut()?;
                let Some(at) = context
                    .frames
                    .iter()
                    .rposition(|f| matches!(f.kind, FrameKind::Loop { .. }))
                else {
                    return Err(Error::Illegal(format!(
                        "'{}' outside a loop",
                        kind.keyword()
                    )));
                };
                if kind == FlowKind::Break {
                    context.frames.truncate(at);
                    self.advance()
                } else {
                    context.frames.truncate(at + 1);
                    if let Some(frame) = context.frames.last_mut() {
                        frame.index = frame.compound.len();
                    }
                    Ok(())
                }
            }
            FlowKind::Return => {
                let result = match value {
                    Some(expr) => self.eval_expression(expr)?,
                    None => Value::None,
                };
                let context = self.context_mut()?;
                context.result = result;
                context.frames.clear();
                Ok(())
            }
            FlowKind::Throw => match value {
                Some(expr) => Err(Error::Thrown(self.eval_expression(expr)?.as_text())),
                None => {
                    let caught = self.context()?.frames.iter().rev().find_map(|f| match &f.kind {
                        FrameKind::Catch(error) => Some(error.clone()),
                        _ => None,
                    });
                    Err(caught.unwrap_or_else(|| {
                        Error::Illegal("'throw' without a value outside 'catch'".to_string())
                    }))
                }
            },
        }
    }

    fn import(&mut self, name: &str, by_value: bool) -> Result<()> {
        let module = self.system.import_module(name, &self.path)?;
        let value = if by_value {
            let copy = read(&module)?.duplicate()?;
            Value::Record(RecordValue::new_owned(copy))
        } else {
            Value::Record(RecordValue::reference(&module))
        };
        let local = self.local_namespace();
        write(&local)?.set(name, value)?;
        let weak = Rc::downgrade(&module);
        match self.imports.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = weak,
            None => self.imports.push((name.to_string(), weak)),
        }
        Ok(())
    }

    fn bind_local(&mut self, name: &str, value: Value) -> Result<()> {
        let local = self.local_namespace();
        write(&local)?.set(name, value)
    }

    /// Looks `name` up through the namespaces visible from the innermost
    /// context, then the imported modules.
    fn lookup(&self, name: &str) -> Result<Value> {
        if let Some(scope) = self.scope_of(name)? {
            return read(&scope)?.value(name);
        }
        if let Some((_, module)) = self.imports.iter().rev().find(|(n, _)| n == name) {
            if let Some(module) = module.upgrade() {
                return Ok(Value::Record(RecordValue::reference(&module)));
            }
        }
        Err(Error::NotFound(format!("'{}' is not defined", name)))
    }

    /// The namespace that defines `name`, if any.
    fn scope_of(&self, name: &str) -> Result<Option<RecordRef>> {
        for context in self.contexts.iter().rev() {
            if read(&context.names)?.has(name) {
                return Ok(Some(Rc::clone(&context.names)));
            }
            match context.kind {
                ContextKind::Namespace => continue,
                ContextKind::FunctionCall => {
                    if let Some(globals) = &context.globals {
                        if read(globals)?.has(name) {
                            return Ok(Some(Rc::clone(globals)));
                        }
                    }
                    break;
                }
                ContextKind::BaseProcess => break,
            }
        }
        if read(&self.globals)?.has(name) {
            return Ok(Some(Rc::clone(&self.globals)));
        }
        Ok(None)
    }

    fn assign(
        &mut self,
        target: &Expression,
        op: AssignOp,
        value: Value,
        read_only: bool,
    ) -> Result<()> {
        match target {
            Expression::Name(name) => {
                let local = self.local_namespace();
                match op.arithmetic() {
                    Some(operator) => {
                        let scope = self.scope_of(name)?.ok_or_else(|| {
                            Error::NotFound(format!("'{}' is not defined", name))
                        })?;
                        let current = read(&scope)?.value(name)?;
                        let updated = apply_operator(operator, &current, &value)?;
                        write(&scope)?.set(name, updated)
                    }
                    None => {
                        let mut names = write(&local)?;
                        if op == AssignOp::SetIfMissing && names.has(name) {
                            return Ok(());
                        }
                        names.set(name, value)?;
                        if read_only {
                            if let Some(variable) = names.get_mut(name) {
                                variable.set_read_only();
                            }
                        }
                        Ok(())
                    }
                }
            }
            Expression::Member { target, name } => {
                let record = self.eval_expression(target)?;
                let record = record.as_record()?;
                match op.arithmetic() {
                    Some(operator) => {
                        let current = record.with(|r| r.value(name))??;
                        let updated = apply_operator(operator, &current, &value)?;
                        record.with_mut(|r| r.set(name, updated))?
                    }
                    None => record.with_mut(|r| {
                        if op == AssignOp::SetIfMissing && r.has(name) {
                            return Ok(());
                        }
                        r.set(name, value)
                    })?,
                }
            }
            Expression::Index { .. } => {
                let (scope, name, keys) = self.resolve_place(target)?;
                let mut names = write(&scope)?;
                let variable = names
                    .get_mut(&name)
                    .ok_or_else(|| Error::NotFound(format!("'{}' is not defined", name)))?;
                variable.update(|root| {
                    let Some((last, path)) = keys.split_last() else {
                        return Err(Error::Illegal("element assignment without index".to_string()));
                    };
                    let mut slot = root;
                    for key in path {
                        slot = slot.element_mut(key)?;
                    }
                    match op.arithmetic() {
                        Some(operator) => {
                            let current = slot.element(last)?;
                            slot.set_element(last, apply_operator(operator, &current, &value)?)
                        }
                        None => {
                            if op == AssignOp::SetIfMissing {
                                if let Value::Dictionary(dict) = &*slot {
                                    if dict.contains(last) {
                                        return Ok(());
                                    }
                                }
                            }
                            slot.set_element(last, value)
                        }
                    }
                })
            }
            other => Err(Error::Type(format!("cannot assign to '{}'", other))),
        }
    }

    /// Splits `a.b[i][j]` into the record holding `b`, the name `b`, and
    /// the evaluated keys `[i, j]`.
    fn resolve_place(&mut self, target: &Expression) -> Result<(RecordRef, String, Vec<Value>)> {
        let mut keys = Vec::new();
        let mut current = target;
        loop {
            match current {
                Expression::Index { target, index } => {
                    keys.push(self.eval_expression(index)?);
                    current = target;
                }
                Expression::Name(name) => {
                    let scope = self
                        .scope_of(name)?
                        .ok_or_else(|| Error::NotFound(format!("'{}' is not defined", name)))?;
                    keys.reverse();
                    return Ok((scope, name.clone(), keys));
                }
                Expression::Member { target, name } => {
                    let record = self.eval_expression(target)?.as_record()?.dereference()?;
                    keys.reverse();
                    return Ok((record, name.clone(), keys));
                }
                other => {
                    return Err(Error::Type(format!("cannot assign to an element of '{}'", other)));
                }
            }
        }
    }

    fn delete(&mut self, target: &Expression) -> Result<()> {
        match target {
            Expression::Name(name) => {
                let local = self.local_namespace();
                write(&local)?.remove(name)
            }
            Expression::Member { target, name } => {
                let record = self.eval_expression(target)?;
                record.as_record()?.with_mut(|r| r.remove(name))?
            }
            Expression::Index { .. } => {
                let (scope, name, keys) = self.resolve_place(target)?;
                let mut names = write(&scope)?;
                let variable = names
                    .get_mut(&name)
                    .ok_or_else(|| Error::NotFound(format!("'{}' is not defined", name)))?;
                variable.update(|root| {
                    let Some((last, path)) = keys.split_last() else {
                        return Err(Error::Illegal("element deletion without index".to_string()));
                    };
                    let mut slot = root;
                    for key in path {
                        slot = slot.element_mut(key)?;
                    }
                    slot.remove_element(last)
                })
            }
            other => Err(Error::Type(format!("cannot delete '{}'", other))),
        }
    }

    /// Evaluates `expr` without recursing on the native stack for nested
    /// sub-expressions. Function calls still nest a context.
    pub fn eval_expression(&mut self, expr: &Expression) -> Result<Value> {
        let mut work = vec![Work::Eval(expr)];
        let mut results: Vec<Value> = Vec::new();
        while let Some(item) = work.pop() {
            match item {
                Work::Eval(expr) => match expr {
                    Expression::Constant(literal) => results.push(literal_value(literal)),
                    Expression::Name(name) => results.push(self.lookup(name)?),
                    Expression::Array(items) => {
                        work.push(Work::Apply(expr));
                        work.extend(items.iter().rev().map(Work::Eval));
                    }
                    Expression::Dictionary(entries) => {
                        work.push(Work::Apply(expr));
                        for (key, value) in entries.iter().rev() {
                            work.push(Work::Eval(value));
                            work.push(Work::Eval(key));
                        }
                    }
                    Expression::Unary { operand, .. } => {
                        work.push(Work::Apply(expr));
                        work.push(Work::Eval(operand));
                    }
                    Expression::Binary {
                        op: op @ (Operator::And | Operator::Or),
                        lhs,
                        rhs,
                    } => {
                        work.push(Work::ShortCircuit(*op, rhs));
                        work.push(Work::Eval(lhs));
                    }
                    Expression::Binary { lhs, rhs, .. } => {
                        work.push(Work::Apply(expr));
                        work.push(Work::Eval(rhs));
                        work.push(Work::Eval(lhs));
                    }
                    Expression::Member { target, .. } => {
                        work.push(Work::Apply(expr));
                        work.push(Work::Eval(target));
                    }
                    Expression::Index { target, index } => {
                        work.push(Work::Apply(expr));
                        work.push(Work::Eval(index));
                        work.push(Work::Eval(target));
                    }
                    Expression::Slice { target, start, end } => {
                        work.push(Work::Apply(expr));
                        if let Some(end) = end {
                            work.push(Work::Eval(end));
                        }
                        if let Some(start) = start {
                            work.push(Work::Eval(start));
                        }
                        work.push(Work::Eval(target));
                    }
                    Expression::Call {
                        callee,
                        args,
                        keywords,
                    } => {
                        work.push(Work::Apply(expr));
                        work.extend(keywords.iter().rev().map(|(_, value)| Work::Eval(value)));
                        work.extend(args.iter().rev().map(Work::Eval));
                        match callee.as_ref() {
                            // The method's owner is evaluated, not the member.
                            Expression::Member { target, .. } => work.push(Work::Eval(target)),
                            other => work.push(Work::Eval(other)),
                        }
                    }
                    Expression::BuiltIn { args, .. } => {
                        work.push(Work::Apply(expr));
                        work.extend(args.iter().rev().map(Work::Eval));
                    }
                },
                Work::Apply(expr) => {
                    let value = self.apply(expr, &mut results)?;
                    results.push(value);
                }
                Work::ShortCircuit(op, rhs) => {
                    let lhs = pop(&mut results)?.is_true();
                    if (op == Operator::Or) == lhs {
                        results.push(Value::boolean(lhs));
                    } else {
                        work.push(Work::ToBoolean);
                        work.push(Work::Eval(rhs));
                    }
                }
                Work::ToBoolean => {
                    let value = pop(&mut results)?;
                    results.push(Value::boolean(value.is_true()));
                }
            }
        }
        pop(&mut results)
    }

    fn apply(&mut self, expr: &Expression, results: &mut Vec<Value>) -> Result<Value> {
        match expr {
            Expression::Array(items) => Ok(Value::Array(pop_n(results, items.len())?)),
            Expression::Dictionary(entries) => {
                let flat = pop_n(results, entries.len() * 2)?;
                let mut dict = DictionaryValue::new();
                let mut flat = flat.into_iter();
                while let (Some(key), Some(value)) = (flat.next(), flat.next()) {
                    dict.insert(key, value);
                }
                Ok(Value::Dictionary(dict))
            }
            Expression::Unary { op, .. } => {
                let operand = pop(results)?;
                match op {
                    Operator::Not => Ok(Value::boolean(!operand.is_true())),
                    Operator::Minus => operand.negate(),
                    Operator::Plus => match operand {
                        Value::Number(..) => Ok(operand),
                        other => Err(Error::Type(format!(
                            "cannot apply unary + to {}",
                            other.type_name()
                        ))),
                    },
                    other => Err(Error::Illegal(format!("'{}' is not a prefix operator", other))),
                }
            }
            Expression::Binary { op, .. } => {
                let rhs = pop(results)?;
                let lhs = pop(results)?;
                apply_operator(*op, &lhs, &rhs)
            }
            Expression::Member { name, .. } => {
                let target = pop(results)?;
                match &target {
                    Value::Record(record) => inherited_member(&record.dereference()?, name)?
                        .ok_or_else(|| Error::NotFound(format!("'{}' not found", name))),
                    other => Err(Error::Type(format!(
                        "{} has no member '{}'",
                        other.type_name(),
                        name
                    ))),
                }
            }
            Expression::Index { .. } => {
                let index = pop(results)?;
                let target = pop(results)?;
                target.element(&index)
            }
            Expression::Slice { start, end, .. } => {
                let end = if end.is_some() { Some(pop(results)?) } else { None };
                let start = if start.is_some() { Some(pop(results)?) } else { None };
                let target = pop(results)?;
                target.slice(start.as_ref(), end.as_ref())
            }
            Expression::Call {
                callee,
                args,
                keywords,
            } => {
                let keyword_values = pop_n(results, keywords.len())?;
                let keyword_args = keywords
                    .iter()
                    .map(|(name, _)| name.clone())
                    .zip(keyword_values)
                    .collect();
                let args = pop_n(results, args.len())?;
                let (function, instance) = match callee.as_ref() {
                    Expression::Member { name, .. } => self.method(pop(results)?, name)?,
                    _ => match pop(results)? {
                        Value::Function(function) => (function, None),
                        other => {
                            return Err(Error::Type(format!(
                                "{} is not callable",
                                other.type_name()
                            )));
                        }
                    },
                };
                self.call_function(&function, args, keyword_args, instance)
            }
            Expression::BuiltIn { kind, args } => {
                let args = pop_n(results, args.len())?;
                builtins::call(self, *kind, args)
            }
            Expression::Constant(_) | Expression::Name(_) => {
                Err(Error::Illegal("operand has no apply step".to_string()))
            }
        }
    }

    /// Finds method `name` of `target`: a function member of a record, or a
    /// built-in class method of the value's type.
    fn method(&self, target: Value, name: &str) -> Result<(Rc<Function>, Option<Value>)> {
        if let Value::Record(record) = &target {
            return match inherited_member(&record.dereference()?, name)? {
                Some(Value::Function(function)) => Ok((function, Some(target))),
                Some(other) => Err(Error::Type(format!(
                    "member '{}' is {}, not a Function",
                    name,
                    other.type_name()
                ))),
                None => Err(Error::NotFound(format!("record has no member '{}'", name))),
            };
        }
        match self.system.core_method(target.type_name(), name) {
            Some(function) => Ok((function, Some(target))),
            None => Err(Error::NotFound(format!(
                "{} has no method '{}'",
                target.type_name(),
                name
            ))),
        }
    }

    fn call_function(
        &mut self,
        function: &Rc<Function>,
        args: Vec<Value>,
        keywords: Vec<(String, Value)>,
        instance: Option<Value>,
    ) -> Result<Value> {
        match function.body() {
            FunctionBody::Native(entry) => {
                if !keywords.is_empty() {
                    return Err(Error::WrongArguments(format!(
                        "{}() does not take keyword arguments",
                        function.name()
                    )));
                }
                let mut context = Context::new(ContextKind::FunctionCall, Record::new_ref());
                context.instance = instance;
                Ok(entry(&context, &args)?.unwrap_or_default())
            }
            FunctionBody::Script(body) => {
                self.check_depth()?;
                let mut names = bind_arguments(function, args, keywords)?;
                if let Some(instance) = &instance {
                    names.add(Variable::new("self", instance.clone()));
                }
                let mut context = Context::new(ContextKind::FunctionCall, names.into_ref());
                context.globals = function.globals();
                context.instance = instance;
                context
                    .frames
                    .push(Frame::new(Arc::clone(body), FrameKind::Root));
                trace!(function = function.name(), depth = self.contexts.len() + 1, "call");
                self.run_nested(context)
            }
        }
    }
}

fn pop(results: &mut Vec<Value>) -> Result<Value> {
    results
        .pop()
        .ok_or_else(|| Error::Illegal("evaluation stack underflow".to_string()))
}

fn pop_n(results: &mut Vec<Value>, count: usize) -> Result<Vec<Value>> {
    let at = results
        .len()
        .checked_sub(count)
        .ok_or_else(|| Error::Illegal("evaluation stack underflow".to_string()))?;
    Ok(results.split_off(at))
}

/// Builds the local namespace of a script function call.
fn bind_arguments(
    function: &Function,
    args: Vec<Value>,
    keywords: Vec<(String, Value)>,
) -> Result<Record> {
    let params = function.params();
    if args.len() > params.len() {
        return Err(Error::WrongArguments(format!(
            "{}() takes {} argument{} ({} given)",
            function.name(),
            params.len(),
            if params.len() == 1 { "" } else { "s" },
            args.len()
        )));
    }
    let mut values: Vec<Option<Value>> = args.into_iter().map(Some).collect();
    values.resize_with(params.len(), || None);
    for (name, value) in keywords {
        let Some(at) = params.iter().position(|p| *p == name) else {
            return Err(Error::WrongArguments(format!(
                "{}() has no parameter '{}'",
                function.name(),
                name
            )));
        };
        if values[at].is_some() {
            return Err(Error::WrongArguments(format!(
                "{}() got two values for '{}'",
                function.name(),
                name
            )));
        }
        values[at] = Some(value);
    }
    let mut names = Record::new();
    for (param, value) in params.iter().zip(values) {
        let value = match value {
            Some(value) => value,
            None => match function.default_for(param) {
                Some(default) => default.duplicate()?,
                None => {
                    return Err(Error::WrongArguments(format!(
                        "{}() is missing argument '{}'",
                        function.name(),
                        param
                    )));
                }
            },
        };
        names.add(Variable::new(param.clone(), value));
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_script;

    fn run(source: &str) -> std::result::Result<Value, Failure> {
        let system = ScriptSystem::default();
        let mut process = Process::new(&system);
        process.evaluate(&parse_script(source).unwrap())
    }

    fn number(source: &str) -> f64 {
        run(source).unwrap().as_number().unwrap()
    }

    #[test]
    fn test_results_of_expressions() {
        assert_eq!(number("a = 1\nb = a + 2\nb"), 3.0);
        assert_eq!(number("x = [1,2,3]\nlen(x)"), 3.0);
        assert_eq!(number("1 + 2 * 3"), 7.0);
        assert_eq!(number("(1 + 2) * 3"), 9.0);
        assert_eq!(number("10 - 4 - 3"), 3.0);
    }

    #[test]
    fn test_short_circuit_skips_right_operand() {
        assert_eq!(run("False and undefined_name").unwrap(), Value::boolean(false));
        assert_eq!(run("1 or undefined_name").unwrap(), Value::boolean(true));
        assert!(run("True and undefined_name").is_err());
    }

    #[test]
    fn test_loops_and_flow() {
        let source = "total = 0\n\
                      for i in [1, 2, 3, 4, 5, 6]\n\
                          if i == 2: continue\n\
                          if i == 5: break\n\
                          total += i\n\
                      end\n\
                      n = 0\n\
                      while True\n\
                          n += 1\n\
                          if n >= 3: break\n\
                      end\n\
                      total * 10 + n";
        assert_eq!(number(source), 83.0);
    }

    #[test]
    fn test_functions_and_defaults() {
        let source = "def f(a, b=10)\n    return a + b\nend\nf(1) + f(1, 2) + f(b=3, a=4)";
        assert_eq!(number(source), 11.0 + 3.0 + 7.0);

        let failure = run("def g(a)\n    return a\nend\ng()").unwrap_err();
        assert_eq!(failure.error.name(), "WrongArgumentsError");
        assert_eq!(failure.line, 4);
    }

    #[test]
    fn test_recursion_uses_defining_namespace() {
        let source = "def fact(n)\n    if n <= 1: return 1\n    return n * fact(n - 1)\nend\nfact(6)";
        assert_eq!(number(source), 720.0);
    }

    #[test]
    fn test_call_depth_limit() {
        let system = ScriptSystem::default();
        let mut process = Process::new(&system);
        process.set_max_call_depth(16);
        let script = parse_script("def down(n)\n    return down(n + 1)\nend\ndown(0)").unwrap();
        let failure = process.evaluate(&script).unwrap_err();
        assert_eq!(failure.error.name(), "IllegalError");
        assert_eq!(process.state(), State::Failed);
    }

    #[test]
    fn test_try_catch() {
        let source = "log = []\n\
                      try\n\
                          x = 1 / 0\n\
                      catch TypeError\n\
                          log += ['type']\n\
                      catch ArithmeticError, message\n\
                          log += [message]\n\
                      end\n\
                      log";
        let value = run(source).unwrap();
        assert_eq!(value.element(&Value::from(0.0)).unwrap().as_text().split(':').next(), Some("ArithmeticError"));
    }

    #[test]
    fn test_uncaught_error_reports_site() {
        let failure = run("a = 1\nb = a + 'x' * 'y'\n").unwrap_err();
        assert_eq!(failure.line, 2);
        assert_eq!(failure.error.name(), "TypeError");
        assert_eq!(failure.statement, "b = (a + ('x' * 'y'))");
    }

    #[test]
    fn test_rethrow_from_catch() {
        let source = "try\n    try\n        throw 'inner'\n    catch\n        throw\n    end\ncatch Error, e\n    e\nend";
        assert_eq!(run(source).unwrap(), Value::from("Error: inner"));
    }

    #[test]
    fn test_break_outside_loop_is_illegal() {
        let failure = run("break").unwrap_err();
        assert_eq!(failure.error.name(), "IllegalError");
    }

    #[test]
    fn test_element_assignment() {
        let source = "d = {'a': [1, 2], 'b': 0}\nd['a'][1] += 5\nd['c'] = 'new'\nd['b'] ?= 9\ndel d['a'][0]\nd";
        let value = run(source).unwrap();
        assert_eq!(value.to_string(), "{'a': [7], 'b': 0, 'c': 'new'}");
    }

    #[test]
    fn test_step_mode_suspends_per_iteration() {
        let system = ScriptSystem::default();
        let mut process = Process::new(&system);
        process.set_step_mode(StepMode::PerIteration);
        let script = parse_script("n = 0\nwhile n < 3: n += 1\nn").unwrap();
        process.run(&script).unwrap();
        let mut suspensions = 0;
        while process.execute().unwrap() == State::Suspended {
            suspensions += 1;
        }
        assert_eq!(suspensions, 2);
        assert_eq!(process.state(), State::Finished);
        assert_eq!(process.result(), &Value::from(3.0));
    }

    #[test]
    fn test_host_globals_and_call() {
        let system = ScriptSystem::default();
        let globals = Record::new_ref();
        globals.borrow_mut().add_number("scale", 2.0);
        let mut process = Process::with_globals(&system, Rc::clone(&globals));
        let script = parse_script("def area(w, h)\n    return w * h * scale\nend").unwrap();
        process.evaluate(&script).unwrap();

        let area = match globals.borrow().value("area").unwrap() {
            Value::Function(f) => f,
            other => panic!("expected a function, got {:?}", other),
        };
        let value = process.call(&area, vec![Value::from(3.0), Value::from(4.0)]).unwrap();
        assert_eq!(value, Value::from(24.0));
    }
}
