//! The interpreting engine.
//!
//! Each instrumented function behaves as a resumable continuation driven
//! by this loop, which realizes the instrumentation contract at its three
//! kinds of points:
//!
//! - *function entry*: during a rewind, if the buffer's next record names
//!   the function being entered, the record is popped, its locals are
//!   restored, and execution jumps to the recorded resume location
//!   instead of the top of the body.
//! - *checked call site*: after the call returns, if an unwind is in
//!   flight, the frame saves a record (this site as resume location, a
//!   snapshot of its locals) and immediately propagates the unwind to its
//!   own caller. Whatever value the unwound-through call nominally
//!   produced is replaced by an inert unit sentinel that no subsequent
//!   statement will legally observe.
//! - *checked loop back-edge*: the same check, so a suspension from
//!   inside a tight loop interrupts the loop without first exiting it.
//!
//! From the host's perspective the engine is fully synchronous: `run`
//! either completes or returns a suspended task, and `resume` picks the
//! program up exactly where it left off.

use crate::bridge::HostTask;
use crate::buffer::{FrameRecord, ResumeAt, ResumePoint, SuspendBuffer};
use crate::error::{CoreError, CoreResult};
use crate::instrument::{FnPlan, InstrumentedProgram};
use crate::state::{Controller, ExecState};
use crate::ImportHandler;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use unspool_graph::{Callee, FuncId, ImportId, Op, Slot, Value};

/// Engine tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Maximum number of frame records one unwind may save. Exceeding it
    /// is a fatal stack overflow.
    pub frame_capacity: usize,
    /// Maximum live call depth during ordinary execution. Bounds runaway
    /// recursion, which the frame capacity alone does not.
    pub max_call_depth: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self { frame_capacity: 1024, max_call_depth: 1024 }
    }
}

/// What one drive of the engine produced.
#[derive(Debug)]
pub enum Outcome {
    /// The program ran to completion with this return value.
    Complete(Value),
    /// The program suspended; the host should perform the task and call
    /// [`Engine::resume`] when it is done.
    Suspended(HostTask),
}

/// Control flow produced by one function call.
pub(crate) enum CallFlow {
    /// The function returned normally.
    Return(Value),
    /// The function saved its frame and propagated an unwind.
    Unwound,
}

/// Control flow produced by executing (part of) a body.
enum BodyFlow {
    /// Ran off the end of the body.
    Done,
    /// Hit a `Break`.
    Break,
    /// Hit a `Return`.
    Return(Value),
    /// Propagating an unwind outward.
    Unwound,
}

/// One live activation: the function's identity, its plan (if
/// instrumented), and its local slots.
struct Frame<'p> {
    func: FuncId,
    name: &'p str,
    plan: Option<&'p FnPlan>,
    locals: Vec<Value>,
}

impl Frame<'_> {
    fn get(&self, slot: Slot) -> CoreResult<&Value> {
        self.locals.get(slot).ok_or_else(|| CoreError::SlotOutOfBounds {
            func: self.name.to_string(),
            slot,
        })
    }

    fn set(&mut self, slot: Slot, value: Value) -> CoreResult<()> {
        match self.locals.get_mut(slot) {
            Some(dst) => {
                *dst = value;
                Ok(())
            }
            None => Err(CoreError::SlotOutOfBounds { func: self.name.to_string(), slot }),
        }
    }

    fn is_checked_site(&self, path: &[usize]) -> bool {
        self.plan.is_some_and(|p| p.is_checked_site(path))
    }

    fn is_checked_loop(&self, path: &[usize]) -> bool {
        self.plan.is_some_and(|p| p.is_checked_loop(path))
    }
}

/// Remaining resume location while re-entering nested bodies.
#[derive(Copy, Clone)]
struct Cursor<'r> {
    path: &'r [usize],
    at: ResumeAt,
}

/// One logical execution context: program, import handlers, controller,
/// and suspend buffer. Independent contexts are independent engines;
/// nothing is shared.
pub struct Engine {
    program: Arc<InstrumentedProgram>,
    imports: FxHashMap<ImportId, Box<dyn ImportHandler>>,
    pub(crate) controller: Controller,
    pub(crate) buffer: SuspendBuffer,
    pub(crate) pending_task: Option<HostTask>,
    entry: Option<(FuncId, Vec<Value>)>,
    output: Vec<Value>,
    depth: usize,
    max_depth: usize,
}

impl Engine {
    /// Create an engine with default options.
    pub fn new(program: InstrumentedProgram) -> Self {
        Self::with_options(program, EngineOptions::default())
    }

    /// Create an engine with explicit options.
    pub fn with_options(program: InstrumentedProgram, options: EngineOptions) -> Self {
        Self {
            program: Arc::new(program),
            imports: FxHashMap::default(),
            controller: Controller::new(),
            buffer: SuspendBuffer::new(options.frame_capacity),
            pending_task: None,
            entry: None,
            output: Vec::new(),
            depth: 0,
            max_depth: options.max_call_depth,
        }
    }

    /// Register the handler for an import. Replaces any previous handler.
    pub fn register_import<H: ImportHandler + 'static>(&mut self, import: ImportId, handler: H) {
        self.imports.insert(import, Box::new(handler));
    }

    /// The program this engine executes.
    pub fn program(&self) -> &unspool_graph::Program {
        self.program.program()
    }

    pub(crate) fn import_handler(&mut self, import: ImportId) -> Option<&mut dyn ImportHandler> {
        match self.imports.get_mut(&import) {
            Some(h) => Some(h.as_mut()),
            None => None,
        }
    }

    pub(crate) fn entry_invocation(&self) -> Option<(FuncId, Vec<Value>)> {
        self.entry.clone()
    }

    /// Current execution state.
    pub fn state(&self) -> ExecState {
        self.controller.state()
    }

    /// Number of frame records currently saved.
    pub fn saved_frames(&self) -> usize {
        self.buffer.depth()
    }

    /// The observable output log so far.
    pub fn output(&self) -> &[Value] {
        &self.output
    }

    /// Take the observable output log, leaving it empty.
    pub fn take_output(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.output)
    }

    /// Invoke the top-level entry point. A call while a cycle is open is
    /// a protocol violation: hosts must not reenter a suspended context.
    pub fn run(&mut self, entry: FuncId, args: Vec<Value>) -> CoreResult<Outcome> {
        if !self.controller.is_normal() {
            return Err(CoreError::ProtocolViolation(format!(
                "run invoked while a cycle is open (state {:?})",
                self.controller.state()
            )));
        }
        self.entry = Some((entry, args.clone()));
        self.drive(entry, args)
    }

    /// Drive the entry point and classify what happened.
    pub(crate) fn drive(&mut self, entry: FuncId, args: Vec<Value>) -> CoreResult<Outcome> {
        match self.exec_function(entry, args) {
            Err(err) => {
                if matches!(
                    err,
                    CoreError::StackOverflow { .. } | CoreError::CallDepthExceeded { .. }
                ) {
                    self.abort_cycle();
                }
                Err(err)
            }
            Ok(_) if self.controller.is_unwinding() => {
                let task = self.pending_task.take().ok_or_else(|| {
                    CoreError::ProtocolViolation("unwinding with no pending host task".into())
                })?;
                Ok(Outcome::Suspended(task))
            }
            Ok(CallFlow::Return(value)) => {
                self.entry = None;
                Ok(Outcome::Complete(value))
            }
            Ok(CallFlow::Unwound) => Err(CoreError::ProtocolViolation(
                "frame unwound outside of an open cycle".into(),
            )),
        }
    }

    /// Drop all state belonging to the in-flight cycle after a fatal
    /// error. Records saved for the aborted cycle are unusable.
    fn abort_cycle(&mut self) {
        self.buffer.reset();
        self.controller.reset();
        self.pending_task = None;
        self.entry = None;
    }

    fn exec_function(&mut self, func_id: FuncId, args: Vec<Value>) -> CoreResult<CallFlow> {
        if self.depth >= self.max_depth {
            return Err(CoreError::CallDepthExceeded { limit: self.max_depth });
        }
        self.depth += 1;
        let flow = self.exec_frame(func_id, args);
        self.depth -= 1;
        flow
    }

    fn exec_frame(&mut self, func_id: FuncId, args: Vec<Value>) -> CoreResult<CallFlow> {
        let program = Arc::clone(&self.program);
        let func = program
            .program()
            .func(func_id)
            .ok_or(CoreError::UnknownFunction(func_id))?;
        if args.len() != func.params {
            return Err(CoreError::ArityMismatch {
                name: func.name.clone(),
                expected: func.params,
                got: args.len(),
            });
        }
        let plan = program.plan(func_id);

        // Entry rewind check: restore this frame if the next record in
        // consumption order names this function.
        let mut record = None;
        if self.controller.is_rewinding() && plan.is_some() {
            if self.buffer.peek().is_some_and(|r| r.func == func_id) {
                record = self.buffer.pop();
            }
        }
        let (locals, resume_at) = match record {
            Some(r) => (r.locals, Some(r.resume_at)),
            None => {
                let mut locals = args;
                locals.resize(func.slot_count(), Value::Unit);
                (locals, None)
            }
        };

        let mut frame = Frame { func: func_id, name: &func.name, plan, locals };
        let mut path = Vec::new();
        let cursor = resume_at
            .as_ref()
            .map(|point| Cursor { path: &point.path, at: point.at });
        match self.run_ops(&mut frame, &func.body, &mut path, cursor)? {
            BodyFlow::Return(value) => Ok(CallFlow::Return(value)),
            BodyFlow::Done => Ok(CallFlow::Return(Value::Unit)),
            BodyFlow::Unwound => Ok(CallFlow::Unwound),
            BodyFlow::Break => Err(CoreError::MalformedBody(format!(
                "break escaped the body of `{}`",
                func.name
            ))),
        }
    }

    fn run_ops(
        &mut self,
        frame: &mut Frame<'_>,
        ops: &[Op],
        path: &mut Vec<usize>,
        mut resume: Option<Cursor<'_>>,
    ) -> CoreResult<BodyFlow> {
        let start = match resume {
            Some(cursor) => {
                if cursor.path.is_empty() || cursor.path[0] >= ops.len() {
                    // Corrupt resume location; nothing sensible to jump to.
                    resume = None;
                    0
                } else {
                    cursor.path[0]
                }
            }
            None => 0,
        };
        let mut idx = start;
        while idx < ops.len() {
            let cursor = resume.take();
            match &ops[idx] {
                Op::Const { dst, value } => frame.set(*dst, value.clone())?,
                Op::Copy { dst, src } => {
                    let value = frame.get(*src)?.clone();
                    frame.set(*dst, value)?;
                }
                Op::Add { dst, lhs, rhs } => {
                    let value = numeric_binop(
                        "add",
                        frame.get(*lhs)?,
                        frame.get(*rhs)?,
                        |a, b| Value::Int(a.wrapping_add(b)),
                        |a, b| Value::Float(a + b),
                    )?;
                    frame.set(*dst, value)?;
                }
                Op::Sub { dst, lhs, rhs } => {
                    let value = numeric_binop(
                        "sub",
                        frame.get(*lhs)?,
                        frame.get(*rhs)?,
                        |a, b| Value::Int(a.wrapping_sub(b)),
                        |a, b| Value::Float(a - b),
                    )?;
                    frame.set(*dst, value)?;
                }
                Op::Mul { dst, lhs, rhs } => {
                    let value = numeric_binop(
                        "mul",
                        frame.get(*lhs)?,
                        frame.get(*rhs)?,
                        |a, b| Value::Int(a.wrapping_mul(b)),
                        |a, b| Value::Float(a * b),
                    )?;
                    frame.set(*dst, value)?;
                }
                Op::Eq { dst, lhs, rhs } => {
                    let value = Value::Bool(frame.get(*lhs)? == frame.get(*rhs)?);
                    frame.set(*dst, value)?;
                }
                Op::Lt { dst, lhs, rhs } => {
                    let value = numeric_binop(
                        "lt",
                        frame.get(*lhs)?,
                        frame.get(*rhs)?,
                        |a, b| Value::Bool(a < b),
                        |a, b| Value::Bool(a < b),
                    )?;
                    frame.set(*dst, value)?;
                }
                Op::Not { dst, src } => {
                    let value = Value::Bool(!expect_bool("not", frame.get(*src)?)?);
                    frame.set(*dst, value)?;
                }
                Op::Emit { src } => {
                    let value = frame.get(*src)?.clone();
                    self.output.push(value);
                }
                Op::Return { src } => {
                    let value = match src {
                        Some(slot) => frame.get(*slot)?.clone(),
                        None => Value::Unit,
                    };
                    return Ok(BodyFlow::Return(value));
                }
                Op::Break => return Ok(BodyFlow::Break),
                Op::BreakIf { cond } => {
                    if expect_bool("break-if", frame.get(*cond)?)? {
                        return Ok(BodyFlow::Break);
                    }
                }
                Op::If { cond, then_body, else_body } => {
                    let resumed = cursor.filter(|c| c.path.len() >= 3);
                    let (branch, inner) = match resumed {
                        Some(c) => (c.path[1], Some(Cursor { path: &c.path[2..], at: c.at })),
                        None => {
                            let taken = expect_bool("if", frame.get(*cond)?)?;
                            (if taken { 0 } else { 1 }, None)
                        }
                    };
                    let body = if branch == 0 { then_body } else { else_body };
                    path.push(idx);
                    path.push(branch);
                    let flow = self.run_ops(frame, body, path, inner)?;
                    path.pop();
                    path.pop();
                    match flow {
                        BodyFlow::Done => {}
                        other => return Ok(other),
                    }
                }
                Op::Loop { body } => {
                    // A cursor ending at the loop op itself is a back-edge
                    // record: the loop resumes with a fresh iteration. A
                    // longer cursor resumes inside the body.
                    if cursor.is_some_and(|c| c.path.len() == 1 && c.at == ResumeAt::LoopBackEdge) {
                        // A back-edge record is always the innermost of its
                        // cycle, so the rewind completes here. There is no
                        // call to deliver the payload into; it is dropped.
                        self.controller.finish_rewind()?;
                        self.buffer.reset();
                    }
                    let mut inner = cursor.filter(|c| c.path.len() > 1).map(|c| Cursor {
                        path: &c.path[1..],
                        at: c.at,
                    });
                    path.push(idx);
                    let flow = loop {
                        match self.run_ops(frame, body, path, inner.take())? {
                            BodyFlow::Done => {
                                if frame.is_checked_loop(path) && self.controller.is_unwinding() {
                                    let point =
                                        ResumePoint { path: path.clone(), at: ResumeAt::LoopBackEdge };
                                    self.push_record(frame, point)?;
                                    break BodyFlow::Unwound;
                                }
                            }
                            BodyFlow::Break => break BodyFlow::Done,
                            other => break other,
                        }
                    };
                    path.pop();
                    match flow {
                        BodyFlow::Done => {}
                        other => return Ok(other),
                    }
                }
                Op::Call { dst, callee, args } => {
                    let resuming =
                        cursor.is_some_and(|c| c.path.len() == 1 && c.at == ResumeAt::Call);
                    path.push(idx);
                    let site = path.clone();
                    path.pop();
                    let argv = self.collect_args(frame, args)?;
                    let flow = self.exec_call(frame, site, *dst, *callee, argv, resuming)?;
                    if let Some(flow) = flow {
                        return Ok(flow);
                    }
                }
                Op::CallIndirect { dst, class, target, args } => {
                    path.push(idx);
                    let site = path.clone();
                    path.pop();
                    let class_def = self
                        .program
                        .program()
                        .class(*class)
                        .ok_or_else(|| CoreError::MalformedBody(format!(
                            "unknown call class in `{}`",
                            frame.name
                        )))?;
                    let target_value = frame.get(*target)?;
                    let resolved = target_value.as_func().ok_or_else(|| {
                        CoreError::TypeError(format!(
                            "indirect call target must be a func, got {}",
                            target_value.type_name()
                        ))
                    })?;
                    if !class_def.contains(Callee::Func(resolved)) {
                        return Err(CoreError::BadIndirectTarget {
                            target: resolved,
                            class: class_def.signature.clone(),
                        });
                    }
                    let argv = self.collect_args(frame, args)?;
                    // An indirect site is re-driven on resume like a direct
                    // call; the restored target slot names the same callee,
                    // whose own entry check pops its record.
                    let flow =
                        self.exec_call(frame, site, *dst, Callee::Func(resolved), argv, false)?;
                    if let Some(flow) = flow {
                        return Ok(flow);
                    }
                }
            }
            idx += 1;
        }
        Ok(BodyFlow::Done)
    }

    fn collect_args(&self, frame: &Frame<'_>, slots: &[Slot]) -> CoreResult<Vec<Value>> {
        slots.iter().map(|&slot| frame.get(slot).cloned()).collect()
    }

    /// Execute one call site. Returns `Some(flow)` when the enclosing body
    /// must stop (unwind propagation), `None` to continue with the next op.
    fn exec_call(
        &mut self,
        frame: &mut Frame<'_>,
        site: Vec<usize>,
        dst: Option<Slot>,
        callee: Callee,
        args: Vec<Value>,
        resuming: bool,
    ) -> CoreResult<Option<BodyFlow>> {
        let result = match callee {
            Callee::Import(import) => {
                if resuming {
                    // The original suspension point: the cycle closes here
                    // and the host's payload becomes the call's result.
                    let payload = self.controller.finish_rewind()?;
                    self.buffer.reset();
                    payload.unwrap_or(Value::Unit)
                } else {
                    self.call_import(import, &args)?
                }
            }
            Callee::Func(func) => match self.exec_function(func, args)? {
                CallFlow::Return(value) => value,
                // The callee is mid-unwind; the sentinel below is never
                // legally observed.
                CallFlow::Unwound => Value::Unit,
            },
        };
        if self.controller.is_unwinding() {
            if frame.is_checked_site(&site) {
                let point = ResumePoint { path: site, at: ResumeAt::Call };
                self.push_record(frame, point)?;
                return Ok(Some(BodyFlow::Unwound));
            }
            // Unchecked caller: it never notices the unwind and keeps
            // executing. This is the undeclared-suspension hazard; the
            // frame it should have saved is lost.
        }
        if let Some(dst) = dst {
            frame.set(dst, result)?;
        }
        Ok(None)
    }

    fn push_record(&mut self, frame: &Frame<'_>, resume_at: ResumePoint) -> CoreResult<()> {
        self.buffer.push(FrameRecord {
            func: frame.func,
            resume_at,
            locals: frame.locals.clone(),
        })
    }
}

fn expect_bool(op: &str, value: &Value) -> CoreResult<bool> {
    value
        .as_bool()
        .ok_or_else(|| CoreError::TypeError(format!("{} expects a bool, got {}", op, value.type_name())))
}

fn numeric_binop(
    op: &str,
    lhs: &Value,
    rhs: &Value,
    int: impl Fn(i64, i64) -> Value,
    float: impl Fn(f64, f64) -> Value,
) -> CoreResult<Value> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Ok(int(*a, *b)),
        (Value::Float(a), Value::Float(b)) => Ok(float(*a, *b)),
        _ => Err(CoreError::TypeError(format!(
            "{} expects two ints or two floats, got {} and {}",
            op,
            lhs.type_name(),
            rhs.type_name()
        ))),
    }
}
