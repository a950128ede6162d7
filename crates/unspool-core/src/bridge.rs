//! The host bridge: import handlers and the resume half of the protocol.
//!
//! Imports are the only place a program touches the host. A handler
//! decides, per call, whether to answer synchronously or to suspend the
//! whole context. Suspension hands the host a [`HostTask`] describing the
//! deferred work; once the host has performed it (on whatever executor it
//! likes), [`Engine::resume`] re-drives the entry point through a rewind
//! and delivers the result at the original call site. The engine itself
//! never blocks and never owns an event loop.

use crate::error::{CoreError, CoreResult};
use crate::exec::{Engine, Outcome};
use unspool_graph::{ImportId, Value};

/// What an import handler tells the engine to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ImportAction {
    /// Answer immediately with this value; execution continues inline.
    Return(Value),
    /// Suspend the context. The values become the task detail the host
    /// receives; the handler's eventual result arrives via resume.
    Suspend(Vec<Value>),
    /// Suspend with no deferred work: a cooperative yield. Resuming with
    /// no payload continues the program.
    Yield,
}

/// Deferred work description handed to the host on suspension.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    /// The import whose handler suspended
    pub import: ImportId,
    /// Handler-supplied detail values
    pub detail: Vec<Value>,
}

/// The reason a context suspended.
#[derive(Debug, Clone, PartialEq)]
pub enum HostTask {
    /// Asynchronous work the host must perform before resuming.
    Async(TaskRequest),
    /// A bare yield; resume whenever convenient.
    Yield,
}

/// Host-side implementation of one import.
///
/// Implemented for any `FnMut(&[Value]) -> ImportAction`, which covers
/// most handlers; implement the trait directly when the handler needs
/// named state.
pub trait ImportHandler {
    /// Handle one call with the evaluated arguments.
    fn call(&mut self, args: &[Value]) -> ImportAction;
}

impl<F> ImportHandler for F
where
    F: FnMut(&[Value]) -> ImportAction,
{
    fn call(&mut self, args: &[Value]) -> ImportAction {
        self(args)
    }
}

impl Engine {
    /// Dispatch an import call to its handler and act on the verdict.
    ///
    /// On a suspending verdict the controller flips to `Unwinding` and the
    /// returned value is an inert placeholder the caller's checked site
    /// discards while saving its frame.
    pub(crate) fn call_import(&mut self, import: ImportId, args: &[Value]) -> CoreResult<Value> {
        let decl = self
            .program()
            .import(import)
            .ok_or(CoreError::UnknownImport(import))?;
        let name = decl.name.clone();
        let arity = decl.arity;
        if args.len() != arity {
            return Err(CoreError::ArityMismatch {
                name,
                expected: arity,
                got: args.len(),
            });
        }
        let handler = self
            .import_handler(import)
            .ok_or(CoreError::UndefinedImport(name))?;
        match handler.call(args) {
            ImportAction::Return(value) => Ok(value),
            ImportAction::Suspend(detail) => {
                self.begin_suspend(HostTask::Async(TaskRequest { import, detail }))?;
                Ok(Value::Unit)
            }
            ImportAction::Yield => {
                self.begin_suspend(HostTask::Yield)?;
                Ok(Value::Unit)
            }
        }
    }

    /// Open a suspension cycle. Rejected with the open cycle left intact
    /// if one is already in flight.
    fn begin_suspend(&mut self, task: HostTask) -> CoreResult<()> {
        self.controller.begin_unwind()?;
        self.pending_task = Some(task);
        Ok(())
    }

    /// Resume a suspended context with the host's result.
    ///
    /// Re-drives the entry point; instrumented functions skip straight to
    /// their saved resume locations, and `result` becomes the value of the
    /// import call that suspended (`None` delivers a unit). The program
    /// may run to completion or suspend again.
    pub fn resume(&mut self, result: Option<Value>) -> CoreResult<Outcome> {
        self.controller.begin_rewind(result)?;
        let (entry, args) = self.entry_invocation().ok_or_else(|| {
            CoreError::ProtocolViolation("resume with no suspended entry point".into())
        })?;
        self.drive(entry, args)
    }
}
