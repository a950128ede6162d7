//! Runtime errors.
//!
//! `StackOverflow` and `ProtocolViolation` are the two fatal conditions
//! the engine can detect synchronously. A third hazard,
//! undeclared suspension (a function outside the instrumentation set on
//! the stack when an unwind begins), is undetectable at run time by
//! design and therefore has no variant here; it manifests as silent state
//! corruption on rewind and is mitigated only by the advisory report.

use thiserror::Error;
use unspool_graph::{FuncId, ImportId};

/// Runtime execution errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Suspend buffer capacity exceeded during an unwind. Fatal; the
    /// in-flight cycle is aborted.
    #[error("suspend buffer overflow: capacity of {capacity} frames exceeded")]
    StackOverflow {
        /// Configured frame capacity
        capacity: usize,
    },

    /// Live call depth exceeded the configured limit. Fatal; unlike the
    /// suspend buffer capacity this bounds ordinary recursion.
    #[error("call depth limit of {limit} frames exceeded")]
    CallDepthExceeded {
        /// Configured depth limit
        limit: usize,
    },

    /// An entry point was invoked while the controller was not in the
    /// required state (double-suspend, resume without a pending unwind,
    /// reentrant run while a cycle is open).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Unknown function id.
    #[error("unknown function id {0:?}")]
    UnknownFunction(FuncId),

    /// Unknown import id.
    #[error("unknown import id {0:?}")]
    UnknownImport(ImportId),

    /// An import was called but no handler is registered for it.
    #[error("no handler registered for import `{0}`")]
    UndefinedImport(String),

    /// A call passed the wrong number of arguments.
    #[error("arity mismatch calling `{name}`: expected {expected} args, got {got}")]
    ArityMismatch {
        /// Callee name
        name: String,
        /// Expected argument count
        expected: usize,
        /// Supplied argument count
        got: usize,
    },

    /// An op received a value of the wrong shape.
    #[error("type error: {0}")]
    TypeError(String),

    /// An indirect call's runtime target is not a member of its class.
    #[error("indirect call target {target:?} is not in class `{class}`")]
    BadIndirectTarget {
        /// The resolved target
        target: FuncId,
        /// The class signature
        class: String,
    },

    /// A slot index fell outside the frame. The builder validates bodies,
    /// so this indicates a corrupted frame record.
    #[error("slot {slot} out of bounds in `{func}`")]
    SlotOutOfBounds {
        /// Function name
        func: String,
        /// Offending slot
        slot: usize,
    },

    /// A body shape the builder should have rejected.
    #[error("malformed body: {0}")]
    MalformedBody(String),
}

/// Runtime execution result.
pub type CoreResult<T> = Result<T, CoreError>;
