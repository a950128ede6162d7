//! Suspend/resume runtime for call-graph programs.
//!
//! This crate provides the dynamic half of the unspool engine:
//! - the instrumentor, which turns an [`unspool_graph::Analysis`] into
//!   per-function save/restore plans
//! - the suspend buffer holding saved frame records across one
//!   unwind/rewind cycle
//! - the three-state execution controller (Normal / Unwinding / Rewinding)
//! - the interpreting engine that drives instrumented function bodies
//! - the async bridge connecting host-driven asynchronous work to the
//!   controller's state transitions
//!
//! One [`Engine`] is one logical execution context. Hosts that want
//! several independent contexts create several engines; nothing is shared
//! between them.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bridge;
pub mod buffer;
pub mod error;
pub mod exec;
pub mod instrument;
pub mod state;

/// Re-export of the static side of the engine.
pub use unspool_graph as graph;

pub use bridge::{HostTask, ImportAction, ImportHandler, TaskRequest};
pub use buffer::{FrameRecord, ResumeAt, ResumePoint, SuspendBuffer};
pub use error::{CoreError, CoreResult};
pub use exec::{Engine, EngineOptions, Outcome};
pub use instrument::{instrument, FnPlan, InstrumentedProgram};
pub use state::{Controller, ExecState};
pub use unspool_graph::Value;
