//! Static side of the unspool engine.
//!
//! This crate models a whole program as a call graph (functions, call
//! sites, loop back-edges, and indirect-call classes) and computes the
//! set of functions that must be prepared to suspend and resume: any
//! function from which a suspending host import is reachable through
//! direct calls, or conservatively through indirect calls.
//!
//! The companion crate `unspool-core` consumes the [`Analysis`] produced
//! here and attaches the save/restore instrumentation that makes the
//! suspend cycle work at run time.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod advisory;
pub mod analyzer;
pub mod config;
pub mod program;
pub mod value;

pub use advisory::{AdvisoryEntry, AdvisoryReport};
pub use analyzer::{analyze, compose_overrides, Analysis, WitnessCause};
pub use config::{AnalyzerConfig, ConfigError, IndirectCallPolicy, ResolvedConfig};
pub use program::{
    BuildError, CallClass, CallSite, Callee, ClassId, FuncId, Function, ImportDecl, ImportId, Op,
    Program, ProgramBuilder, SiteTarget, Slot,
};
pub use value::Value;
