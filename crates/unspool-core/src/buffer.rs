//! The suspend buffer: saved frame records for one unwind/rewind cycle.
//!
//! During an unwind, each instrumented frame appends a record as control
//! passes outward, so the innermost frame sits at the bottom. During the
//! rewind, records are popped from the top: the outermost function is
//! restored first and execution walks back inward, replaying the outward
//! sequence in reverse until it reaches the original suspension point.
//!
//! Capacity is fixed. Pushing past it is a stack overflow, a fatal error
//! that aborts the cycle.

use crate::error::{CoreError, CoreResult};
use unspool_graph::{FuncId, Value};

/// What kind of location a frame resumes at.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResumeAt {
    /// A call site; on rewind the call is re-driven (or, at the original
    /// suspension point, the payload is delivered as its result).
    Call,
    /// A loop back-edge; on rewind the loop continues with its next
    /// iteration.
    LoopBackEdge,
}

/// Location within a function body: a path of indices through nested
/// bodies, plus the kind of point it addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePoint {
    /// Path to the op (see [`unspool_graph::CallSite`] for the encoding)
    pub path: Vec<usize>,
    /// Kind of resume point
    pub at: ResumeAt,
}

/// One saved call frame: which function, where to resume, and the live
/// locals at that point. Created during unwinding, consumed and destroyed
/// during the matching rewind.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    /// The function this frame belongs to
    pub func: FuncId,
    /// Where the function resumes
    pub resume_at: ResumePoint,
    /// Snapshot of the frame's local slots
    pub locals: Vec<Value>,
}

/// Fixed-capacity record stack for one suspension cycle.
#[derive(Debug)]
pub struct SuspendBuffer {
    records: Vec<FrameRecord>,
    capacity: usize,
}

impl SuspendBuffer {
    /// Create a buffer with the given frame capacity.
    pub fn new(capacity: usize) -> Self {
        Self { records: Vec::new(), capacity }
    }

    /// Append a record in unwind order (innermost first).
    pub fn push(&mut self, record: FrameRecord) -> CoreResult<()> {
        if self.records.len() >= self.capacity {
            return Err(CoreError::StackOverflow { capacity: self.capacity });
        }
        self.records.push(record);
        Ok(())
    }

    /// The record the rewind restores next (outermost remaining frame).
    pub fn peek(&self) -> Option<&FrameRecord> {
        self.records.last()
    }

    /// Remove and return the next record to restore.
    pub fn pop(&mut self) -> Option<FrameRecord> {
        self.records.pop()
    }

    /// Number of saved frames.
    pub fn depth(&self) -> usize {
        self.records.len()
    }

    /// Whether the buffer holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Empty the buffer. Called exactly when a cycle completes and control
    /// returns to `Normal`, or when a fatal error aborts the cycle.
    pub fn reset(&mut self) {
        self.records.clear();
    }
}
