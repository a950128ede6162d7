//! Execution controller: the three-state machine every instrumented
//! function consults.
//!
//! One controller belongs to one execution context. Transitions are
//! checked: at most one unwind/rewind cycle may be open at a time, and
//! any attempt to open a second one, or to resume a cycle that is not
//! pending, is a protocol violation surfaced immediately rather than
//! silently queued.

use crate::error::{CoreError, CoreResult};
use unspool_graph::Value;

/// The execution state of one context.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecState {
    /// Ordinary execution. Initial state, and the terminal state when the
    /// program exits normally.
    Normal,
    /// Control is propagating outward to the top-level entry, saving each
    /// traversed frame.
    Unwinding,
    /// Control is propagating inward from the top-level entry, restoring
    /// each saved frame.
    Rewinding,
}

/// State machine plus the pending result payload delivered on resume.
#[derive(Debug)]
pub struct Controller {
    state: ExecState,
    payload: Option<Value>,
}

impl Controller {
    /// Create a controller in the `Normal` state.
    pub fn new() -> Self {
        Self { state: ExecState::Normal, payload: None }
    }

    /// Current state.
    pub fn state(&self) -> ExecState {
        self.state
    }

    /// Whether the state is `Normal`.
    pub fn is_normal(&self) -> bool {
        self.state == ExecState::Normal
    }

    /// Whether the state is `Unwinding`.
    pub fn is_unwinding(&self) -> bool {
        self.state == ExecState::Unwinding
    }

    /// Whether the state is `Rewinding`.
    pub fn is_rewinding(&self) -> bool {
        self.state == ExecState::Rewinding
    }

    /// `Normal → Unwinding`. Begins a suspension cycle.
    pub fn begin_unwind(&mut self) -> CoreResult<()> {
        if self.state != ExecState::Normal {
            return Err(CoreError::ProtocolViolation(format!(
                "begin-suspend while a cycle is already open (state {:?})",
                self.state
            )));
        }
        self.state = ExecState::Unwinding;
        Ok(())
    }

    /// `Unwinding → Rewinding`. Stores the host's result payload.
    pub fn begin_rewind(&mut self, payload: Option<Value>) -> CoreResult<()> {
        if self.state != ExecState::Unwinding {
            return Err(CoreError::ProtocolViolation(format!(
                "resume without a pending unwind (state {:?})",
                self.state
            )));
        }
        self.state = ExecState::Rewinding;
        self.payload = payload;
        Ok(())
    }

    /// `Rewinding → Normal`. Consumes and returns the payload; called at
    /// the exact call site that triggered the suspension.
    pub fn finish_rewind(&mut self) -> CoreResult<Option<Value>> {
        if self.state != ExecState::Rewinding {
            return Err(CoreError::ProtocolViolation(format!(
                "rewind completion outside of a rewind (state {:?})",
                self.state
            )));
        }
        self.state = ExecState::Normal;
        Ok(self.payload.take())
    }

    /// Force the controller back to `Normal`, dropping any payload. Used
    /// only when a fatal error aborts the cycle.
    pub fn reset(&mut self) {
        self.state = ExecState::Normal;
        self.payload = None;
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_cycle() {
        let mut ctl = Controller::new();
        assert!(ctl.is_normal());
        ctl.begin_unwind().unwrap();
        assert!(ctl.is_unwinding());
        ctl.begin_rewind(Some(Value::Int(3))).unwrap();
        assert!(ctl.is_rewinding());
        assert_eq!(ctl.finish_rewind().unwrap(), Some(Value::Int(3)));
        assert!(ctl.is_normal());
        // Payload was consumed.
        ctl.begin_unwind().unwrap();
        ctl.begin_rewind(None).unwrap();
        assert_eq!(ctl.finish_rewind().unwrap(), None);
    }

    #[test]
    fn test_double_unwind_rejected() {
        let mut ctl = Controller::new();
        ctl.begin_unwind().unwrap();
        assert!(matches!(ctl.begin_unwind(), Err(CoreError::ProtocolViolation(_))));
        // The open cycle is untouched by the rejection.
        assert!(ctl.is_unwinding());
    }

    #[test]
    fn test_resume_from_normal_rejected() {
        let mut ctl = Controller::new();
        assert!(matches!(ctl.begin_rewind(None), Err(CoreError::ProtocolViolation(_))));
    }

    #[test]
    fn test_resume_while_rewinding_rejected() {
        let mut ctl = Controller::new();
        ctl.begin_unwind().unwrap();
        ctl.begin_rewind(None).unwrap();
        assert!(matches!(ctl.begin_rewind(None), Err(CoreError::ProtocolViolation(_))));
    }

    #[test]
    fn test_finish_outside_rewind_rejected() {
        let mut ctl = Controller::new();
        assert!(matches!(ctl.finish_rewind(), Err(CoreError::ProtocolViolation(_))));
    }
}
