//! Worker Liveness State Machine
//!
//! ```text
//!              first sample
//! Starting ────────────────→ Running
//!    │  \                      │  \
//!    │   \ stop                │   \ stop
//!    │    └──────→ Stopping ←──┘    │
//!    │               │    \         │
//!    │        clean  │     \ error  │ crash / silence
//!    │               ↓      ↘       ↓
//!    └── EOS ──→ Exited(code)   Crashed(reason)
//! ```
//!
//! `Exited` and `Crashed` are terminal for a worker instance.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Liveness of one worker instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Liveness {
    /// Pipeline is being built, no frame processed yet
    Starting,

    /// At least one frame has been processed
    Running,

    /// Graceful stop requested
    Stopping,

    /// Pipeline terminated cleanly with the given exit code
    Exited(i32),

    /// Pipeline failed, was killed, or went silent
    Crashed(String),
}

impl Liveness {
    /// Check whether a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &Liveness) -> bool {
        matches!(
            (self, target),
            (Liveness::Starting, Liveness::Running)
                | (Liveness::Starting, Liveness::Stopping)
                | (Liveness::Starting, Liveness::Crashed(_))
                | (Liveness::Starting, Liveness::Exited(_))
                | (Liveness::Running, Liveness::Stopping)
                | (Liveness::Running, Liveness::Crashed(_))
                | (Liveness::Running, Liveness::Exited(_))
                | (Liveness::Stopping, Liveness::Exited(_))
                | (Liveness::Stopping, Liveness::Crashed(_))
        )
    }

    /// Attempt to transition to `target`. Returns `Err` if invalid.
    pub fn transition(&mut self, target: Liveness) -> Result<(), StateTransitionError> {
        if !self.can_transition_to(&target) {
            return Err(StateTransitionError {
                from: self.clone(),
                to: target,
            });
        }
        *self = target;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Liveness::Exited(_) | Liveness::Crashed(_))
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Liveness::Running)
    }

    /// Human-readable label (for logging / dashboard).
    pub fn label(&self) -> &str {
        match self {
            Liveness::Starting => "Starting",
            Liveness::Running => "Running",
            Liveness::Stopping => "Stopping",
            Liveness::Exited(_) => "Exited",
            Liveness::Crashed(_) => "Crashed",
        }
    }
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Liveness::Exited(code) => write!(f, "Exited({})", code),
            Liveness::Crashed(reason) => write!(f, "Crashed({})", reason),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// Error returned when an invalid liveness transition is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid liveness transition: {from} -> {to}")]
pub struct StateTransitionError {
    pub from: Liveness,
    pub to: Liveness,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut state = Liveness::Starting;
        state.transition(Liveness::Running).unwrap();
        state.transition(Liveness::Stopping).unwrap();
        state.transition(Liveness::Exited(0)).unwrap();
        assert_eq!(state, Liveness::Exited(0));
        assert!(state.is_terminal());
    }

    #[test]
    fn test_crash_from_live_states() {
        for s in [Liveness::Starting, Liveness::Running, Liveness::Stopping] {
            assert!(s.can_transition_to(&Liveness::Crashed("accelerator fault".into())));
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        let terminals = [Liveness::Exited(0), Liveness::Crashed("boom".into())];
        let targets = [
            Liveness::Starting,
            Liveness::Running,
            Liveness::Stopping,
            Liveness::Exited(1),
            Liveness::Crashed("again".into()),
        ];
        for from in &terminals {
            for to in &targets {
                assert!(!from.can_transition_to(to), "{} -> {} allowed", from, to);
            }
        }
    }

    #[test]
    fn test_invalid_transition() {
        let mut state = Liveness::Stopping;
        let err = state.transition(Liveness::Running).unwrap_err();
        assert_eq!(err.from, Liveness::Stopping);
        assert_eq!(err.to, Liveness::Running);
        assert!(err.to_string().contains("invalid liveness transition"));
        assert_eq!(state, Liveness::Stopping);
    }

    #[test]
    fn test_display() {
        assert_eq!(Liveness::Running.to_string(), "Running");
        assert_eq!(Liveness::Exited(0).to_string(), "Exited(0)");
        assert_eq!(
            Liveness::Crashed("decode error".into()).to_string(),
            "Crashed(decode error)"
        );
    }
}
