//! Process run state machine.
//!
//! Exhaustive match over explicit edges: every legal transition is named,
//! everything else is rejected rather than silently coerced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Waiting,
    Compensating,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Compensating => "compensating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "waiting" => Self::Waiting,
            "compensating" => Self::Compensating,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => Self::Pending,
        }
    }

    /// Terminal states are absorbing (property 6): no edge leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Validate `self -> next`. Cancellation is legal from any
    /// non-terminal state (the orchestrator checks it at the next ack
    /// point, per §5's cancellation rule) and never runs compensation.
    pub fn validate_transition(&self, next: RunStatus) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::TerminalState { from: *self, to: next });
        }

        let legal = match (*self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending, Self::Cancelled) => true,
            (Self::Running, Self::Waiting) => true,
            (Self::Running, Self::Completed) => true,
            (Self::Running, Self::Compensating) => true,
            (Self::Running, Self::Cancelled) => true,
            (Self::Waiting, Self::Running) => true,
            (Self::Waiting, Self::Cancelled) => true,
            (Self::Waiting, Self::Compensating) => true,
            (Self::Compensating, Self::Failed) => true,
            (Self::Compensating, Self::Cancelled) => true,
            _ => false,
        };

        if legal {
            Ok(())
        } else {
            Err(TransitionError::IllegalEdge { from: *self, to: next })
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("run is in terminal state {from:?}, cannot move to {to:?}")]
    TerminalState { from: RunStatus, to: RunStatus },
    #[error("illegal run transition {from:?} -> {to:?}")]
    IllegalEdge { from: RunStatus, to: RunStatus },
}

/// A persisted process run. `context` is append-only (§3 invariant): callers
/// add keys via [`ProcessRun::record_context`], never remove them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRun {
    pub run_id: String,
    pub process_name: String,
    pub status: RunStatus,
    pub current_step: i32,
    pub inputs: serde_json::Value,
    pub context: serde_json::Value,
    pub outputs: Option<serde_json::Value>,
    pub error: Option<String>,
    pub deployed_version_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProcessRun {
    /// Merge `key: value` into `context`, creating the object if absent.
    /// Never overwrites a previously recorded key with a different one —
    /// callers pick distinct keys per step.
    pub fn record_context(&mut self, key: &str, value: serde_json::Value) {
        if !self.context.is_object() {
            self.context = serde_json::json!({});
        }
        self.context
            .as_object_mut()
            .expect("context coerced to object above")
            .insert(key.to_string(), value);
    }

    pub fn transition(&mut self, next: RunStatus) -> Result<(), TransitionError> {
        self.status.validate_transition(next)?;
        self.status = next;
        self.updated_at = Utc::now();
        if next.is_terminal() {
            self.completed_at = Some(self.updated_at);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_absorbing() {
        for terminal in [RunStatus::Completed, RunStatus::Failed, RunStatus::Cancelled] {
            let err = terminal.validate_transition(RunStatus::Running).unwrap_err();
            assert!(matches!(err, TransitionError::TerminalState { .. }));
        }
    }

    #[test]
    fn pending_to_running_to_completed_is_legal() {
        assert!(RunStatus::Pending.validate_transition(RunStatus::Running).is_ok());
        assert!(RunStatus::Running.validate_transition(RunStatus::Completed).is_ok());
    }

    #[test]
    fn running_to_waiting_to_running_round_trip_is_legal() {
        assert!(RunStatus::Running.validate_transition(RunStatus::Waiting).is_ok());
        assert!(RunStatus::Waiting.validate_transition(RunStatus::Running).is_ok());
    }

    #[test]
    fn pending_cannot_jump_to_completed() {
        let err = RunStatus::Pending
            .validate_transition(RunStatus::Completed)
            .unwrap_err();
        assert!(matches!(err, TransitionError::IllegalEdge { .. }));
    }

    #[test]
    fn compensation_only_ends_in_failed_or_cancelled() {
        assert!(RunStatus::Compensating
            .validate_transition(RunStatus::Failed)
            .is_ok());
        assert!(RunStatus::Compensating
            .validate_transition(RunStatus::Completed)
            .is_err());
    }
}
