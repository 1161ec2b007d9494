//! Human task state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Escalated,
    Expired,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Escalated => "escalated",
            Self::Expired => "expired",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "escalated" => Self::Escalated,
            "expired" => Self::Expired,
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Expired | Self::Completed | Self::Cancelled)
    }

    /// Completion and reassignment are only legal from `Pending` or
    /// `Escalated` (§3 invariant). Escalation only fires from `Pending`;
    /// expiry only from `Escalated`.
    pub fn validate_transition(&self, next: TaskStatus) -> Result<(), TaskTransitionError> {
        if self.is_terminal() {
            return Err(TaskTransitionError::TerminalState { from: *self, to: next });
        }

        let legal = match (*self, next) {
            (Self::Pending, Self::Escalated) => true,
            (Self::Pending, Self::Completed) => true,
            (Self::Pending, Self::Cancelled) => true,
            (Self::Escalated, Self::Expired) => true,
            (Self::Escalated, Self::Completed) => true,
            (Self::Escalated, Self::Cancelled) => true,
            _ => false,
        };

        if legal {
            Ok(())
        } else {
            Err(TaskTransitionError::IllegalEdge { from: *self, to: next })
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskTransitionError {
    #[error("task is in terminal state {from:?}, cannot move to {to:?}")]
    TerminalState { from: TaskStatus, to: TaskStatus },
    #[error("illegal task transition {from:?} -> {to:?}")]
    IllegalEdge { from: TaskStatus, to: TaskStatus },
    #[error("outcome {outcome:?} is not in the step's declared outcome set {declared:?}")]
    OutcomeNotDeclared {
        outcome: String,
        declared: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessTask {
    pub task_id: String,
    pub run_id: String,
    pub step_name: String,
    pub surface_name: String,
    pub entity_name: Option<String>,
    pub entity_id: Option<String>,
    pub assignee_id: Option<String>,
    pub assignee_role: Option<String>,
    pub status: TaskStatus,
    pub outcome: Option<String>,
    pub outcome_data: Option<serde_json::Value>,
    pub due_at: DateTime<Utc>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ProcessTask {
    /// Complete with `outcome`, validated against the step's declared
    /// outcome set (property 8, human-task outcome law).
    pub fn complete(
        &mut self,
        outcome: &str,
        outcome_data: Option<serde_json::Value>,
        declared_outcomes: &[String],
    ) -> Result<(), TaskTransitionError> {
        if !declared_outcomes.iter().any(|o| o == outcome) {
            return Err(TaskTransitionError::OutcomeNotDeclared {
                outcome: outcome.to_string(),
                declared: declared_outcomes.to_vec(),
            });
        }
        self.status.validate_transition(TaskStatus::Completed)?;
        self.status = TaskStatus::Completed;
        self.outcome = Some(outcome.to_string());
        // Decided (DESIGN.md Open Question c): a no-data outcome still
        // records an explicit Null rather than leaving the key absent.
        self.outcome_data = Some(outcome_data.unwrap_or(serde_json::Value::Null));
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn escalate(&mut self) -> Result<(), TaskTransitionError> {
        self.status.validate_transition(TaskStatus::Escalated)?;
        self.status = TaskStatus::Escalated;
        self.escalated_at = Some(Utc::now());
        Ok(())
    }

    pub fn expire(&mut self) -> Result<(), TaskTransitionError> {
        self.status.validate_transition(TaskStatus::Expired)?;
        self.status = TaskStatus::Expired;
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), TaskTransitionError> {
        self.status.validate_transition(TaskStatus::Cancelled)?;
        self.status = TaskStatus::Cancelled;
        Ok(())
    }

    /// Reassignment is legal only from `pending|escalated`; `reason` is the
    /// caller's justification, logged by the orchestrator, not stored on
    /// the task record itself.
    pub fn reassign(&mut self, assignee_id: Option<String>) -> Result<(), TaskTransitionError> {
        if self.status.is_terminal() {
            return Err(TaskTransitionError::TerminalState {
                from: self.status,
                to: self.status,
            });
        }
        self.assignee_id = assignee_id;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(status: TaskStatus) -> ProcessTask {
        ProcessTask {
            task_id: "t1".into(),
            run_id: "r1".into(),
            step_name: "approve".into(),
            surface_name: "approval_form".into(),
            entity_name: None,
            entity_id: None,
            assignee_id: None,
            assignee_role: None,
            status,
            outcome: None,
            outcome_data: None,
            due_at: Utc::now(),
            escalated_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn completion_requires_declared_outcome() {
        let mut t = task(TaskStatus::Pending);
        let err = t
            .complete("bogus", None, &["approve".into(), "reject".into()])
            .unwrap_err();
        assert!(matches!(err, TaskTransitionError::OutcomeNotDeclared { .. }));
    }

    #[test]
    fn completion_with_valid_outcome_records_null_data_when_absent() {
        let mut t = task(TaskStatus::Pending);
        t.complete("approve", None, &["approve".into(), "reject".into()])
            .unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.outcome_data, Some(serde_json::Value::Null));
    }

    #[test]
    fn completion_only_legal_from_pending_or_escalated() {
        let mut t = task(TaskStatus::Expired);
        let err = t.complete("approve", None, &["approve".into()]).unwrap_err();
        assert!(matches!(err, TaskTransitionError::TerminalState { .. }));
    }

    #[test]
    fn escalation_then_expiry_is_legal() {
        let mut t = task(TaskStatus::Pending);
        t.escalate().unwrap();
        assert_eq!(t.status, TaskStatus::Escalated);
        t.expire().unwrap();
        assert_eq!(t.status, TaskStatus::Expired);
    }

    #[test]
    fn reassignment_rejected_once_terminal() {
        let mut t = task(TaskStatus::Completed);
        assert!(t.reassign(Some("someone".into())).is_err());
    }
}
