//! Declarative process definitions: what the orchestrator executes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

/// What starts a run: an entity lifecycle callback, a status transition, a
/// cron schedule, or an explicit caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    EntityEvent {
        entity_name: String,
        event_type: String,
    },
    StatusTransition {
        entity_name: String,
        from_status: String,
        to_status: String,
    },
    Schedule {
        cron: String,
    },
    Manual,
}

/// One step in a [`ProcessSpec`]. `on_failure` names another step (by
/// `name`) in the same spec's `steps` list to run as compensation when this
/// step exhausts its retries; it is never itself invoked directly by the
/// forward walk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub name: String,
    pub kind: StepKind,
    pub on_failure: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Invoke a named domain function with `run.inputs ∪ run.context`.
    Service {
        function_name: String,
        #[serde(default)]
        retry_policy: RetryPolicy,
    },
    /// Suspend the run for a human decision among `outcomes`.
    HumanTask {
        surface_name: String,
        outcomes: Vec<String>,
        timeout_secs: i64,
        escalation_interval_secs: i64,
    },
    /// Suspend until a timer fires or a named signal arrives.
    Wait {
        timeout_secs: Option<i64>,
        signal_name: Option<String>,
    },
    /// Fire-and-forget emission on a named channel.
    Send { channel: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessSpec {
    pub name: String,
    pub trigger: Trigger,
    pub steps: Vec<Step>,
}

impl ProcessSpec {
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_at(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_lookup_by_name() {
        let spec = ProcessSpec {
            name: "checkout".into(),
            trigger: Trigger::Manual,
            steps: vec![Step {
                name: "charge_card".into(),
                kind: StepKind::Service {
                    function_name: "charge_card".into(),
                    retry_policy: RetryPolicy::default(),
                },
                on_failure: Some("release_inventory".into()),
            }],
        };
        assert!(spec.step("charge_card").is_some());
        assert!(spec.step("missing").is_none());
    }
}
