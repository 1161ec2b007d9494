//! Entity-event bridge: routes CRUD lifecycle callbacks to registered
//! process triggers. Created/updated/deleted events match against a
//! registered trigger table; a status-transition trigger further checks
//! the entity's configured status field. A trigger that fails to start its
//! process is logged and swallowed rather than propagated to the caller —
//! an entity write should never fail because a downstream process couldn't
//! be started.

use std::sync::Arc;

use dazzle_orchestrator::Orchestrator;
use dazzle_process::{ProcessSpec, Trigger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityEventType {
    Created,
    Updated,
    Deleted,
}

impl EntityEventType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

/// Routes CRUD callbacks to process starts. Holds no state of its own
/// beyond the orchestrator handle — specs live in `dazzle-process`'s store.
pub struct EntityEventBridge {
    orchestrator: Arc<Orchestrator>,
}

impl EntityEventBridge {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Called after a CRUD operation commits. Never propagates an error to
    /// the caller — failures are logged and swallowed so a broken process
    /// trigger can't fail the originating CRUD operation.
    pub async fn on_entity_event(
        &self,
        entity_name: &str,
        entity_id: &str,
        event_type: EntityEventType,
        snapshot: serde_json::Value,
    ) {
        let specs = match self.orchestrator.store().list_specs().await {
            Ok(specs) => specs,
            Err(err) => {
                tracing::error!(entity_name, error = %err, "failed to list process specs");
                return;
            }
        };

        for spec in specs.iter().filter(|s| matches_entity_event(s, entity_name, event_type)) {
            let inputs = serde_json::json!({
                "entity_id": entity_id,
                "entity_name": entity_name,
                "event_type": event_type.as_str(),
                "entity": snapshot,
            });
            self.start_or_log(spec, inputs).await;
        }
    }

    /// Called after an update, in addition to [`Self::on_entity_event`] with
    /// `Updated`. Compares `status_field` (defaulting to `"status"`) between
    /// `old_snapshot` and `new_snapshot`; fires status-transition triggers
    /// only when that field actually changed.
    pub async fn on_status_transition(
        &self,
        entity_name: &str,
        entity_id: &str,
        status_field: Option<&str>,
        old_snapshot: &serde_json::Value,
        new_snapshot: &serde_json::Value,
    ) {
        let field = status_field.unwrap_or("status");
        let old_status = old_snapshot.get(field).and_then(|v| v.as_str());
        let new_status = new_snapshot.get(field).and_then(|v| v.as_str());

        let (Some(old_status), Some(new_status)) = (old_status, new_status) else {
            return;
        };
        if old_status == new_status {
            return;
        }

        let specs = match self.orchestrator.store().list_specs().await {
            Ok(specs) => specs,
            Err(err) => {
                tracing::error!(entity_name, error = %err, "failed to list process specs");
                return;
            }
        };

        for spec in specs
            .iter()
            .filter(|s| matches_status_transition(s, entity_name, old_status, new_status))
        {
            let inputs = serde_json::json!({
                "entity_id": entity_id,
                "entity_name": entity_name,
                "old_status": old_status,
                "new_status": new_status,
            });
            self.start_or_log(spec, inputs).await;
        }
    }

    async fn start_or_log(&self, spec: &ProcessSpec, inputs: serde_json::Value) {
        if let Err(err) = self
            .orchestrator
            .start_process(&spec.name, inputs, None, None)
            .await
        {
            tracing::error!(process = %spec.name, error = %err, "failed to start process from entity trigger");
        }
    }
}

fn matches_entity_event(spec: &ProcessSpec, entity_name: &str, event_type: EntityEventType) -> bool {
    matches!(
        &spec.trigger,
        Trigger::EntityEvent { entity_name: e, event_type: t }
            if e == entity_name && t == event_type.as_str()
    )
}

fn matches_status_transition(
    spec: &ProcessSpec,
    entity_name: &str,
    old_status: &str,
    new_status: &str,
) -> bool {
    matches!(
        &spec.trigger,
        Trigger::StatusTransition { entity_name: e, from_status, to_status }
            if e == entity_name && from_status == old_status && to_status == new_status
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_event_trigger_matches_exact_entity_and_type() {
        let spec = ProcessSpec {
            name: "on_task_created".into(),
            trigger: Trigger::EntityEvent {
                entity_name: "Task".into(),
                event_type: "created".into(),
            },
            steps: vec![],
        };
        assert!(matches_entity_event(&spec, "Task", EntityEventType::Created));
        assert!(!matches_entity_event(&spec, "Task", EntityEventType::Updated));
        assert!(!matches_entity_event(&spec, "Order", EntityEventType::Created));
    }

    #[test]
    fn status_transition_trigger_matches_exact_edge() {
        let spec = ProcessSpec {
            name: "on_task_done".into(),
            trigger: Trigger::StatusTransition {
                entity_name: "Task".into(),
                from_status: "pending".into(),
                to_status: "done".into(),
            },
            steps: vec![],
        };
        assert!(matches_status_transition(&spec, "Task", "pending", "done"));
        assert!(!matches_status_transition(&spec, "Task", "pending", "cancelled"));
    }
}
