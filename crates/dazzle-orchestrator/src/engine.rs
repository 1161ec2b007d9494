//! Step executor: walks a `ProcessSpec` for a `ProcessRun`, handling
//! retries, saga compensation, human tasks, scheduling, signals, and
//! cancellation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration as ChronoDuration, Utc};
use dazzle_bus::Bus;
use dazzle_process::{
    ProcessRun, ProcessSpec, ProcessStore, RunStatus, Step, StepKind, TaskTransitionError,
};
use tokio::sync::Mutex;

use crate::registry::{FunctionRegistry, StepFunctionError};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("process store error: {0}")]
    Store(#[from] dazzle_process::StoreError),
    #[error("run transition error: {0}")]
    RunTransition(#[from] dazzle_process::TransitionError),
    #[error("task transition error: {0}")]
    TaskTransition(#[from] TaskTransitionError),
    #[error("step {0} has no registered function")]
    UnknownFunction(String),
    #[error("spec {spec} has no step named {step}")]
    UnknownStep { spec: String, step: String },
    #[error("step {step} failed: {message}")]
    StepExecution { step: String, message: String },
    #[error("bus error: {0}")]
    Bus(#[from] dazzle_bus::BusError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

fn merge_step_input(inputs: &serde_json::Value, context: &serde_json::Value) -> serde_json::Value {
    let mut merged = inputs.as_object().cloned().unwrap_or_default();
    if let Some(ctx_obj) = context.as_object() {
        for (k, v) in ctx_obj {
            merged.insert(k.clone(), v.clone());
        }
    }
    serde_json::Value::Object(merged)
}

/// Coroutine-free executor: a loop over persisted state, not a stack of
/// suspended frames (DESIGN.md's "coroutine control flow" decision). Every
/// call re-reads its run from `store`, advances it in memory, and saves it
/// back at the next boundary.
pub struct Orchestrator {
    store: ProcessStore,
    bus: Option<Arc<dyn Bus>>,
    registry: FunctionRegistry,
    run_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(store: ProcessStore, bus: Option<Arc<dyn Bus>>, registry: FunctionRegistry) -> Self {
        Self {
            store,
            bus,
            registry,
            run_locks: Mutex::new(HashMap::new()),
        }
    }

    /// External actors send intents (complete task, cancel, signal); this
    /// serializes them per run (§5's shared-resource policy) without
    /// blocking unrelated runs.
    async fn lock_for(&self, run_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.run_locks.lock().await;
        locks
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn register_spec(&self, spec: &ProcessSpec) -> Result<()> {
        self.store.put_spec(spec).await?;
        Ok(())
    }

    /// Start a new run and drive it forward until it suspends or finishes.
    /// `idempotency_key`, if set and already seen for this process, returns
    /// the existing run instead of creating a duplicate.
    pub async fn start_process(
        &self,
        process_name: &str,
        inputs: serde_json::Value,
        deployed_version_id: Option<String>,
        idempotency_key: Option<String>,
    ) -> Result<ProcessRun> {
        let mut run = self
            .store
            .create_run(process_name, inputs, deployed_version_id, idempotency_key)
            .await?;

        let lock = self.lock_for(&run.run_id).await;
        let _guard = lock.lock().await;

        if run.status == RunStatus::Pending {
            run.transition(RunStatus::Running)?;
            self.store.save_run(&run).await?;
        }

        self.advance(&mut run).await?;
        Ok(run)
    }

    /// Re-enter an existing run and walk forward until it suspends or
    /// finishes. Called after `start_process`, `complete_task`, and
    /// `signal`.
    async fn advance(&self, run: &mut ProcessRun) -> Result<()> {
        let spec = self.store.get_spec(&run.process_name).await?;

        loop {
            if run.status.is_terminal() {
                return Ok(());
            }

            let Some(step) = spec.step_at(run.current_step as usize) else {
                run.transition(RunStatus::Completed)?;
                self.store.save_run(run).await?;
                return Ok(());
            };

            match &step.kind {
                StepKind::Service { function_name, retry_policy } => {
                    let merged = merge_step_input(&run.inputs, &run.context);
                    let function = self
                        .registry
                        .get(function_name)
                        .ok_or_else(|| OrchestratorError::UnknownFunction(function_name.clone()))?;

                    match self.call_with_retry(&function, &merged, retry_policy).await {
                        Ok(output) => {
                            run.record_context(&step.name, output);
                            run.current_step += 1;
                            self.store.save_run(run).await?;
                        }
                        Err(message) => {
                            self.fail_and_compensate(run, &spec, step, &message).await?;
                            return Ok(());
                        }
                    }
                }
                StepKind::HumanTask {
                    surface_name,
                    timeout_secs,
                    ..
                } => {
                    let due_at = Utc::now() + ChronoDuration::seconds(*timeout_secs);
                    self.store
                        .create_task(
                            &run.run_id,
                            &step.name,
                            surface_name,
                            None,
                            None,
                            None,
                            None,
                            due_at,
                        )
                        .await?;
                    run.transition(RunStatus::Waiting)?;
                    self.store.save_run(run).await?;
                    return Ok(());
                }
                StepKind::Wait { .. } => {
                    run.transition(RunStatus::Waiting)?;
                    self.store.save_run(run).await?;
                    return Ok(());
                }
                StepKind::Send { channel } => {
                    if let Some(bus) = &self.bus {
                        let merged = merge_step_input(&run.inputs, &run.context);
                        let envelope = dazzle_schemas::Envelope::new(
                            channel.clone(),
                            "ProcessSend".to_string(),
                            run.run_id.clone(),
                            merged,
                            None,
                        )
                        .map_err(|e| OrchestratorError::StepExecution {
                            step: step.name.clone(),
                            message: e.to_string(),
                        })?;
                        bus.publish(channel, envelope).await?;
                    }
                    run.record_context(&step.name, serde_json::Value::Null);
                    run.current_step += 1;
                    self.store.save_run(run).await?;
                }
            }
        }
    }

    async fn call_with_retry(
        &self,
        function: &Arc<dyn crate::registry::StepFunction>,
        merged: &serde_json::Value,
        retry_policy: &dazzle_process::RetryPolicy,
    ) -> std::result::Result<serde_json::Value, String> {
        let mut attempt = 0u32;
        loop {
            match function.call(merged).await {
                Ok(value) => return Ok(value),
                Err(StepFunctionError(message)) => {
                    attempt += 1;
                    if attempt >= retry_policy.max_attempts {
                        return Err(message);
                    }
                    let shift = attempt.clamp(0, 32);
                    let delay_ms = retry_policy
                        .base_delay_ms
                        .saturating_mul(1u64 << shift)
                        .min(retry_policy.max_delay_ms);
                    tokio::time::sleep(StdDuration::from_millis(delay_ms)).await;
                }
            }
        }
    }

    /// Saga law (property 7): after a failure at the current step, visit
    /// every previously completed step with an `on_failure` in reverse
    /// order, running it as a service step and suppressing (but recording)
    /// its own errors.
    async fn fail_and_compensate(
        &self,
        run: &mut ProcessRun,
        spec: &ProcessSpec,
        failed_step: &Step,
        error: &str,
    ) -> Result<()> {
        run.error = Some(format!("{}: {}", failed_step.name, error));
        run.transition(RunStatus::Compensating)?;
        self.store.save_run(run).await?;

        // `current_step` is only advanced on success, so it still points at
        // the just-failed step here — include it (`..=`) so its own
        // `on_failure` runs too, not just the steps before it.
        let completed_count = run.current_step as usize;
        for idx in (0..=completed_count).rev() {
            let Some(completed_step) = spec.step_at(idx) else {
                continue;
            };
            let Some(comp_name) = &completed_step.on_failure else {
                continue;
            };
            let Some(comp_step) = spec.step(comp_name) else {
                continue;
            };
            let StepKind::Service { function_name, .. } = &comp_step.kind else {
                continue;
            };

            let Some(function) = self.registry.get(function_name) else {
                run.record_context(
                    &format!("{comp_name}_compensation_error"),
                    serde_json::json!("no registered function"),
                );
                continue;
            };

            let merged = merge_step_input(&run.inputs, &run.context);
            match function.call(&merged).await {
                Ok(output) => run.record_context(comp_name, output),
                Err(StepFunctionError(message)) => {
                    tracing::warn!(run_id = %run.run_id, step = %comp_name, error = %message, "compensation step failed");
                    run.record_context(
                        &format!("{comp_name}_compensation_error"),
                        serde_json::json!(message),
                    );
                }
            }
        }

        run.transition(RunStatus::Failed)?;
        self.store.save_run(run).await?;
        Ok(())
    }

    /// Complete a human task: validates the outcome against the step's
    /// declared set (property 8), records it under
    /// `context[step.name + "_outcome"/"_data"]`, and resumes the run.
    pub async fn complete_task(
        &self,
        task_id: &str,
        outcome: &str,
        outcome_data: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut task = self.store.get_task(task_id).await?;
        let mut run = self.store.get_run(&task.run_id).await?;
        let lock = self.lock_for(&run.run_id).await;
        let _guard = lock.lock().await;

        let spec = self.store.get_spec(&run.process_name).await?;
        let step = spec
            .step(&task.step_name)
            .ok_or_else(|| OrchestratorError::UnknownStep {
                spec: spec.name.clone(),
                step: task.step_name.clone(),
            })?;
        let declared = match &step.kind {
            StepKind::HumanTask { outcomes, .. } => outcomes.clone(),
            _ => Vec::new(),
        };

        task.complete(outcome, outcome_data, &declared)?;
        self.store.save_task(&task).await?;

        run.record_context(&format!("{}_outcome", task.step_name), serde_json::json!(outcome));
        run.record_context(
            &format!("{}_data", task.step_name),
            task.outcome_data.clone().unwrap_or(serde_json::Value::Null),
        );
        run.current_step += 1;
        run.transition(RunStatus::Running)?;
        self.store.save_run(&run).await?;

        self.advance(&mut run).await
    }

    /// Poll for human tasks past their deadline: `pending -> escalated` on
    /// first timeout, `escalated -> expired` (and the containing run fails)
    /// on the second.
    pub async fn check_task_timeouts(&self, escalation_interval_secs: i64) -> Result<usize> {
        let now = Utc::now();
        let due = self.store.list_tasks_pending_timeout(now).await?;
        let mut transitioned = 0usize;

        for mut task in due {
            match task.status {
                dazzle_process::TaskStatus::Pending => {
                    task.escalate()?;
                    task.due_at = now + ChronoDuration::seconds(escalation_interval_secs);
                    self.store.save_task(&task).await?;
                    transitioned += 1;
                }
                dazzle_process::TaskStatus::Escalated => {
                    task.expire()?;
                    self.store.save_task(&task).await?;

                    let mut run = self.store.get_run(&task.run_id).await?;
                    let lock = self.lock_for(&run.run_id).await;
                    let _guard = lock.lock().await;
                    run.error = Some(format!("Human task {} expired", task.task_id));
                    run.transition(RunStatus::Failed)?;
                    self.store.save_run(&run).await?;
                    transitioned += 1;
                }
                _ => {}
            }
        }
        Ok(transitioned)
    }

    /// A named signal either unblocks a `wait` step awaiting it by name, or
    /// (Open Question b, decided) just records the payload under
    /// `context[signal_name]`.
    pub async fn signal(&self, run_id: &str, signal_name: &str, payload: serde_json::Value) -> Result<()> {
        let mut run = self.store.get_run(run_id).await?;
        let lock = self.lock_for(run_id).await;
        let _guard = lock.lock().await;

        if run.status.is_terminal() {
            return Ok(());
        }

        let spec = self.store.get_spec(&run.process_name).await?;
        let current = spec.step_at(run.current_step as usize);
        let unblocks = matches!(
            current.map(|s| &s.kind),
            Some(StepKind::Wait { signal_name: Some(name), .. }) if name == signal_name
        );

        run.record_context(signal_name, payload);

        if unblocks && run.status == RunStatus::Waiting {
            run.current_step += 1;
            run.transition(RunStatus::Running)?;
            self.store.save_run(&run).await?;
            self.advance(&mut run).await?;
        } else {
            self.store.save_run(&run).await?;
        }
        Ok(())
    }

    /// Set the run to `cancelled`. No compensation runs for a cancellation
    /// (§4.6).
    pub async fn cancel_run(&self, run_id: &str) -> Result<()> {
        let mut run = self.store.get_run(run_id).await?;
        let lock = self.lock_for(run_id).await;
        let _guard = lock.lock().await;
        run.transition(RunStatus::Cancelled)?;
        self.store.save_run(&run).await?;
        Ok(())
    }

    /// Start a run from an external scheduler tick and record the
    /// schedule's last-run timestamp.
    pub async fn trigger_scheduled(&self, schedule_name: &str) -> Result<ProcessRun> {
        let now = Utc::now();
        let run = self
            .start_process(
                schedule_name,
                serde_json::json!({"triggered_by": "schedule", "schedule_name": schedule_name}),
                None,
                None,
            )
            .await?;
        self.store.record_schedule_run(schedule_name, now).await?;
        Ok(run)
    }

    pub fn store(&self) -> &ProcessStore {
        &self.store
    }
}
