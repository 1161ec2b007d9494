//! Domain function registry: the orchestrator calls named functions by
//! string key rather than holding direct references, so a process spec can
//! be deployed before the binary wiring it to business logic changes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct StepFunctionError(pub String);

impl StepFunctionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A named domain function a `service` step can call. Receives
/// `run.inputs ∪ run.context` and returns the value recorded under
/// `context[step.name]`.
#[async_trait]
pub trait StepFunction: Send + Sync {
    async fn call(
        &self,
        merged_input: &serde_json::Value,
    ) -> Result<serde_json::Value, StepFunctionError>;
}

#[async_trait]
impl<F, Fut> StepFunction for F
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<serde_json::Value, StepFunctionError>> + Send,
{
    async fn call(
        &self,
        merged_input: &serde_json::Value,
    ) -> Result<serde_json::Value, StepFunctionError> {
        (self)(merged_input.clone()).await
    }
}

#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn StepFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, function: Arc<dyn StepFunction>) {
        self.functions.insert(name.into(), function);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StepFunction>> {
        self.functions.get(name).cloned()
    }
}
