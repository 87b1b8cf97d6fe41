//! Executor lookup by primitive id.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use technique_types::composition::Primitive;

use super::{BoxPrimitiveExecutor, ExecutionContext, ExecutorError, PrimitiveExecutor};

/// Maps primitive ids to executors, with an optional fallback.
#[derive(Debug, Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<BoxPrimitiveExecutor>>,
    fallback: Option<Arc<BoxPrimitiveExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor for one primitive id, replacing any previous one.
    pub fn register<T: PrimitiveExecutor + 'static>(&mut self, primitive_id: impl Into<String>, executor: T) {
        self.executors
            .insert(primitive_id.into(), Arc::new(BoxPrimitiveExecutor::new(executor)));
    }

    pub fn with<T: PrimitiveExecutor + 'static>(mut self, primitive_id: impl Into<String>, executor: T) -> Self {
        self.register(primitive_id, executor);
        self
    }

    /// Executor used for primitives without a dedicated registration.
    pub fn with_fallback<T: PrimitiveExecutor + 'static>(mut self, executor: T) -> Self {
        self.fallback = Some(Arc::new(BoxPrimitiveExecutor::new(executor)));
        self
    }

    pub fn resolve(&self, primitive_id: &str) -> Option<Arc<BoxPrimitiveExecutor>> {
        self.executors
            .get(primitive_id)
            .or(self.fallback.as_ref())
            .cloned()
    }

    pub fn contains(&self, primitive_id: &str) -> bool {
        self.executors.contains_key(primitive_id) || self.fallback.is_some()
    }
}

/// Executor backed by a synchronous closure.
pub struct FnExecutor<F> {
    f: F,
}

impl<F> FnExecutor<F>
where
    F: Fn(&Primitive, &Map<String, Value>, &ExecutionContext) -> Result<Map<String, Value>, ExecutorError>
        + Send
        + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> PrimitiveExecutor for FnExecutor<F>
where
    F: Fn(&Primitive, &Map<String, Value>, &ExecutionContext) -> Result<Map<String, Value>, ExecutorError>
        + Send
        + Sync,
{
    async fn execute(
        &self,
        primitive: &Primitive,
        input: &Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<Map<String, Value>, ExecutorError> {
        (self.f)(primitive, input, ctx)
    }
}
