//! BoxPrimitiveExecutor: object-safe dynamic dispatch wrapper for PrimitiveExecutor.
//!
//! 1. `PrimitiveExecutorDyn` is an object-safe trait with boxed futures
//! 2. Blanket-impl `PrimitiveExecutorDyn` for all `T: PrimitiveExecutor`
//! 3. `BoxPrimitiveExecutor` wraps `Box<dyn PrimitiveExecutorDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value};
use technique_types::composition::Primitive;

use super::{ExecutionContext, ExecutorError, PrimitiveExecutor};

type ExecuteFuture<'a> = Pin<Box<dyn Future<Output = Result<Map<String, Value>, ExecutorError>> + Send + 'a>>;

/// Object-safe version of [`PrimitiveExecutor`] with boxed futures.
pub trait PrimitiveExecutorDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        primitive: &'a Primitive,
        input: &'a Map<String, Value>,
        ctx: &'a ExecutionContext,
    ) -> ExecuteFuture<'a>;
}

impl<T: PrimitiveExecutor> PrimitiveExecutorDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        primitive: &'a Primitive,
        input: &'a Map<String, Value>,
        ctx: &'a ExecutionContext,
    ) -> ExecuteFuture<'a> {
        Box::pin(self.execute(primitive, input, ctx))
    }
}

/// Type-erased primitive executor.
///
/// `PrimitiveExecutor` uses RPITIT and cannot be a trait object directly;
/// this wrapper delegates to the inner `PrimitiveExecutorDyn` object.
pub struct BoxPrimitiveExecutor {
    inner: Box<dyn PrimitiveExecutorDyn + Send + Sync>,
}

impl BoxPrimitiveExecutor {
    pub fn new<T: PrimitiveExecutor + 'static>(executor: T) -> Self {
        Self {
            inner: Box::new(executor),
        }
    }

    pub async fn execute(
        &self,
        primitive: &Primitive,
        input: &Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<Map<String, Value>, ExecutorError> {
        self.inner.execute_boxed(primitive, input, ctx).await
    }
}

impl std::fmt::Debug for BoxPrimitiveExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxPrimitiveExecutor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    struct Echo;

    impl PrimitiveExecutor for Echo {
        async fn execute(
            &self,
            primitive: &Primitive,
            input: &Map<String, Value>,
            _ctx: &ExecutionContext,
        ) -> Result<Map<String, Value>, ExecutorError> {
            let mut out = input.clone();
            out.insert("by".to_string(), json!(primitive.id));
            Ok(out)
        }
    }

    #[tokio::test]
    async fn boxed_executor_delegates() {
        let boxed = BoxPrimitiveExecutor::new(Echo);
        let ctx = ExecutionContext {
            execution_id: Uuid::nil(),
            composition_id: "c".to_string(),
            attempt: 1,
            state: Map::new(),
        };
        let input = json!({"x": 1}).as_object().cloned().unwrap();
        let out = boxed.execute(&Primitive::new("p", "P"), &input, &ctx).await.unwrap();
        assert_eq!(Value::Object(out), json!({"x": 1, "by": "p"}));
    }
}
