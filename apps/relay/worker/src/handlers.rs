//! Handlers compiled into this worker build.
//!
//! Payload business logic is deliberately thin here; deployments register
//! their own handlers before calling `run`. The echo handler stays as the
//! default registration so a fresh checkout has something dispatchable.

use async_trait::async_trait;
use task_broker::{HandlerContext, HandlerError, HandlerRegistry, TaskHandler};

/// Returns the payload unchanged. Trivially idempotent.
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(
        &self,
        _task_id: &str,
        payload: &str,
        _ctx: &HandlerContext,
    ) -> Result<String, HandlerError> {
        Ok(payload.to_string())
    }

    fn name(&self) -> &'static str {
        "echo"
    }
}

/// Registry with the built-in handlers.
pub fn default_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register("echo", std::sync::Arc::new(EchoHandler));
    registry
}
