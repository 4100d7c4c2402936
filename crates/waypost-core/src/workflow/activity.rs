//! Activity invocation port.
//!
//! `call` tasks hand their resolved arguments to an `ActivityInvoker`. An
//! invoker either finishes synchronously, fails with a `WorkflowError`, or
//! reports the work as pending under a token; the node then waits until
//! `Engine::resume` is called with that token.
//!
//! Follows the same blanket-impl pattern as the other ports:
//! 1. `ActivityInvoker` uses RPITIT
//! 2. object-safe `ActivityInvokerDyn` is blanket-implemented for it
//! 3. `BoxActivityInvoker` wraps `Arc<dyn ActivityInvokerDyn>` and delegates

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use waypost_types::error::WorkflowError;
use waypost_types::position::NodePosition;

/// One activity call.
#[derive(Debug, Clone)]
pub struct ActivityRequest {
    pub instance_id: Uuid,
    pub position: NodePosition,
    /// Activity name from the `call` field.
    pub activity: String,
    /// Resolved `with` arguments.
    pub arguments: Value,
    /// Node input.
    pub input: Value,
    /// Retry attempt of the nearest enclosing try (0 outside retries).
    pub attempt: u32,
    /// `{instance}-{position}-{attempt}`; stable across redeliveries.
    pub idempotency_key: String,
    /// Cancelled when the instance is cancelled or loses a race.
    pub cancel: CancellationToken,
}

impl ActivityRequest {
    pub fn idempotency_key_for(instance_id: Uuid, position: &NodePosition, attempt: u32) -> String {
        format!("{instance_id}-{position}-{attempt}")
    }
}

/// Result of an invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityOutcome {
    Completed(Value),
    /// The work continues elsewhere; resume with this token when done.
    Pending { token: String },
    Failed(WorkflowError),
}

/// Executes named activities.
pub trait ActivityInvoker: Send + Sync {
    fn invoke(&self, request: ActivityRequest) -> impl Future<Output = ActivityOutcome> + Send;
}

/// Object-safe version of [`ActivityInvoker`] with boxed futures.
pub trait ActivityInvokerDyn: Send + Sync {
    fn invoke_boxed(
        &self,
        request: ActivityRequest,
    ) -> Pin<Box<dyn Future<Output = ActivityOutcome> + Send + '_>>;
}

impl<T: ActivityInvoker> ActivityInvokerDyn for T {
    fn invoke_boxed(
        &self,
        request: ActivityRequest,
    ) -> Pin<Box<dyn Future<Output = ActivityOutcome> + Send + '_>> {
        Box::pin(self.invoke(request))
    }
}

/// Type-erased activity invoker shared by the engine.
#[derive(Clone)]
pub struct BoxActivityInvoker {
    inner: Arc<dyn ActivityInvokerDyn>,
}

impl BoxActivityInvoker {
    pub fn new<T: ActivityInvoker + 'static>(invoker: T) -> Self {
        Self {
            inner: Arc::new(invoker),
        }
    }

    pub async fn invoke(&self, request: ActivityRequest) -> ActivityOutcome {
        self.inner.invoke_boxed(request).await
    }
}

impl std::fmt::Debug for BoxActivityInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxActivityInvoker").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ActivityRegistry
// ---------------------------------------------------------------------------

type Handler = Arc<dyn Fn(ActivityRequest) -> BoxFuture<'static, ActivityOutcome> + Send + Sync>;

/// Invoker dispatching on the activity name to registered handlers.
#[derive(Default, Clone)]
pub struct ActivityRegistry {
    handlers: HashMap<String, Handler>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async handler for `name`.
    pub fn register<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ActivityRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActivityOutcome> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |request| Box::pin(handler(request)));
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}

impl ActivityInvoker for ActivityRegistry {
    async fn invoke(&self, request: ActivityRequest) -> ActivityOutcome {
        match self.handlers.get(&request.activity) {
            Some(handler) => handler(request).await,
            None => ActivityOutcome::Failed(
                WorkflowError::runtime("Unknown activity")
                    .with_status(404)
                    .with_detail(format!("no handler registered for '{}'", request.activity)),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(activity: &str) -> ActivityRequest {
        let instance_id = Uuid::now_v7();
        let position = NodePosition::root().child("do", "charge");
        ActivityRequest {
            idempotency_key: ActivityRequest::idempotency_key_for(instance_id, &position, 2),
            instance_id,
            position,
            activity: activity.to_string(),
            arguments: json!({ "amount": 5 }),
            input: json!({}),
            attempt: 2,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn idempotency_key_includes_position_and_attempt() {
        let req = request("x");
        assert!(req.idempotency_key.ends_with("-/do/charge-2"));
        assert!(req.idempotency_key.starts_with(&req.instance_id.to_string()));
    }

    #[tokio::test]
    async fn registry_dispatches_by_name() {
        let invoker = BoxActivityInvoker::new(
            ActivityRegistry::new()
                .register("echo", |req: ActivityRequest| async move {
                    ActivityOutcome::Completed(req.arguments)
                })
                .register("later", |_req: ActivityRequest| async move {
                    ActivityOutcome::Pending {
                        token: "ext-1".to_string(),
                    }
                }),
        );

        assert_eq!(
            invoker.invoke(request("echo")).await,
            ActivityOutcome::Completed(json!({ "amount": 5 }))
        );
        assert_eq!(
            invoker.invoke(request("later")).await,
            ActivityOutcome::Pending {
                token: "ext-1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn unknown_activity_fails() {
        let outcome = ActivityRegistry::new().invoke(request("missing")).await;
        match outcome {
            ActivityOutcome::Failed(err) => assert_eq!(err.status, 404),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
