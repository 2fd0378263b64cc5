use crate::config::IdempotencyConfig;
use crate::error::{IdempotencyError, Result};
use crate::idempotency::handler::{IdempotencyHandler, InvocationContext};
use crate::persistence::PersistenceStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;

/// Key scope for `operation` inside the deployed function `function_name`.
pub fn operation_scope(function_name: &str, operation: &str) -> String {
    format!("{}.{}", function_name, operation)
}

/// An async function whose calls are deduplicated by an [`IdempotencyHandler`].
pub struct IdempotentFunction<F> {
    handler: Arc<IdempotencyHandler>,
    function: F,
}

/// Wraps `function` so each distinct payload runs it at most once.
pub fn idempotent<F>(
    function: F,
    store: Arc<dyn PersistenceStore>,
    scope: impl Into<String>,
    config: IdempotencyConfig,
) -> Result<IdempotentFunction<F>> {
    let handler = IdempotencyHandler::new(store, scope, config)?;
    Ok(IdempotentFunction::from_handler(Arc::new(handler), function))
}

impl<F> IdempotentFunction<F> {
    /// Shares an existing handler, e.g. one carrying a custom clock.
    pub fn from_handler(handler: Arc<IdempotencyHandler>, function: F) -> Self {
        Self { handler, function }
    }

    pub fn handler(&self) -> &Arc<IdempotencyHandler> {
        &self.handler
    }

    /// Calls the wrapped function with `payload` unless a completed call
    /// for the same key can be replayed.
    pub async fn call<P, T, E, Fut>(
        &self,
        payload: P,
        context: &InvocationContext,
    ) -> std::result::Result<T, E>
    where
        F: Fn(P) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        P: Serialize,
        T: Serialize + DeserializeOwned,
        E: From<IdempotencyError>,
    {
        let derived = self.handler.derive_key_from(&payload).map_err(E::from)?;
        self.handler
            .process_derived(derived, context, || (self.function)(payload))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistenceStore;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Serialize, Deserialize)]
    struct CreateOrder {
        order_id: String,
        quantity: u32,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderCreated {
        order_id: String,
        total: u32,
    }

    #[test]
    fn test_operation_scope() {
        assert_eq!(operation_scope("orders", "create"), "orders.create");
    }

    #[tokio::test]
    async fn test_wrapped_function_runs_once_per_payload() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let create = idempotent(
            move |request: CreateOrder| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, IdempotencyError>(OrderCreated {
                        order_id: request.order_id,
                        total: request.quantity * 10,
                    })
                }
            },
            Arc::new(InMemoryPersistenceStore::new()),
            operation_scope("orders", "create"),
            IdempotencyConfig::default().with_event_key_path("order_id"),
        )
        .unwrap();

        let context = InvocationContext::new();
        let first = create
            .call(CreateOrder { order_id: "o-1".to_string(), quantity: 2 }, &context)
            .await
            .unwrap();
        let second = create
            .call(CreateOrder { order_id: "o-1".to_string(), quantity: 2 }, &context)
            .await
            .unwrap();
        let other = create
            .call(CreateOrder { order_id: "o-2".to_string(), quantity: 1 }, &context)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(other.total, 10);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
