use super::types::{HandlerOutcome, WorkItem};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Executes one work item kind.
///
/// Contract: handlers must be safe to re-run against the same persisted item
/// without duplicating external effects; idempotency lives here, not in the
/// loop.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn handle(&self, item: &WorkItem) -> anyhow::Result<HandlerOutcome>;
}

/// Static handler table keyed by (agent, action type). Adding an agent means
/// registering a handler, not subclassing anything.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, String), Arc<dyn WorkHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler. Replaces any existing handler for the same key.
    pub fn register(
        &mut self,
        agent_id: impl Into<String>,
        action_type: impl Into<String>,
        handler: Arc<dyn WorkHandler>,
    ) {
        self.handlers
            .insert((agent_id.into(), action_type.into()), handler);
    }

    #[must_use]
    pub fn get(&self, agent_id: &str, action_type: &str) -> Option<&Arc<dyn WorkHandler>> {
        self.handlers
            .get(&(agent_id.to_string(), action_type.to_string()))
    }

    /// Sorted list of registered (agent, action) keys.
    #[must_use]
    pub fn keys(&self) -> Vec<(String, String)> {
        let mut keys: Vec<_> = self.handlers.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl WorkHandler for EchoHandler {
        async fn handle(&self, _item: &WorkItem) -> anyhow::Result<HandlerOutcome> {
            Ok(HandlerOutcome::completed().notes("echo"))
        }
    }

    #[test]
    fn register_and_resolve() {
        let mut registry = HandlerRegistry::new();
        registry.register("perseo", "marketing", Arc::new(EchoHandler));

        assert!(registry.get("perseo", "marketing").is_some());
        assert!(registry.get("perseo", "fiscal").is_none());
        assert!(registry.get("rafael", "marketing").is_none());
    }

    #[test]
    fn registration_replaces_existing_handler() {
        let mut registry = HandlerRegistry::new();
        registry.register("perseo", "marketing", Arc::new(EchoHandler));
        registry.register("perseo", "marketing", Arc::new(EchoHandler));
        assert_eq!(registry.keys().len(), 1);
    }
}
