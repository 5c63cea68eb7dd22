//! In-memory backend registry.

use super::{BackendHandler, BackendRegistry};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Registry backed by a fixed id → handler map.
///
/// `finalize` drops the registry's handlers. The dispatcher closes every
/// session before finalizing, so no binding outlives it.
#[derive(Default)]
pub struct StaticRegistry {
    backends: RwLock<HashMap<String, Arc<dyn BackendHandler>>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `id`, replacing any previous one.
    pub fn register(&self, id: impl Into<String>, handler: Arc<dyn BackendHandler>) {
        let id = id.into();
        debug!("Registering backend {} ({})", id, handler.name());
        if let Ok(mut backends) = self.backends.write() {
            backends.insert(id, handler);
        }
    }

    /// Builder-style variant of [`register`](Self::register).
    pub fn with(self, id: impl Into<String>, handler: Arc<dyn BackendHandler>) -> Self {
        self.register(id, handler);
        self
    }

    pub fn len(&self) -> usize {
        self.backends.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BackendRegistry for StaticRegistry {
    fn resolve(&self, id: &str) -> Option<Arc<dyn BackendHandler>> {
        self.backends.read().ok()?.get(id).cloned()
    }

    fn finalize(&self) {
        if let Ok(mut backends) = self.backends.write() {
            info!("Finalizing {} backend(s)", backends.len());
            backends.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::EchoBackend;

    #[test]
    fn test_resolve_registered_backend() {
        let registry = StaticRegistry::new().with("echo", Arc::new(EchoBackend::new("echo")));
        assert!(registry.resolve("echo").is_some());
        assert!(registry.resolve("unknown").is_none());
    }

    #[test]
    fn test_finalize_drops_handlers() {
        let handler: Arc<dyn BackendHandler> = Arc::new(EchoBackend::new("echo"));
        let weak = Arc::downgrade(&handler);
        let registry = StaticRegistry::new().with("echo", handler);

        registry.finalize();

        assert!(registry.is_empty());
        assert!(weak.upgrade().is_none());
    }
}
