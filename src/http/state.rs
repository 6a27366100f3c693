//! Application state shared by the HTTP handlers.

use std::io;
use std::sync::Arc;

use crate::dispatch::Dispatcher;
use crate::registry::MockRegistry;

/// Application state shared across all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// Admin operations over mock records
    pub registry: Arc<MockRegistry>,
    /// Request matching for every non-admin route
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    /// Create application state over a registry, with a dispatcher reading from it.
    pub fn new(registry: Arc<MockRegistry>) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry)));
        Self { registry, dispatcher }
    }

    /// Get a builder for configuring application state step by step.
    pub fn builder() -> AppStateBuilder {
        AppStateBuilder::default()
    }
}

/// Builder for constructing `AppState`.
#[derive(Default)]
pub struct AppStateBuilder {
    registry: Option<Arc<MockRegistry>>,
}

impl AppStateBuilder {
    /// Set the mock registry.
    pub fn with_registry(mut self, registry: Arc<MockRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build the final `AppState`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if no registry was provided.
    pub fn build(self) -> io::Result<AppState> {
        let registry = self.registry.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "Registry is required for AppState")
        })?;

        Ok(AppState::new(registry))
    }
}
