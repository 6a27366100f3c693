//! # QA Mocks Library
//!
//! A library for serving mock HTTP APIs whose responses are registered at runtime.
//!
//! This library provides components for:
//! - **URI Patterns**: `/users/:id` templates compiled into anchored matchers
//! - **Storage**: SQLite and in-memory mock stores behind a fallback controller
//! - **Mock Registry**: upsert, lookup, update and removal of mock records
//! - **Dispatch**: first-match resolution with path, query and body variable substitution
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use qa_mocks::{http::build_router, FallbackController, MockRegistry};
//!
//! # fn example() -> std::io::Result<()> {
//! let registry = Arc::new(MockRegistry::new(Arc::new(FallbackController::memory_only())));
//!
//! let state = qa_mocks::http::AppState::builder()
//!     .with_registry(registry)
//!     .build()?;
//! let app = build_router(state);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod definition;
pub mod dispatch;
pub mod http;
pub mod pattern;
pub mod registry;
pub mod seed;
pub mod storage;

// Re-export commonly used types for convenience
pub use config::{DatabaseConfig, StoragePolicy};
pub use definition::MockDefinition;
pub use dispatch::{DispatchOutcome, DispatchRequest, Dispatcher};
pub use pattern::UriPattern;
pub use registry::{MockRegistry, NewMock, RegistryError, RegistryStatus};
pub use seed::SeedBook;
pub use storage::{FallbackController, MemoryStore, MockRecord, MockStore, SqliteStore, StorageMode};
