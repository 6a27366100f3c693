//! Seed files: mock definitions registered at startup.
//!
//! ```yaml
//! mocks:
//!   - uri: /users/:id
//!     http_method: GET
//!     response: { userId: id, name: John }
//!   - uri: /health
//!     status_code_response: 204
//!     response: {}
//! ```

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::definition::MockDefinition;
use crate::registry::MockRegistry;

/// Errors that can occur when loading a seed file.
#[derive(Debug, Error)]
pub enum SeedError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Mock definitions read from a seed file.
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct SeedBook {
    #[serde(default)]
    pub mocks: Vec<MockDefinition>,
}

/// Outcome of applying a seed book.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedReport {
    pub created: usize,
    pub updated: usize,
    pub rejected: usize,
}

impl SeedBook {
    /// Load a seed book from a YAML (or JSON) file.
    ///
    /// # Errors
    ///
    /// Returns `SeedError` if the file cannot be read or parsed.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, SeedError> {
        let raw = fs::read_to_string(path)?;
        let book: SeedBook = serde_yaml::from_str(&raw)?;
        Ok(book)
    }

    /// Register every definition. Invalid entries are logged and skipped.
    pub async fn apply(&self, registry: &MockRegistry) -> SeedReport {
        let mut report = SeedReport::default();

        for (index, definition) in self.mocks.iter().enumerate() {
            let outcome = match definition.clone().into_new_mock() {
                Ok(mock) => registry.create_or_update(mock).await,
                Err(err) => Err(err),
            };
            match outcome {
                Ok(upserted) if upserted.created => report.created += 1,
                Ok(_) => report.updated += 1,
                Err(err) => {
                    warn!(index, error = %err, "seed entry rejected");
                    report.rejected += 1;
                }
            }
        }

        info!(
            created = report.created,
            updated = report.updated,
            rejected = report.rejected,
            "seed mocks applied"
        );
        report
    }
}
