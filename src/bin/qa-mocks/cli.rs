//! Command-line interface definitions for the QA mocks server.
//!
//! Every option can also be set through the environment variable named next to it.

use std::path::PathBuf;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};

use qa_mocks::config::{DatabaseConfig, StoragePolicy};

/// Command-line arguments for the QA mocks server.
#[derive(Debug, Parser)]
#[command(name = "qa-mocks")]
#[command(author, version, about = "QA API mock: register canned responses by URI template and serve them")]
pub struct Cli {
    /// Address to listen on
    #[arg(long, env = "QA_MOCKS_LISTEN", default_value = "0.0.0.0:40028")]
    pub listen: String,

    /// Keep mocks in the database instead of process memory
    #[arg(
        long,
        env = "USE_DATABASE",
        default_value = "false",
        value_parser = BoolishValueParser::new(),
        action = ArgAction::Set
    )]
    pub use_database: bool,

    /// Serve from memory when the database is unreachable
    #[arg(
        long,
        env = "FALLBACK_TO_MEMORY",
        default_value = "true",
        value_parser = BoolishValueParser::new(),
        action = ArgAction::Set
    )]
    pub fallback_to_memory: bool,

    /// Database driver (only `sqlite` has a backend)
    #[arg(long, env = "DB_DRIVER", default_value = "sqlite")]
    pub db_driver: String,

    /// Database host
    #[arg(long, env = "DB_SERVER", default_value = "localhost")]
    pub db_server: String,

    /// Database port
    #[arg(long, env = "DB_PORT", default_value_t = 5432)]
    pub db_port: u16,

    /// Database name; the file path for sqlite
    #[arg(long, env = "DB_NAME", default_value = "qa_api.db")]
    pub db_name: String,

    /// Database user
    #[arg(long, env = "DB_USER", default_value = "qa_api")]
    pub db_user: String,

    /// Database password
    #[arg(long, env = "DB_PASSWORD", hide_env_values = true)]
    pub db_password: Option<String>,

    /// Bound on each database call (e.g. 500ms, 5s)
    #[arg(long, env = "DB_TIMEOUT", value_parser = humantime::parse_duration, default_value = "5s")]
    pub db_timeout: Duration,

    /// Consecutive database failures before switching to memory
    #[arg(long, env = "HEALTH_FAILURE_THRESHOLD", default_value_t = 3)]
    pub health_failure_threshold: u32,

    /// YAML file of mocks to register at startup
    #[arg(long, env = "QA_MOCKS_SEED")]
    pub seed: Option<PathBuf>,
}

impl Cli {
    /// How the storage controller should treat the database.
    pub fn storage_policy(&self) -> StoragePolicy {
        StoragePolicy {
            use_durable: self.use_database,
            allow_fallback: self.fallback_to_memory,
            failure_threshold: self.health_failure_threshold,
            call_timeout: self.db_timeout,
        }
    }

    /// Connection settings of the database.
    pub fn database_config(&self) -> DatabaseConfig {
        DatabaseConfig {
            driver: self.db_driver.clone(),
            server: self.db_server.clone(),
            port: self.db_port,
            name: self.db_name.clone(),
            user: self.db_user.clone(),
            password: self.db_password.clone(),
            timeout: self.db_timeout,
        }
    }
}
