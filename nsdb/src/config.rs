//! Server configuration, read from flags with environment fallbacks.

use clap::Parser;
use nsdb_core::DebounceConfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(name = "nsdb")]
#[command(about = "Multi-tenant hierarchical document store over HTTP")]
pub struct Config {
    /// Interface to bind
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Directory holding one snapshot file per namespace
    #[arg(long, env = "STORAGE", default_value = "storage")]
    pub storage: PathBuf,

    /// Snapshot file of the database-user registry
    #[arg(long, env = "CONFIG", default_value = "config.snap")]
    pub config: PathBuf,

    /// Quiet period (ms) before a namespace's pending changes are flushed
    #[arg(long = "queue-duration", env = "OPERATION_QUEUE_DURATION", default_value_t = 300)]
    pub queue_duration_ms: u64,

    /// Flush every N changes to a namespace even while changes keep coming; 0 disables
    #[arg(long = "queue-cycle", env = "OPERATION_QUEUE_CYCLE", default_value_t = 10)]
    pub queue_cycle: u32,

    /// Password given to the root user when no config file exists yet
    #[arg(long, env = "ROOT_PASSWORD", default_value = "root", hide_env_values = true)]
    pub root_password: String,
}

impl Config {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn debounce(&self) -> DebounceConfig {
        DebounceConfig {
            wait: Duration::from_millis(self.queue_duration_ms),
            leading: true,
            trailing: true,
            cycle: self.queue_cycle,
        }
    }
}
