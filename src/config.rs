// Runtime configuration, read by clap from flags or UDHIYA_* environment
// variables. Both binaries flatten these structs into their own arguments.

use clap::Args;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Database settings shared by the CLI and the API server.
#[derive(Args, Debug, Clone, PartialEq)]
pub struct Config {
    /// SQLite database file
    #[arg(long = "db", env = "UDHIYA_DB_PATH", default_value = "udhiya.db", global = true)]
    pub database_path: PathBuf,

    /// How long a writer waits on a locked database before giving up.
    /// Exceeding it surfaces as a transient store error.
    #[arg(long, env = "UDHIYA_BUSY_TIMEOUT_MS", default_value_t = 5000, global = true)]
    pub busy_timeout_ms: u64,
}

impl Config {
    /// Settings for a database file, with the default busy timeout
    pub fn for_path(database_path: impl Into<PathBuf>) -> Self {
        Config {
            database_path: database_path.into(),
            busy_timeout_ms: 5000,
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// API server settings
#[derive(Args, Debug, Clone, PartialEq)]
pub struct ServerConfig {
    #[command(flatten)]
    pub store: Config,

    /// Address the API server binds to
    #[arg(long = "listen", env = "UDHIYA_LISTEN_ADDR", default_value = "0.0.0.0:5000")]
    pub listen_addr: SocketAddr,
}
