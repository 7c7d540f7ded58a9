/// Configuration values for the broker and the server runner
///
/// Configuration is passed explicitly into constructors; nothing here is
/// global. Defaults match the `mcp serve` command line defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings of the local broker
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Bound on create + handshake + tool discovery for one integration
    pub start_timeout: Duration,
    /// How long shutdown waits for child instances to release their resources
    pub shutdown_grace: Duration,
    /// Name reported in the `initialize` result
    pub server_name: String,
    pub server_version: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(15),
            server_name: "mcp".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Settings of the container-backed server runner
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Path or name of the docker CLI
    pub docker_binary: PathBuf,
    /// Memory ceiling for servers that do not request one
    pub default_memory_limit_mb: u64,
    /// Resolvers the containers may use
    pub dns: Vec<String>,
    /// Writable tmpfs mount inside the read-only root filesystem
    pub scratch_mount: String,
    pub stop_timeout: Duration,
    /// Bound on the platform readiness check
    pub ping_timeout: Duration,
    /// How long to wait for an exit status after the child's stdio closed
    pub exit_grace: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            docker_binary: PathBuf::from("docker"),
            default_memory_limit_mb: 64,
            dns: vec!["8.8.8.8".to_string()],
            scratch_mount: "/tmp".to_string(),
            stop_timeout: Duration::from_secs(15),
            ping_timeout: Duration::from_secs(5),
            exit_grace: Duration::from_secs(2),
        }
    }
}

/// Get the default database path with a fallback strategy
///
/// Tries `~/.mcp`, then the platform data and config directories, then the
/// working directory, and finally the temp directory. The first directory that
/// can be created and written to wins.
pub fn default_database_path() -> std::io::Result<PathBuf> {
    let candidates = [
        dirs::home_dir().map(|p| p.join(".mcp")),
        dirs::data_dir().map(|p| p.join("mcp")),
        dirs::config_dir().map(|p| p.join("mcp")),
        std::env::current_dir().ok().map(|p| p.join(".mcp")),
    ];

    for dir in candidates.iter().flatten() {
        if is_writable_dir(dir) {
            return Ok(dir.join("mcp.db"));
        }
    }

    let fallback = std::env::temp_dir().join("mcp");
    std::fs::create_dir_all(&fallback)?;
    tracing::warn!("Using temporary directory for database: {}", fallback.display());
    Ok(fallback.join("mcp.db"))
}

fn is_writable_dir(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }

    let probe = dir.join(".write_probe");
    match std::fs::write(&probe, b"") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}
