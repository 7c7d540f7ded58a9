/// Server runner: provisions sandboxed MCP servers and supervises them
///
/// `ServerRunner::create` validates a `ServerDescription` and prepares an
/// instance without starting anything. `ServerInstance::run` then owns the
/// child's entire lifetime: it provisions the container, performs the MCP
/// handshake as a client, hands the live connection to the caller through a
/// oneshot, and returns a `RunOutcome` once the child is gone. Every resource
/// the instance acquired is released before `run` returns.

pub mod container;
pub mod docker;
pub mod instance;
pub mod runtime;

pub use container::{ContainerGuard, ContainerPlatform, ContainerProcess, ContainerSpec};
pub use docker::DockerCli;
pub use instance::{ContainerServerInstance, ContainerServerRunner};
pub use runtime::{Runtime, RuntimeError, RuntimeKind};

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::jsonrpc::{CallError, Connection};
use crate::mcp::InitializeResult;

/// Errors that can occur while creating or running a server
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Invalid runtime: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Container platform unavailable: {0}")]
    Unavailable(String),

    #[error("Container platform error: {0}")]
    Platform(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("MCP handshake failed: {0}")]
    Handshake(#[source] CallError),

    #[error("Operation cancelled")]
    Cancelled,
}

/// What to run: the runnable shape of an installed integration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDescription {
    /// Runtime spec, `name[@semver]`; validated by `ServerRunner::create`
    pub runtime: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Falls back to the runner's default when `None`
    pub memory_limit_mb: Option<u64>,
}

/// A child that completed the MCP handshake
#[derive(Clone)]
pub struct RunningServer {
    /// Client-role connection to the child
    pub connection: Connection,
    /// What the child answered to `initialize`
    pub info: InitializeResult,
}

/// How a server instance's lifetime ended
#[derive(Debug)]
pub enum RunOutcome {
    /// The process exited with this status
    Exited(i64),
    /// The protocol stream closed while the process was running
    Disconnected,
    /// The caller cancelled the run
    Cancelled,
    /// Provisioning, startup or the handshake failed
    Error(RunnerError),
}

impl RunOutcome {
    /// Whether the run ended without anything going wrong
    pub fn is_clean(&self) -> bool {
        matches!(self, RunOutcome::Exited(0) | RunOutcome::Cancelled)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Exited(code) => write!(f, "exited with status {}", code),
            RunOutcome::Disconnected => f.write_str("connection closed"),
            RunOutcome::Cancelled => f.write_str("cancelled"),
            RunOutcome::Error(e) => write!(f, "{}", e),
        }
    }
}

/// Creates server instances on some execution platform
#[async_trait]
pub trait ServerRunner: Send + Sync {
    /// Validate `description` and prepare an instance; nothing runs yet
    async fn create(
        &self,
        cancel: &CancellationToken,
        description: ServerDescription,
    ) -> Result<Box<dyn ServerInstance>, RunnerError>;

    /// Release the runner's own platform handles; idempotent
    async fn close(&self) -> Result<(), RunnerError>;
}

/// One child server, run exactly once
#[async_trait]
pub trait ServerInstance: Send {
    /// Run the child until it exits, disconnects or `cancel` fires
    ///
    /// `ready` receives the live connection after a successful handshake. If
    /// the run ends before that, `ready` is dropped unsent.
    async fn run(
        self: Box<Self>,
        cancel: CancellationToken,
        ready: oneshot::Sender<RunningServer>,
    ) -> RunOutcome;
}
