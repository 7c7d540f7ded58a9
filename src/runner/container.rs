/// Execution platform abstraction for sandboxed servers
///
/// A platform creates containers from a `ContainerSpec`, starts them with
/// their stdio attached, and removes them. `ContainerGuard` ties a created
/// container to a scope so it is removed on every exit path.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::runner::RunnerError;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Everything needed to create one sandboxed container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Unprivileged `user[:group]` the process runs as
    pub user: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Hard memory ceiling; swap is disabled
    pub memory_limit_mb: u64,
    /// The only resolvers reachable from inside the container
    pub dns: Vec<String>,
    /// Writable tmpfs on top of the read-only root filesystem
    pub scratch_mount: String,
    pub stop_timeout: Duration,
    pub labels: BTreeMap<String, String>,
}

/// A started container with its stdio attached
pub struct ContainerProcess {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    /// Never mixed into the protocol stream
    pub stderr: BoxedReader,
    /// Resolves with the exit status once the process is gone
    pub exit: BoxFuture<'static, Result<i64, RunnerError>>,
}

/// A container engine the runner can drive
///
/// Implementations must be safe to share between concurrent instances.
#[async_trait]
pub trait ContainerPlatform: Send + Sync + 'static {
    /// Check that the platform is reachable
    async fn ping(&self) -> Result<(), RunnerError>;

    async fn pull_image(&self, image: &str) -> Result<(), RunnerError>;

    /// Create (but do not start) a container, returning its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RunnerError>;

    async fn start_attached(&self, id: &str) -> Result<ContainerProcess, RunnerError>;

    /// Stop and remove a container; removing a missing container is not an error
    async fn remove_container(&self, id: &str) -> Result<(), RunnerError>;

    /// Release platform handles held by this client
    async fn close(&self) -> Result<(), RunnerError>;
}

/// Removes its container when released or dropped
pub struct ContainerGuard {
    platform: Arc<dyn ContainerPlatform>,
    id: String,
    released: bool,
}

impl ContainerGuard {
    pub fn new(platform: Arc<dyn ContainerPlatform>, id: String) -> Self {
        Self {
            platform,
            id,
            released: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Remove the container and wait for the removal to finish
    ///
    /// The removal runs on its own task, so it completes even if the caller
    /// stops polling this future.
    pub async fn release(mut self) -> Result<(), RunnerError> {
        self.released = true;
        let platform = self.platform.clone();
        let id = std::mem::take(&mut self.id);

        tokio::spawn(async move { platform.remove_container(&id).await })
            .await
            .map_err(|e| RunnerError::Platform(format!("container removal task failed: {}", e)))?
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let platform = self.platform.clone();
        let id = std::mem::take(&mut self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = platform.remove_container(&id).await {
                        tracing::warn!(container = %id, error = %e, "failed to remove container");
                    }
                });
            }
            Err(_) => tracing::warn!(container = %id, "no runtime left to remove container"),
        }
    }
}
