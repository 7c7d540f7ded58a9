/// Container-backed `ServerRunner`
///
/// `create` resolves the runtime image, pulls it and prepares a sandboxed
/// container spec. `run` creates the container, attaches to it, speaks MCP to
/// it as a client and supervises it until it exits, disconnects or is
/// cancelled. The container is removed on every exit path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};
use uuid::Uuid;

use crate::config::RunnerConfig;
use crate::jsonrpc::{CallError, Connection, RejectAll};
use crate::mcp::{methods, ClientCapabilities, Implementation, InitializeParams, InitializeResult, InitializedParams, MCP_VERSION};
use crate::runner::container::{BoxedReader, ContainerGuard, ContainerPlatform, ContainerProcess, ContainerSpec};
use crate::runner::{
    DockerCli, RunOutcome, RunnerError, RunningServer, Runtime, ServerDescription, ServerInstance, ServerRunner,
};

type ExitFuture = BoxFuture<'static, Result<i64, RunnerError>>;

/// Label set on every container this runner creates
pub const MANAGED_LABEL: &str = "mcp.managed";

/// Runs MCP servers in containers on a `ContainerPlatform`
pub struct ContainerServerRunner {
    platform: Arc<dyn ContainerPlatform>,
    config: RunnerConfig,
    closed: AtomicBool,
}

impl ContainerServerRunner {
    /// Connect to the local docker daemon through the docker CLI
    pub async fn connect(config: RunnerConfig) -> Result<Self, RunnerError> {
        let platform = Arc::new(DockerCli::new(config.docker_binary.clone()));
        Self::with_platform(platform, config).await
    }

    /// Use `platform`, failing if it does not answer a ping in time
    pub async fn with_platform(
        platform: Arc<dyn ContainerPlatform>,
        config: RunnerConfig,
    ) -> Result<Self, RunnerError> {
        tokio::time::timeout(config.ping_timeout, platform.ping())
            .await
            .map_err(|_| {
                RunnerError::Unavailable(format!("no answer within {:?}", config.ping_timeout))
            })??;

        info!("container platform ready");
        Ok(Self {
            platform,
            config,
            closed: AtomicBool::new(false),
        })
    }

    pub fn platform(&self) -> &Arc<dyn ContainerPlatform> {
        &self.platform
    }

    fn container_spec(&self, runtime: &Runtime, description: ServerDescription) -> ContainerSpec {
        let scratch = self.config.scratch_mount.clone();

        // The root filesystem is read-only; tools that write to $HOME need the scratch area
        let mut env = description.env;
        env.insert("HOME".to_string(), scratch.clone());
        env.insert("NPM_CONFIG_CACHE".to_string(), format!("{}/.npm", scratch));

        ContainerSpec {
            name: format!("mcp-{}", Uuid::new_v4().simple()),
            image: runtime.image(),
            user: runtime.kind.user().to_string(),
            command: description.command,
            args: description.args,
            env,
            memory_limit_mb: description
                .memory_limit_mb
                .unwrap_or(self.config.default_memory_limit_mb),
            dns: self.config.dns.clone(),
            scratch_mount: scratch,
            stop_timeout: self.config.stop_timeout,
            labels: BTreeMap::from([(MANAGED_LABEL.to_string(), "true".to_string())]),
        }
    }
}

#[async_trait]
impl ServerRunner for ContainerServerRunner {
    async fn create(
        &self,
        cancel: &CancellationToken,
        description: ServerDescription,
    ) -> Result<Box<dyn ServerInstance>, RunnerError> {
        let runtime = Runtime::parse(&description.runtime)?;
        let spec = self.container_spec(&runtime, description);

        tokio::select! {
            _ = cancel.cancelled() => return Err(RunnerError::Cancelled),
            pulled = self.platform.pull_image(&spec.image) => pulled?,
        }

        let span = tracing::debug_span!("server", image = %spec.image, container = %spec.name);
        Ok(Box::new(ContainerServerInstance {
            platform: self.platform.clone(),
            spec,
            exit_grace: self.config.exit_grace,
            span,
        }))
    }

    async fn close(&self) -> Result<(), RunnerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.platform.close().await
    }
}

/// A prepared container server, not yet started
pub struct ContainerServerInstance {
    platform: Arc<dyn ContainerPlatform>,
    spec: ContainerSpec,
    exit_grace: Duration,
    span: Span,
}

impl ContainerServerInstance {
    pub fn spec(&self) -> &ContainerSpec {
        &self.spec
    }

    async fn run_container(
        self: Box<Self>,
        cancel: CancellationToken,
        ready: oneshot::Sender<RunningServer>,
    ) -> RunOutcome {
        if cancel.is_cancelled() {
            return RunOutcome::Cancelled;
        }

        // Not raced against `cancel`: the id is needed to clean up
        let id = match self.platform.create_container(&self.spec).await {
            Ok(id) => id,
            Err(e) => return RunOutcome::Error(e),
        };
        let guard = ContainerGuard::new(self.platform.clone(), id);
        debug!(id = %guard.id(), "created container");

        let outcome = self.supervise(guard.id(), &cancel, ready).await;

        if let Err(e) = guard.release().await {
            warn!(error = %e, "failed to remove container");
        }
        outcome
    }

    async fn supervise(
        &self,
        id: &str,
        cancel: &CancellationToken,
        ready: oneshot::Sender<RunningServer>,
    ) -> RunOutcome {
        let process = tokio::select! {
            biased;
            _ = cancel.cancelled() => return RunOutcome::Cancelled,
            started = self.platform.start_attached(id) => match started {
                Ok(process) => process,
                Err(e) => return RunOutcome::Error(e),
            },
        };
        info!("started container");

        let ContainerProcess {
            stdin,
            stdout,
            stderr,
            mut exit,
        } = process;

        let stderr_task = tokio::spawn(log_stderr(stderr).in_current_span());
        let connection = Connection::new(stdout, stdin, RejectAll, Span::current());

        let outcome = self.lifetime(&connection, cancel, &mut exit, ready).await;

        connection.close();
        stderr_task.abort();
        outcome
    }

    async fn lifetime(
        &self,
        connection: &Connection,
        cancel: &CancellationToken,
        exit: &mut ExitFuture,
        ready: oneshot::Sender<RunningServer>,
    ) -> RunOutcome {
        let initialized = tokio::select! {
            biased;
            _ = cancel.cancelled() => return RunOutcome::Cancelled,
            status = &mut *exit => return exited(status),
            result = handshake(connection, cancel) => result,
        };

        let info = match initialized {
            Ok(info) => info,
            Err(CallError::Cancelled) => return RunOutcome::Cancelled,
            Err(CallError::Closed) => return self.after_disconnect(exit).await,
            Err(e) => return RunOutcome::Error(RunnerError::Handshake(e)),
        };

        info!(
            server = %info.server_info.name,
            version = %info.server_info.version,
            "server initialized"
        );

        let running = RunningServer {
            connection: connection.clone(),
            info,
        };
        if ready.send(running).is_err() {
            debug!("server no longer awaited");
            return RunOutcome::Cancelled;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return RunOutcome::Cancelled,
            status = &mut *exit => return exited(status),
            _ = connection.disconnected() => {}
        }

        self.after_disconnect(exit).await
    }

    /// The stream closed; report the exit status if it follows shortly
    async fn after_disconnect(&self, exit: &mut ExitFuture) -> RunOutcome {
        match tokio::time::timeout(self.exit_grace, exit).await {
            Ok(status) => exited(status),
            Err(_) => RunOutcome::Disconnected,
        }
    }
}

#[async_trait]
impl ServerInstance for ContainerServerInstance {
    async fn run(
        self: Box<Self>,
        cancel: CancellationToken,
        ready: oneshot::Sender<RunningServer>,
    ) -> RunOutcome {
        let span = self.span.clone();
        self.run_container(cancel, ready).instrument(span).await
    }
}

/// Client side of the MCP handshake
async fn handshake(
    connection: &Connection,
    cancel: &CancellationToken,
) -> Result<InitializeResult, CallError> {
    let params = InitializeParams {
        protocol_version: MCP_VERSION.to_string(),
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "mcp".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    };

    let info: InitializeResult = connection.call(cancel, methods::INITIALIZE, params).await?;
    connection.notify(methods::NOTIFICATIONS_INITIALIZED, InitializedParams::default())?;
    Ok(info)
}

fn exited(status: Result<i64, RunnerError>) -> RunOutcome {
    match status {
        Ok(code) => RunOutcome::Exited(code),
        Err(e) => RunOutcome::Error(e),
    }
}

async fn log_stderr(stderr: BoxedReader) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(stderr = %line);
    }
}
