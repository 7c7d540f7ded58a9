/// Local broker: one upstream MCP session in front of many child servers
///
/// The broker serves a single upstream connection. At startup it lists the
/// installed integrations and starts each of them in the background; from
/// then on it follows the catalog's change events, starting integrations as
/// they are added and stopping them as they are removed. Tool listings are
/// aggregated from the built-in tools and every running child, and tool calls
/// are routed to whoever listed the tool.
///
/// A failing child never affects the session or the other children: it is
/// logged and dropped from the active set. Only the upstream connection
/// closing or the root cancellation token firing ends `serve`.

pub mod active;
mod handler;
pub mod state;

pub use active::{ActiveIntegrations, ActiveServer};
pub use handler::INSTRUCTIONS;
pub use state::{BrokerMethod, SessionState};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument, Span};

use crate::config::BrokerConfig;
use crate::integrations::{
    ChangeKind, InstalledIntegration, IntegrationsChangedEvent, IntegrationsRepository, RepositoryError,
};
use crate::jsonrpc::{CallError, Connection, RpcError};
use crate::mcp::{methods, ToolDefinition, ToolsListParams, ToolsListResult};
use crate::registry::RegistryClient;
use crate::runner::{RunOutcome, RunnerError, RunningServer, ServerRunner};

use handler::BrokerHandler;

/// Errors that end a broker session
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// The upstream peer went away; ordinary end of a session
    #[error("upstream connection closed")]
    ConnectionClosed,
}

impl BrokerError {
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, BrokerError::ConnectionClosed)
    }
}

/// Why an integration did not reach the running state
#[derive(Error, Debug)]
pub enum StartError {
    #[error("integration is already starting or running")]
    AlreadyActive,

    #[error("failed to create server: {0}")]
    Create(#[source] RunnerError),

    #[error("start did not finish within {0:?}")]
    Timeout(Duration),

    #[error("server stopped before it was ready: {0}")]
    Stopped(String),

    #[error("failed to list server tools: {0}")]
    Discovery(#[source] CallError),

    #[error("start was cancelled")]
    Cancelled,
}

/// State shared by the session loop, the request handler and start tasks
pub(crate) struct BrokerInner {
    config: BrokerConfig,
    repository: Arc<dyn IntegrationsRepository>,
    runner: Arc<dyn ServerRunner>,
    registry: Arc<dyn RegistryClient>,
    active: ActiveIntegrations,
    state: Mutex<SessionState>,
    upstream: Mutex<Option<Connection>>,
    /// Child of the root token; cancelled when the session ends
    session: CancellationToken,
    tasks: TaskTracker,
    span: Span,
}

/// The local MCP broker
#[derive(Clone)]
pub struct LocalBroker {
    inner: Arc<BrokerInner>,
}

impl LocalBroker {
    /// Create a broker whose lifetime is bounded by `root`
    pub fn new(
        root: &CancellationToken,
        config: BrokerConfig,
        repository: Arc<dyn IntegrationsRepository>,
        runner: Arc<dyn ServerRunner>,
        registry: Arc<dyn RegistryClient>,
    ) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                config,
                repository,
                runner,
                registry,
                active: ActiveIntegrations::new(),
                state: Mutex::new(SessionState::Uninitialized),
                upstream: Mutex::new(None),
                session: root.child_token(),
                tasks: TaskTracker::new(),
                span: tracing::info_span!("broker"),
            }),
        }
    }

    /// Serve one upstream session over `reader`/`writer`
    ///
    /// Returns `Ok(())` when the root token is cancelled and
    /// `Err(BrokerError::ConnectionClosed)` when the upstream peer disconnects.
    /// Either way every child has been told to stop and given up to
    /// `shutdown_grace` to release its resources.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<(), BrokerError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let span = self.inner.span.clone();
        self.inner.clone().serve(reader, writer).instrument(span).await
    }

    /// Start one integration, bounded by `timeout`
    ///
    /// Resolves once the integration is running (its tools are listed from
    /// then on) or the attempt failed. A failed attempt leaves nothing behind.
    pub async fn start_integration(
        &self,
        integration: InstalledIntegration,
        timeout: Duration,
    ) -> Result<(), StartError> {
        let span = self.inner.integration_span(&integration);
        self.inner.clone().start(integration, timeout).instrument(span).await
    }

    /// Stop an integration if it is starting or running
    pub fn stop_integration(&self, id: &str) -> bool {
        self.inner.stop(id)
    }

    pub fn active_integrations(&self) -> &ActiveIntegrations {
        &self.inner.active
    }

    pub fn session_state(&self) -> SessionState {
        self.inner.state()
    }

    /// Token that is cancelled when the session ends
    pub fn session_token(&self) -> &CancellationToken {
        &self.inner.session
    }
}

impl BrokerInner {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> SessionState {
        *self.lock_state()
    }

    /// Apply a state transition atomically
    fn transition<F>(&self, f: F) -> Result<SessionState, RpcError>
    where
        F: FnOnce(SessionState) -> Result<SessionState, RpcError>,
    {
        let mut state = self.lock_state();
        *state = f(*state)?;
        Ok(*state)
    }

    fn integration_span(&self, integration: &InstalledIntegration) -> Span {
        tracing::info_span!(
            parent: &self.span,
            "integration",
            id = %integration.id,
            name = %integration.manifest.name
        )
    }

    async fn serve<R, W>(self: Arc<Self>, reader: R, writer: W) -> Result<(), BrokerError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        // Subscribe before listing so no change between the two is missed
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let subscription = self.repository.subscribe(Arc::new(move |event: &IntegrationsChangedEvent| {
            let _ = events_tx.send(event.clone());
        }));

        let integrations = self.repository.list().await?;

        let connection = Connection::new(
            reader,
            writer,
            BrokerHandler {
                broker: self.clone(),
            },
            Span::current(),
        );
        *self.upstream.lock().unwrap_or_else(PoisonError::into_inner) = Some(connection.clone());

        info!(count = integrations.len(), "starting installed integrations");
        for integration in integrations {
            self.spawn_start(integration);
        }

        let result = loop {
            tokio::select! {
                _ = self.session.cancelled() => {
                    info!("shutdown requested");
                    break Ok(());
                }
                _ = connection.disconnected() => {
                    info!("upstream disconnected");
                    break Err(BrokerError::ConnectionClosed);
                }
                Some(event) = events.recv() => self.on_change(event),
            }
        };

        subscription.unsubscribe();
        self.shutdown(&connection).await;
        result
    }

    async fn shutdown(&self, connection: &Connection) {
        *self.lock_state() = SessionState::Closed;
        self.session.cancel();
        self.active.stop_all();
        connection.close();

        self.tasks.close();
        if tokio::time::timeout(self.config.shutdown_grace, self.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.tasks.len(),
                "integrations did not stop within {:?}", self.config.shutdown_grace
            );
        }

        info!("broker stopped");
    }

    fn on_change(self: &Arc<Self>, event: IntegrationsChangedEvent) {
        let integration = event.integration;
        match event.kind {
            ChangeKind::Added => {
                info!(id = %integration.id, name = %integration.manifest.name, "integration added");
                self.spawn_start(integration);
            }
            ChangeKind::Removed => {
                info!(id = %integration.id, name = %integration.manifest.name, "integration removed");
                self.stop(&integration.id);
            }
        }
    }

    fn stop(&self, id: &str) -> bool {
        let stopped = self.active.stop(id);
        if stopped {
            self.notify_tools_changed();
        }
        stopped
    }

    fn spawn_start(self: &Arc<Self>, integration: InstalledIntegration) {
        let span = self.integration_span(&integration);
        let broker = self.clone();
        let timeout = self.config.start_timeout;

        self.tasks.spawn(
            async move {
                if let Err(e) = broker.start(integration, timeout).await {
                    warn!(error = %e, "integration not started");
                }
            }
            .instrument(span),
        );
    }

    async fn start(
        self: Arc<Self>,
        integration: InstalledIntegration,
        timeout: Duration,
    ) -> Result<(), StartError> {
        let deadline = Instant::now() + timeout;
        let token = self.session.child_token();
        let start_key = match self.active.begin_start(&integration.id, token.clone()) {
            Some(key) => key,
            None => return Err(StartError::AlreadyActive),
        };

        let id = integration.id.clone();
        let result = self
            .clone()
            .launch(integration, start_key, token.clone(), deadline, timeout)
            .await;
        if result.is_err() {
            token.cancel();
            self.active.abandon_start(&id, start_key);
        }
        result
    }

    async fn launch(
        self: Arc<Self>,
        integration: InstalledIntegration,
        start_key: u64,
        token: CancellationToken,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(), StartError> {
        for name in integration.missing_env() {
            warn!(variable = %name, "required environment variable not set");
        }

        let created = tokio::time::timeout_at(
            deadline,
            self.runner.create(&token, integration.server_description()),
        )
        .await;
        let instance = match created {
            Err(_) => return Err(StartError::Timeout(timeout)),
            Ok(Err(RunnerError::Cancelled)) => return Err(StartError::Cancelled),
            Ok(Err(e)) => return Err(StartError::Create(e)),
            Ok(Ok(instance)) => instance,
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let mut run = self
            .tasks
            .spawn(instance.run(token.clone(), ready_tx).in_current_span());

        let running = tokio::select! {
            ready = ready_rx => match ready {
                Ok(running) => running,
                Err(_) => {
                    return match join(&mut run).await {
                        RunOutcome::Cancelled => Err(StartError::Cancelled),
                        outcome => Err(StartError::Stopped(outcome.to_string())),
                    };
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                token.cancel();
                join(&mut run).await;
                return Err(StartError::Timeout(timeout));
            }
        };

        let tools = match tokio::time::timeout_at(deadline, list_child_tools(&running, &token)).await {
            Ok(Ok(tools)) => tools,
            Ok(Err(CallError::Remote(e))) => {
                debug!(error = %e, "server does not list tools");
                Vec::new()
            }
            Ok(Err(e)) => {
                token.cancel();
                join(&mut run).await;
                return Err(StartError::Discovery(e));
            }
            Err(_) => {
                token.cancel();
                join(&mut run).await;
                return Err(StartError::Timeout(timeout));
            }
        };

        let id = integration.id.clone();
        let tool_count = tools.len();
        let key = match self.active.promote(start_key, integration, running.connection, tools) {
            Some(key) => key,
            None => {
                token.cancel();
                join(&mut run).await;
                return Err(StartError::Cancelled);
            }
        };

        info!(
            server = %running.info.server_info.name,
            tools = tool_count,
            "integration running"
        );
        self.notify_tools_changed();

        let broker = self.clone();
        self.tasks.spawn(
            async move {
                let outcome = join(&mut run).await;
                broker.on_stopped(&id, key, outcome);
            }
            .in_current_span(),
        );

        Ok(())
    }

    fn on_stopped(&self, id: &str, key: u64, outcome: RunOutcome) {
        if self.active.remove_run(id, key) {
            self.notify_tools_changed();
        }

        if outcome.is_clean() {
            info!(outcome = %outcome, "integration stopped");
        } else {
            warn!(outcome = %outcome, "integration stopped");
        }
    }

    /// Tell the upstream client the tool list changed, once it can hear it
    fn notify_tools_changed(&self) {
        if self.state() != SessionState::Running {
            return;
        }

        let upstream = self.upstream.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(connection) = upstream {
            if let Err(e) = connection.notify(methods::TOOLS_LIST_CHANGED, json!({})) {
                debug!(error = %e, "could not announce tool list change");
            }
        }
    }
}

/// Every page of a child's `tools/list`
async fn list_child_tools(
    running: &RunningServer,
    cancel: &CancellationToken,
) -> Result<Vec<ToolDefinition>, CallError> {
    let mut tools = Vec::new();
    let mut cursor = None;

    loop {
        let page: ToolsListResult = running
            .connection
            .call(cancel, methods::TOOLS_LIST, ToolsListParams { cursor })
            .await?;
        tools.extend(page.tools);

        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => return Ok(tools),
        }
    }
}

async fn join(run: &mut JoinHandle<RunOutcome>) -> RunOutcome {
    match run.await {
        Ok(outcome) => outcome,
        Err(e) => RunOutcome::Error(RunnerError::Platform(format!("run task failed: {}", e))),
    }
}
