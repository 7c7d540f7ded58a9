/// A bidirectional JSON-RPC connection over a byte stream
///
/// Each connection runs one reader task and one writer task. Outgoing calls
/// park a oneshot sender in the correlation table keyed by request id; the
/// reader resolves it when the matching response arrives. Inbound requests and
/// notifications are handed to the `Handler` on their own task so a slow
/// handler never stalls the read loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn, Instrument, Span};

use super::{method_not_found, CallError, Id, Incoming, Message, RpcError};

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>;

/// An inbound request or notification
#[derive(Debug, Clone)]
pub struct Request {
    /// `None` for notifications
    pub id: Option<Id>,
    pub method: String,
    pub params: Option<Value>,
}

impl Request {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Receives inbound requests and notifications for one connection
///
/// The returned value becomes the response for requests; for notifications
/// it is discarded.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, conn: &Connection, request: Request) -> Result<Value, RpcError>;
}

/// Handler that answers every request with "method not found"
pub struct RejectAll;

#[async_trait]
impl Handler for RejectAll {
    async fn handle(&self, _conn: &Connection, request: Request) -> Result<Value, RpcError> {
        Err(method_not_found(&request.method))
    }
}

/// Cheaply cloneable handle to a running connection
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Mutex<PendingMap>,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the connection closed and fail every pending call
    fn shut_down(&self) {
        self.closed.cancel();
        // Dropping the senders wakes each waiting call with `CallError::Closed`
        let drained: Vec<_> = self.pending().drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "failing pending calls on close");
        }
    }
}

/// Removes a call's correlation entry however the call ends
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending().remove(&self.id);
    }
}

impl Connection {
    /// Start reading from `reader` and writing to `writer`
    ///
    /// Must be called from within a tokio runtime. All log output of the
    /// connection is recorded inside `span`.
    pub fn new<R, W, H>(reader: R, writer: W, handler: H, span: Span) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
        H: Handler,
    {
        let (outgoing, rx) = mpsc::unbounded_channel();
        let conn = Self {
            inner: Arc::new(Inner {
                outgoing,
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: CancellationToken::new(),
            }),
        };

        tokio::spawn(write_loop(writer, rx, conn.inner.clone()).instrument(span.clone()));

        let handler: Arc<dyn Handler> = Arc::new(handler);
        tokio::spawn(conn.clone().read_loop(reader, handler).instrument(span));

        conn
    }

    /// Send a request and wait for its correlated response
    ///
    /// Cancelling `cancel` abandons the call; its correlation entry is
    /// released on every exit path, including the future being dropped.
    pub async fn call<P, R>(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: P,
    ) -> Result<R, CallError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params).map_err(CallError::Encode)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let _guard = {
            let mut pending = self.inner.pending();
            if self.inner.closed.is_cancelled() {
                return Err(CallError::Closed);
            }
            pending.insert(id, tx);
            PendingGuard {
                inner: self.inner.as_ref(),
                id,
            }
        };

        self.inner
            .outgoing
            .send(Message::request(Id::Num(id), method, Some(params)))
            .map_err(|_| CallError::Closed)?;

        let outcome = tokio::select! {
            biased;
            outcome = rx => outcome.map_err(|_| CallError::Closed)?,
            _ = cancel.cancelled() => return Err(CallError::Cancelled),
            _ = self.inner.closed.cancelled() => return Err(CallError::Closed),
        };

        let value = outcome.map_err(CallError::Remote)?;
        serde_json::from_value(value).map_err(CallError::Decode)
    }

    /// Send a one-way notification
    pub fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<(), CallError> {
        if self.inner.closed.is_cancelled() {
            return Err(CallError::Closed);
        }

        let params = serde_json::to_value(params).map_err(CallError::Encode)?;
        self.inner
            .outgoing
            .send(Message::notification(method, Some(params)))
            .map_err(|_| CallError::Closed)
    }

    /// Close the stream and fail all pending calls with `CallError::Closed`
    pub fn close(&self) {
        self.inner.shut_down();
    }

    /// Resolves once the connection is closed or the stream failed
    pub async fn disconnected(&self) {
        self.inner.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Number of calls still waiting for a response
    pub fn pending_count(&self) -> usize {
        self.inner.pending().len()
    }

    fn send(&self, message: Message) {
        // The writer is gone once the connection closes; nothing left to do
        let _ = self.inner.outgoing.send(message);
    }

    async fn read_loop<R>(self, reader: R, handler: Arc<dyn Handler>)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut reader = BufReader::new(reader);
        let mut frame = Vec::new();

        loop {
            frame.clear();
            let read = tokio::select! {
                _ = self.inner.closed.cancelled() => break,
                read = reader.read_until(b'\n', &mut frame) => read,
            };

            match read {
                Ok(0) => {
                    debug!("peer closed the stream");
                    break;
                }
                Ok(_) => self.receive(&frame, &handler),
                Err(e) => {
                    debug!(error = %e, "failed to read from stream");
                    break;
                }
            }
        }

        self.inner.shut_down();
    }

    /// Handle one newline-terminated frame
    ///
    /// Frames that are not valid JSON, including invalid UTF-8, get a parse
    /// error reply and leave the connection open.
    fn receive(&self, frame: &[u8], handler: &Arc<dyn Handler>) {
        let frame = frame.trim_ascii();
        if frame.is_empty() {
            return;
        }

        trace!(message = %String::from_utf8_lossy(frame), "received");

        let message: Message = match serde_json::from_slice(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "discarding malformed message");
                self.send(Message::failure(Id::Null, RpcError::parse_error()));
                return;
            }
        };

        match message.classify() {
            Incoming::Response { id, outcome } => self.resolve(id, outcome),
            Incoming::Request { id, method, params } => self.dispatch(
                handler,
                Request {
                    id: Some(id),
                    method,
                    params,
                },
            ),
            Incoming::Notification { method, params } => self.dispatch(
                handler,
                Request {
                    id: None,
                    method,
                    params,
                },
            ),
            Incoming::Invalid { id } => {
                self.send(Message::failure(id.unwrap_or(Id::Null), RpcError::invalid_request()));
            }
        }
    }

    fn resolve(&self, id: Option<Id>, outcome: Result<Value, RpcError>) {
        let key = match id {
            Some(Id::Num(key)) => key,
            other => {
                warn!(id = ?other, outcome = ?outcome, "response without a usable id");
                return;
            }
        };

        match self.inner.pending().remove(&key) {
            // The caller may have given up in the meantime
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => debug!(id = key, "response for unknown or abandoned call"),
        }
    }

    fn dispatch(&self, handler: &Arc<dyn Handler>, request: Request) {
        let conn = self.clone();
        let handler = handler.clone();

        tokio::spawn(
            async move {
                let id = request.id.clone();
                let method = request.method.clone();

                let outcome = tokio::select! {
                    _ = conn.inner.closed.cancelled() => return,
                    outcome = handler.handle(&conn, request) => outcome,
                };

                match (id, outcome) {
                    (Some(id), Ok(result)) => conn.send(Message::success(id, result)),
                    (Some(id), Err(error)) => {
                        debug!(method = %method, error = %error, "request failed");
                        conn.send(Message::failure(id, error));
                    }
                    (None, Ok(_)) => {}
                    (None, Err(error)) => {
                        debug!(method = %method, error = %error, "notification handler failed");
                    }
                }
            }
            .in_current_span(),
        );
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Message>, inner: Arc<Inner>)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let message = tokio::select! {
            _ = inner.closed.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let mut line = match serde_json::to_string(&message) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to encode outgoing message");
                continue;
            }
        };

        trace!(message = %line, "sending");
        line.push('\n');

        if let Err(e) = write_line(&mut writer, &line).await {
            debug!(error = %e, "failed to write to stream");
            break;
        }
    }

    let _ = writer.shutdown().await;
    inner.shut_down();
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
