//! Viewer subscription gateway
//!
//! A viewer connects to `/reader/thing` and sends one auth frame,
//! `{"Token": "...", "ThingId": "..."}`. The token must be a user credential
//! whose subject owns the thing. On success the connection streams every
//! relay payload for that thing, one text frame per message, until the
//! viewer leaves or the connection is stopped. On failure the viewer gets a
//! single policy-violation close frame with reason `unauthorized` and no data.

use crate::auth::{token_prefix, Authority, AuthorityError, PrincipalKind, TokenError};
use crate::bus::{RelayBus, Subject};
use crate::directory::{DirectoryError, OwnershipDirectory};
use crate::error::ErrorKind;
use crate::server::queue::{ForwardQueue, Pushed};

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Close reason sent on authentication or authorization failure
pub const UNAUTHORIZED_REASON: &str = "unauthorized";

/// Close reason sent when the auth frame cannot be decoded
pub const INVALID_AUTH_REASON: &str = "invalid auth message";

/// How long teardown waits for queued messages to be written
const WRITE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// First frame a viewer sends
#[derive(Debug, Clone, Deserialize)]
pub struct ViewerAuth {
    #[serde(rename = "Token")]
    pub token: String,
    #[serde(rename = "ThingId")]
    pub thing_id: String,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid auth message: {0}")]
    Parse(String),

    #[error("no auth message within {0:?}")]
    AuthTimeout(Duration),

    #[error("connection closed before auth")]
    Disconnected,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid thing id '{0}'")]
    InvalidThingId(String),

    #[error("credential rejected: {0}")]
    Authentication(AuthorityError),

    #[error("{0} credential is not a viewer credential")]
    NotAViewer(PrincipalKind),

    #[error("thing '{0}' is not registered")]
    UnknownThing(String),

    #[error("thing '{thing_id}' is not owned by '{user_id}'")]
    NotOwner { thing_id: String, user_id: String },

    #[error("ownership lookup failed: {0}")]
    Directory(#[from] DirectoryError),

    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Parse(_) => ErrorKind::Parsing,
            GatewayError::InvalidThingId(_) => ErrorKind::Validation,
            GatewayError::Authentication(AuthorityError::Unavailable(_)) => ErrorKind::Connection,
            GatewayError::Authentication(_) => ErrorKind::Authentication,
            GatewayError::NotAViewer(_)
            | GatewayError::UnknownThing(_)
            | GatewayError::NotOwner { .. } => ErrorKind::Authorization,
            GatewayError::AuthTimeout(_)
            | GatewayError::Disconnected
            | GatewayError::Transport(_)
            | GatewayError::Directory(_)
            | GatewayError::Subscribe(_) => ErrorKind::Connection,
        }
    }
}

/// Idempotent stop flag shared between a connection's tasks
#[derive(Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the signal. Returns `true` only for the call that raised it.
    pub fn stop(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal has been raised
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopSignal")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bound on the wait for the auth frame
    pub auth_timeout: Duration,
    /// Per-connection forwarding queue depth
    pub forward_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(10),
            forward_capacity: 256,
        }
    }
}

/// Shared gateway state; cheap to clone per connection
#[derive(Clone)]
pub struct Gateway {
    authority: Arc<dyn Authority>,
    directory: Arc<dyn OwnershipDirectory>,
    bus: Arc<dyn RelayBus>,
    config: GatewayConfig,
    shutdown: StopSignal,
    /// Every connection in `serve_connection`, whatever its state
    connections: TaskTracker,
}

impl Gateway {
    pub fn new(
        authority: Arc<dyn Authority>,
        directory: Arc<dyn OwnershipDirectory>,
        bus: Arc<dyn RelayBus>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            authority,
            directory,
            bus,
            config,
            shutdown: StopSignal::new(),
            connections: TaskTracker::new(),
        }
    }

    /// Connections not yet torn down
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Raise the shutdown signal and wait for every connection to finish
    pub async fn shutdown(&self) {
        self.shutdown.stop();
        self.connections.close();
        self.connections.wait().await;
    }

    /// Server-wide signal; raising it tears down every streaming connection
    pub fn shutdown_signal(&self) -> StopSignal {
        self.shutdown.clone()
    }

    /// Check a viewer's auth frame and return the subject to stream
    pub async fn authorize(&self, auth: &ViewerAuth) -> Result<Subject, GatewayError> {
        let subject = Subject::for_thing(&auth.thing_id)
            .map_err(|_| GatewayError::InvalidThingId(auth.thing_id.clone()))?;

        // Signature already checked; a thing credential fails only on shape
        let claims = match self.authority.user_claims(&auth.token).await {
            Ok(claims) => claims,
            Err(AuthorityError::Token(TokenError::WrongShape)) => {
                return Err(GatewayError::NotAViewer(PrincipalKind::Thing))
            }
            Err(e) => return Err(GatewayError::Authentication(e)),
        };
        if claims.role != PrincipalKind::User {
            return Err(GatewayError::NotAViewer(claims.role));
        }

        match self.directory.owner_of(&auth.thing_id).await? {
            Some(owner) if owner == claims.sub => Ok(subject),
            Some(_) => Err(GatewayError::NotOwner {
                thing_id: auth.thing_id.clone(),
                user_id: claims.sub,
            }),
            None => Err(GatewayError::UnknownThing(auth.thing_id.clone())),
        }
    }

    /// Drive one viewer connection from auth to teardown
    pub async fn serve_connection<S, R, E>(&self, sink: S, stream: R)
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: fmt::Display + Send,
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
    {
        self.connections
            .track_future(self.run_connection(sink, stream))
            .await
    }

    async fn run_connection<S, R, E>(&self, mut sink: S, mut stream: R)
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: fmt::Display + Send,
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
    {
        let conn_id = Uuid::new_v4();

        let read = tokio::time::timeout(self.config.auth_timeout, read_auth(&mut stream));
        let auth = tokio::select! {
            _ = self.shutdown.stopped() => {
                debug!(conn_id = %conn_id, "Shutdown before auth");
                return;
            }
            read = read => read,
        };
        let auth = match auth {
            Ok(Ok(auth)) => auth,
            Ok(Err(e @ GatewayError::Parse(_))) => {
                debug!(conn_id = %conn_id, error = %e, kind = %e.kind(), "Rejecting connection");
                send_close(&mut sink, close_code::INVALID, INVALID_AUTH_REASON).await;
                return;
            }
            Ok(Err(e)) => {
                debug!(conn_id = %conn_id, error = %e, kind = %e.kind(), "Connection ended before auth");
                return;
            }
            Err(_) => {
                let e = GatewayError::AuthTimeout(self.config.auth_timeout);
                debug!(conn_id = %conn_id, error = %e, kind = %e.kind(), "Connection ended before auth");
                return;
            }
        };

        let authorized = tokio::select! {
            _ = self.shutdown.stopped() => {
                debug!(conn_id = %conn_id, thing_id = %auth.thing_id, "Shutdown during authorization");
                return;
            }
            authorized = self.authorize(&auth) => authorized,
        };
        let subject = match authorized {
            Ok(subject) => subject,
            Err(e) => {
                warn!(
                    conn_id = %conn_id,
                    thing_id = %auth.thing_id,
                    token = token_prefix(&auth.token),
                    error = %e,
                    kind = %e.kind(),
                    "Viewer unauthorized"
                );
                send_close(&mut sink, close_code::POLICY, UNAUTHORIZED_REASON).await;
                return;
            }
        };

        let subscription = match self.bus.subscribe(&subject).await {
            Ok(subscription) => subscription,
            Err(e) => {
                let e = GatewayError::Subscribe(e.to_string());
                warn!(conn_id = %conn_id, subject = %subject, error = %e, kind = %e.kind(), "Subscribe failed");
                send_close(&mut sink, close_code::ERROR, "subscribe failed").await;
                return;
            }
        };

        info!(conn_id = %conn_id, subject = %subject, "Viewer streaming");

        let stop = StopSignal::new();
        let queue = Arc::new(ForwardQueue::new(self.config.forward_capacity));

        // Bus -> queue
        let recv_task = {
            let stop = stop.clone();
            let queue = queue.clone();
            let bus = self.bus.clone();
            let mut subscription = subscription;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.stopped() => break,
                        msg = subscription.recv() => match msg {
                            Some(msg) => {
                                if queue.push(msg.payload) == Pushed::Evicted {
                                    debug!(conn_id = %conn_id, dropped = queue.dropped(), "Viewer behind, oldest message dropped");
                                }
                            }
                            None => break,
                        },
                    }
                }
                if let Err(e) = bus.unsubscribe(subscription.id).await {
                    warn!(conn_id = %conn_id, error = %e, "Unsubscribe failed");
                }
            })
        };

        // Queue -> socket
        let write_task = {
            let stop = stop.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                while let Some(payload) = queue.pop().await {
                    let text = String::from_utf8_lossy(&payload).into_owned();
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        let e = e.to_string();
                        if is_closed_error(&e) {
                            debug!(conn_id = %conn_id, error = %e, "Viewer gone");
                        } else {
                            warn!(conn_id = %conn_id, error = %e, kind = %ErrorKind::Connection, "Write failed");
                        }
                        stop.stop();
                        return;
                    }
                }
                let _ = sink.close().await;
            })
        };

        // Watch the inbound side for the viewer leaving
        loop {
            tokio::select! {
                _ = stop.stopped() => break,
                _ = self.shutdown.stopped() => break,
                frame = stream.next() => match frame {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(conn_id = %conn_id, error = %e, "Read failed");
                        break;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }

        // Unsubscribe before closing the queue the receive task writes into
        stop.stop();
        if let Err(e) = recv_task.await {
            warn!(conn_id = %conn_id, error = %e, "Receive task failed");
        }
        queue.close();
        let mut write_task = write_task;
        match tokio::time::timeout(WRITE_DRAIN_TIMEOUT, &mut write_task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(conn_id = %conn_id, error = %e, "Write task failed"),
            Err(_) => {
                debug!(conn_id = %conn_id, "Viewer not draining, aborting writer");
                write_task.abort();
            }
        }

        info!(conn_id = %conn_id, subject = %subject, dropped = queue.dropped(), "Viewer disconnected");
    }
}

async fn read_auth<R, E>(stream: &mut R) -> Result<ViewerAuth, GatewayError>
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(text.as_str()).map_err(|e| GatewayError::Parse(e.to_string()))
            }
            Some(Ok(Message::Binary(data))) => {
                return serde_json::from_slice(&data).map_err(|e| GatewayError::Parse(e.to_string()))
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => return Err(GatewayError::Disconnected),
            Some(Err(e)) => return Err(GatewayError::Transport(e.to_string())),
        }
    }
}

async fn send_close<S>(sink: &mut S, code: u16, reason: &'static str)
where
    S: Sink<Message> + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
}

/// Write errors that just mean the viewer already left
fn is_closed_error(err: &str) -> bool {
    let err = err.to_ascii_lowercase();
    ["closed", "broken pipe", "connection reset", "receiver is gone"]
        .iter()
        .any(|s| err.contains(s))
}

/// Gateway routes: the viewer socket and a health check
pub fn create_router(gateway: Gateway) -> Router {
    Router::new()
        .route("/reader/thing", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(gateway)
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(gateway): State<Gateway>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        gateway.serve_connection(sink, stream).await;
    })
}
