//! # Transport Session
//!
//! One logical connection to the server, shared by every query and feed
//! opened through it.
//!
//! ## Connection lifecycle
//! - Every operation first calls `ensure_usable`: a `Ping` round-trip on the
//!   current connection. A failed probe discards the connection and opens a
//!   new one; only a failed re-establishment is reported to the caller.
//! - Each physical connection gets an epoch and one transport-loop task that
//!   routes inbound frames by token. When the connection ends, pending
//!   queries fail and every feed opened on that epoch moves to `Errored`.
//! - Subscription ids come from a session-wide counter and survive
//!   reconnects, so a late batch from an old connection can never reach a
//!   feed opened on a new one.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::connector::{Connector, Link};
use super::frame::{ClientFrame, ServerFrame};
use super::registry::SubscriptionRegistry;
use crate::changefeed::{Feed, FeedChannel, FeedError, FeedResult, SubscriptionId, SubscriptionOwner};
use crate::config::ChangefeedConfig;
use crate::observability::FeedMetrics;
use crate::query::{Query, SubscriptionRequest, Table};

/// How `ensure_usable` obtained a working connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usable {
    /// The existing connection answered the probe
    Healthy,
    /// The connection was re-established; feeds on the old one have ended
    Recovered,
}

/// Result of `Session::run`
#[derive(Debug)]
pub enum Response {
    /// Value of an ordinary query
    Value(Value),
    /// Handle of a change subscription
    Feed(Feed),
}

impl Response {
    /// Expect an ordinary value
    pub fn into_value(self) -> FeedResult<Value> {
        match self {
            Response::Value(value) => Ok(value),
            Response::Feed(_) => Err(FeedError::Internal("expected a value, got a feed".into())),
        }
    }

    /// Expect a feed
    pub fn into_feed(self) -> FeedResult<Feed> {
        match self {
            Response::Feed(feed) => Ok(feed),
            Response::Value(_) => Err(FeedError::Internal("expected a feed, got a value".into())),
        }
    }
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<ServerFrame>>>;

fn lock_pending(pending: &PendingMap) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<ServerFrame>>> {
    pending.lock().unwrap_or_else(|p| p.into_inner())
}

/// Shared view of one physical connection
#[derive(Clone)]
struct ConnectionHandle {
    epoch: u64,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    /// Requests awaiting a reply, by token
    pending: Arc<PendingMap>,
    alive: Arc<AtomicBool>,
}

impl ConnectionHandle {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

struct Connection {
    handle: ConnectionHandle,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Tear the connection down and end the feeds opened on it
    fn shutdown(self, registry: &SubscriptionRegistry, reason: &str) -> usize {
        self.handle.alive.store(false, Ordering::SeqCst);
        self.reader.abort();
        lock_pending(&self.handle.pending).clear();
        registry.fail_epoch(self.handle.epoch, FeedError::ConnectionError(reason.to_string()))
    }
}

struct SessionInner {
    id: Uuid,
    config: ChangefeedConfig,
    connector: Arc<dyn Connector>,
    connection: tokio::sync::Mutex<Option<Connection>>,
    registry: Arc<SubscriptionRegistry>,
    next_token: AtomicU64,
    next_epoch: AtomicU64,
    metrics: Arc<FeedMetrics>,
    closed: AtomicBool,
}

/// Shared connection multiplexing queries and feeds
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("address", &self.inner.config.address())
            .field("feeds", &self.inner.registry.len())
            .finish()
    }
}

impl Session {
    /// Validate `config` and open the first connection
    pub async fn connect(config: ChangefeedConfig, connector: Arc<dyn Connector>) -> FeedResult<Self> {
        config.validate()?;

        let session = Session {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                config,
                connector,
                connection: tokio::sync::Mutex::new(None),
                registry: Arc::new(SubscriptionRegistry::new()),
                next_token: AtomicU64::new(1),
                next_epoch: AtomicU64::new(1),
                metrics: Arc::new(FeedMetrics::new()),
                closed: AtomicBool::new(false),
            }),
        };

        let connection = session.open_connection().await?;
        *session.inner.connection.lock().await = Some(connection);
        Ok(session)
    }

    /// Session identifier (for logs)
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &ChangefeedConfig {
        &self.inner.config
    }

    /// Counters shared by this session and its feeds
    pub fn metrics(&self) -> &Arc<FeedMetrics> {
        &self.inner.metrics
    }

    /// Number of live feeds
    pub fn registry_len(&self) -> usize {
        self.inner.registry.len()
    }

    /// Whether `close()` has been called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn next_token(&self) -> u64 {
        self.inner.next_token.fetch_add(1, Ordering::Relaxed)
    }

    // ==================
    // Connection
    // ==================

    async fn open_connection(&self) -> FeedResult<Connection> {
        let config = &self.inner.config;
        let connect = self.inner.connector.connect(&config.host, config.port);

        let link = match tokio::time::timeout(config.connect_timeout(), connect).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(FeedError::ConnectionError(format!(
                    "connect to {} timed out after {}ms",
                    config.address(),
                    config.connect_timeout_ms
                )))
            }
        };

        let Link { outbound, inbound } = link;
        let handle = ConnectionHandle {
            epoch: self.inner.next_epoch.fetch_add(1, Ordering::Relaxed),
            outbound,
            pending: Arc::new(Mutex::new(HashMap::new())),
            alive: Arc::new(AtomicBool::new(true)),
        };

        let reader = tokio::spawn(transport_loop(
            handle.epoch,
            inbound,
            Arc::clone(&handle.pending),
            Arc::clone(&handle.alive),
            Arc::clone(&self.inner.registry),
        ));

        info!(
            session = %self.inner.id,
            address = %config.address(),
            epoch = handle.epoch,
            "connected"
        );
        Ok(Connection { handle, reader })
    }

    /// Probe the connection, re-establishing it once if the probe fails.
    ///
    /// Fails with `ConnectionError` only when re-establishment fails; the
    /// next call tries again.
    pub async fn ensure_usable(&self) -> FeedResult<Usable> {
        self.acquire().await.map(|(_, usable)| usable)
    }

    async fn acquire(&self) -> FeedResult<(ConnectionHandle, Usable)> {
        if self.is_closed() {
            return Err(FeedError::ConnectionError("session closed".into()));
        }

        let mut slot = self.inner.connection.lock().await;

        if let Some(current) = slot.as_ref() {
            if self.probe(&current.handle).await {
                return Ok((current.handle.clone(), Usable::Healthy));
            }

            self.inner.metrics.increment_probe_failures();
            warn!(
                session = %self.inner.id,
                epoch = current.handle.epoch,
                "connection probe failed, reconnecting"
            );
        }

        if let Some(stale) = slot.take() {
            let failed = stale.shutdown(&self.inner.registry, "connection lost");
            if failed > 0 {
                info!(session = %self.inner.id, feeds = failed, "feeds ended by reconnect");
            }
        }

        let connection = self.open_connection().await?;
        let handle = connection.handle.clone();
        *slot = Some(connection);

        self.inner.metrics.increment_reconnects();
        info!(session = %self.inner.id, epoch = handle.epoch, "connection recovered");
        Ok((handle, Usable::Recovered))
    }

    async fn probe(&self, conn: &ConnectionHandle) -> bool {
        if !conn.is_alive() {
            return false;
        }

        let token = self.next_token();
        let timeout = self.inner.config.probe_timeout();
        match self.request(conn, ClientFrame::Ping { token }, timeout).await {
            Ok(ServerFrame::Pong { .. }) => true,
            Ok(other) => {
                debug!(token, frame = ?other, "unexpected probe reply");
                false
            }
            Err(e) => {
                debug!(token, error = %e, "probe failed");
                false
            }
        }
    }

    /// Send a frame and wait for the reply carrying its token
    async fn request(
        &self,
        conn: &ConnectionHandle,
        frame: ClientFrame,
        timeout: Duration,
    ) -> FeedResult<ServerFrame> {
        let token = frame.token();
        let (tx, rx) = oneshot::channel();
        lock_pending(&conn.pending).insert(token, tx);

        // The loop marks the connection dead before it clears the map
        if !conn.is_alive() || conn.outbound.send(frame).is_err() {
            lock_pending(&conn.pending).remove(&token);
            return Err(FeedError::ConnectionError("connection closed".into()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(FeedError::ConnectionError("connection lost".into())),
            Err(_) => {
                lock_pending(&conn.pending).remove(&token);
                Err(FeedError::Timeout(format!(
                    "no reply to request {} within {}ms",
                    token,
                    timeout.as_millis()
                )))
            }
        }
    }

    async fn current_connection(&self) -> Option<ConnectionHandle> {
        self.inner
            .connection
            .lock()
            .await
            .as_ref()
            .map(|c| c.handle.clone())
    }

    // ==================
    // Queries
    // ==================

    /// Run a query. A change subscription yields a feed; anything else a
    /// value.
    pub async fn run(&self, query: Query) -> FeedResult<Response> {
        match query {
            Query::Changes { table, options } => {
                let request = SubscriptionRequest::new(table).with_options(options);
                self.subscribe(&request).await.map(Response::Feed)
            }
            query => self.execute(query).await.map(Response::Value),
        }
    }

    pub(crate) async fn execute(&self, query: Query) -> FeedResult<Value> {
        let (conn, _) = self.acquire().await?;
        self.inner.metrics.increment_queries();

        let token = self.next_token();
        let timeout = self.inner.config.request_timeout();
        match self.request(&conn, ClientFrame::Start { token, query }, timeout).await? {
            ServerFrame::Success { payload, .. } => Ok(payload),
            ServerFrame::RuntimeError { kind, message, .. } => Err(kind.into_error(message)),
            other => Err(FeedError::Internal(format!(
                "unexpected reply to query {}: {:?}",
                token, other
            ))),
        }
    }

    /// Handle on a table
    pub fn table(&self, name: impl Into<String>) -> Table {
        Table::new(self.clone(), name)
    }

    pub async fn table_create(&self, name: &str) -> FeedResult<()> {
        self.execute(Query::TableCreate { name: name.to_string() }).await?;
        info!(session = %self.inner.id, table = name, "table created");
        Ok(())
    }

    /// Drop a table. Feeds watching it end with `ResourceGone`.
    pub async fn table_drop(&self, name: &str) -> FeedResult<()> {
        self.execute(Query::TableDrop { name: name.to_string() }).await?;
        info!(session = %self.inner.id, table = name, "table dropped");
        Ok(())
    }

    pub async fn table_list(&self) -> FeedResult<Vec<String>> {
        let value = self.execute(Query::TableList).await?;
        serde_json::from_value(value)
            .map_err(|e| FeedError::Internal(format!("invalid table list: {}", e)))
    }

    // ==================
    // Feeds
    // ==================

    /// Open a change feed.
    ///
    /// The feed is registered before the request is sent, so records the
    /// server emits right after accepting it are never lost.
    pub async fn subscribe(&self, request: &SubscriptionRequest) -> FeedResult<Feed> {
        let (conn, _) = self.acquire().await?;

        let token = self.next_token();
        let channel = FeedChannel::new(
            token,
            request.table.as_str(),
            self.inner.config.feed_settings(),
            Arc::clone(&self.inner.metrics),
        );
        self.inner.registry.register(Arc::clone(&channel), conn.epoch)?;

        let start = ClientFrame::Start {
            token,
            query: request.to_query(),
        };
        let reply = self
            .request(&conn, start, self.inner.config.request_timeout())
            .await;

        let failure = match reply {
            Ok(ServerFrame::FeedStarted { .. }) => None,
            Ok(ServerFrame::RuntimeError { kind, message, .. }) => Some(kind.into_error(message)),
            Ok(other) => Some(FeedError::Internal(format!(
                "unexpected reply to subscription {}: {:?}",
                token, other
            ))),
            Err(e) => {
                if matches!(e, FeedError::Timeout(_)) {
                    // The server may still open it
                    let _ = conn.outbound.send(ClientFrame::Stop { token });
                }
                Some(e)
            }
        };
        if let Some(err) = failure {
            self.inner.registry.remove(token);
            debug!(feed = token, table = %request.table, error = %err, "subscribe failed");
            return Err(err);
        }

        self.inner.metrics.increment_feeds_opened();
        info!(
            session = %self.inner.id,
            feed = token,
            table = %request.table,
            epoch = conn.epoch,
            "feed opened"
        );
        Ok(Feed::new(channel, Arc::new(self.clone())))
    }

    /// `subscribe`, retrying transport failures with a fixed backoff
    pub async fn subscribe_with_retry(&self, request: &SubscriptionRequest) -> FeedResult<Feed> {
        let max_retries = self.inner.config.max_subscribe_retries;
        let mut attempt = 0;

        loop {
            match self.subscribe(request).await {
                Err(e) if e.is_retryable() && attempt < max_retries && !self.is_closed() => {
                    attempt += 1;
                    warn!(
                        table = %request.table,
                        attempt,
                        max_retries,
                        error = %e,
                        "subscribe failed, retrying"
                    );
                    tokio::time::sleep(self.inner.config.retry_backoff()).await;
                }
                result => return result,
            }
        }
    }

    /// Stop the server-side feed and forget it
    async fn stop_feed(&self, id: SubscriptionId) -> FeedResult<()> {
        let Some(route) = self.inner.registry.remove(id) else {
            return Ok(());
        };

        // Feeds of a previous connection have nothing left to stop
        let conn = match self.current_connection().await {
            Some(conn) if conn.epoch == route.epoch && conn.is_alive() => conn,
            _ => return Ok(()),
        };

        let timeout = self.inner.config.request_timeout();
        match self.request(&conn, ClientFrame::Stop { token: id }, timeout).await {
            Ok(ServerFrame::FeedEnded { .. }) => Ok(()),
            // Ended server-side while the stop was in flight
            Ok(ServerFrame::RuntimeError { .. }) => Ok(()),
            Ok(other) => Err(FeedError::Internal(format!(
                "unexpected reply to stop {}: {:?}",
                id, other
            ))),
            Err(FeedError::ConnectionError(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// End every feed, then drop the connection
    pub async fn close(&self) -> FeedResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let ended = self
            .inner
            .registry
            .fail_all(FeedError::ConnectionError("session closed".into()));

        if let Some(connection) = self.inner.connection.lock().await.take() {
            connection.shutdown(&self.inner.registry, "session closed");
        }

        info!(session = %self.inner.id, feeds = ended, "session closed");
        Ok(())
    }
}

impl SubscriptionOwner for Session {
    fn release(&self, id: SubscriptionId) -> BoxFuture<'static, FeedResult<()>> {
        let session = self.clone();
        async move { session.stop_feed(id).await }.boxed()
    }
}

/// Route inbound frames of one connection until it ends
async fn transport_loop(
    epoch: u64,
    mut inbound: mpsc::UnboundedReceiver<ServerFrame>,
    pending: Arc<PendingMap>,
    alive: Arc<AtomicBool>,
    registry: Arc<SubscriptionRegistry>,
) {
    debug!(epoch, "transport loop started");

    while let Some(frame) = inbound.recv().await {
        if let ServerFrame::FeedBatch { token, records } = frame {
            registry.route(token, records);
            continue;
        }

        let token = frame.token();
        let waiter = lock_pending(&pending).remove(&token);
        match (waiter, frame) {
            (Some(waiter), frame) => {
                // The requester may have timed out
                let _ = waiter.send(frame);
            }
            (None, ServerFrame::RuntimeError { token, kind, message }) => {
                registry.fail(token, kind.into_error(message));
            }
            (None, frame) => {
                debug!(epoch, token, frame = ?frame, "unsolicited frame");
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    lock_pending(&pending).clear();
    let failed = registry.fail_epoch(epoch, FeedError::ConnectionError("connection lost".into()));
    error!(epoch, feeds = failed, "connection lost");
}
