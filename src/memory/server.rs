//! # In-Memory Server
//!
//! Serves the frame protocol from process memory. Each accepted connection
//! gets a task that executes client frames in arrival order.
//!
//! Writes and change emission happen under one lock, so every watcher sees
//! the table's mutations in commit order, and a watcher on the writing
//! connection receives the batch before the write's reply.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::table::{TableData, WriteOutcome};
use crate::changefeed::{ChangeRecord, FeedError, FeedResult, StreamState};
use crate::query::{FeedOptions, Query};
use crate::transport::{ClientFrame, Connector, ErrorKind, Link, ServerFrame};

/// Sender half of a connection's inbound stream
type FrameSender = mpsc::UnboundedSender<ServerFrame>;

/// Message sent to watchers of a dropped table
pub const TABLE_UNAVAILABLE: &str = "Changefeed aborted (table unavailable).";

/// A feed watching one table, keyed by (connection, token)
type WatcherKey = (u64, u64);

#[derive(Default)]
struct Table {
    data: TableData,
    watchers: BTreeMap<WatcherKey, FrameSender>,
}

impl Table {
    /// Send one batch to every watcher
    fn emit(&self, records: &[ChangeRecord]) {
        if records.is_empty() {
            return;
        }
        for (&(_, token), sender) in &self.watchers {
            let _ = sender.send(ServerFrame::FeedBatch {
                token,
                records: records.to_vec(),
            });
        }
    }
}

/// Per-connection controls for fault injection
struct ConnectionControl {
    kill: Option<oneshot::Sender<()>>,
    stalled: Arc<AtomicBool>,
}

#[derive(Default)]
struct ServerState {
    tables: Mutex<BTreeMap<String, Table>>,
    connections: Mutex<HashMap<u64, ConnectionControl>>,
    next_connection: AtomicU64,
    refusing: AtomicBool,
}

/// Document server living in process memory
///
/// Cheap to clone; clones share tables and connections.
#[derive(Clone, Default)]
pub struct MemoryServer {
    state: Arc<ServerState>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, BTreeMap<String, Table>> {
        self.state.tables.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<u64, ConnectionControl>> {
        self.state.connections.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ==================
    // Fault injection
    // ==================

    /// Accept or refuse new connections
    pub fn set_accepting(&self, accepting: bool) {
        self.state.refusing.store(!accepting, Ordering::SeqCst);
    }

    /// Close every open connection from the server side
    pub fn drop_connections(&self) -> usize {
        let mut connections = self.connections();
        let mut dropped = 0;
        for control in connections.values_mut() {
            if let Some(kill) = control.kill.take() {
                let _ = kill.send(());
                dropped += 1;
            }
        }
        dropped
    }

    /// Stop answering on every open connection without closing it
    pub fn stall_connections(&self) {
        for control in self.connections().values() {
            control.stalled.store(true, Ordering::SeqCst);
        }
    }

    /// Open connections
    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    /// Feeds watching `table`
    pub fn watcher_count(&self, table: &str) -> usize {
        self.tables().get(table).map(|t| t.watchers.len()).unwrap_or(0)
    }

    // ==================
    // Connections
    // ==================

    fn accept(&self) -> Link {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let stalled = Arc::new(AtomicBool::new(false));

        let id = self.state.next_connection.fetch_add(1, Ordering::Relaxed);
        self.connections().insert(
            id,
            ConnectionControl {
                kill: Some(kill_tx),
                stalled: Arc::clone(&stalled),
            },
        );

        tokio::spawn(self.clone().serve(id, client_rx, server_tx, kill_rx, stalled));
        debug!(connection = id, "connection accepted");

        Link {
            outbound: client_tx,
            inbound: server_rx,
        }
    }

    async fn serve(
        self,
        id: u64,
        mut frames: mpsc::UnboundedReceiver<ClientFrame>,
        out: FrameSender,
        mut kill: oneshot::Receiver<()>,
        stalled: Arc<AtomicBool>,
    ) {
        loop {
            tokio::select! {
                _ = &mut kill => break,
                frame = frames.recv() => match frame {
                    Some(_) if stalled.load(Ordering::SeqCst) => {}
                    Some(frame) => self.handle(id, frame, &out),
                    None => break,
                },
            }
        }

        self.disconnect(id);
        debug!(connection = id, "connection closed");
    }

    /// Forget a connection and its watchers. Dropping the last sender ends
    /// the client's inbound stream.
    fn disconnect(&self, id: u64) {
        for table in self.tables().values_mut() {
            table.watchers.retain(|&(connection, _), _| connection != id);
        }
        self.connections().remove(&id);
    }

    fn handle(&self, connection: u64, frame: ClientFrame, out: &FrameSender) {
        match frame {
            ClientFrame::Ping { token } => {
                let _ = out.send(ServerFrame::Pong { token });
            }
            ClientFrame::Stop { token } => {
                for table in self.tables().values_mut() {
                    table.watchers.remove(&(connection, token));
                }
                let _ = out.send(ServerFrame::FeedEnded { token });
            }
            ClientFrame::Start {
                token,
                query: Query::Changes { table, options },
            } => {
                if let Err(e) = self.open_feed(connection, token, &table, options, out) {
                    let _ = out.send(e);
                }
            }
            ClientFrame::Start { token, query } => {
                let reply = match self.execute(query) {
                    Ok(payload) => ServerFrame::Success { token, payload },
                    Err((kind, message)) => ServerFrame::error(token, kind, message),
                };
                let _ = out.send(reply);
            }
        }
    }

    fn open_feed(
        &self,
        connection: u64,
        token: u64,
        name: &str,
        options: FeedOptions,
        out: &FrameSender,
    ) -> Result<(), ServerFrame> {
        let mut tables = self.tables();
        let table = tables
            .get_mut(name)
            .ok_or_else(|| ServerFrame::error(token, ErrorKind::QueryFailed, missing_table(name)))?;

        let _ = out.send(ServerFrame::FeedStarted { token });

        let batch = |records: Vec<ChangeRecord>| {
            let _ = out.send(ServerFrame::FeedBatch { token, records });
        };
        if options.include_initial {
            if options.include_states {
                batch(vec![ChangeRecord::state(StreamState::Initializing)]);
            }
            let initial: Vec<_> = table.data.documents().cloned().map(ChangeRecord::insert).collect();
            if !initial.is_empty() {
                batch(initial);
            }
        }
        if options.include_states {
            batch(vec![ChangeRecord::state(StreamState::Ready)]);
        }

        table.watchers.insert((connection, token), out.clone());
        debug!(connection, token, table = name, "feed started");
        Ok(())
    }

    fn execute(&self, query: Query) -> Result<Value, (ErrorKind, String)> {
        let mut tables = self.tables();

        let (name, outcome) = match query {
            Query::TableCreate { name } => {
                if tables.contains_key(&name) {
                    return Err((ErrorKind::QueryFailed, format!("Table `{}` already exists.", name)));
                }
                tables.insert(name, Table::default());
                return Ok(json!({ "tables_created": 1 }));
            }
            Query::TableDrop { name } => {
                let table = tables
                    .remove(&name)
                    .ok_or_else(|| (ErrorKind::QueryFailed, missing_table(&name)))?;
                for (&(_, token), sender) in &table.watchers {
                    let _ = sender.send(ServerFrame::error(token, ErrorKind::ResourceGone, TABLE_UNAVAILABLE));
                }
                return Ok(json!({ "tables_dropped": 1 }));
            }
            Query::TableList => {
                return Ok(json!(tables.keys().collect::<Vec<_>>()));
            }
            Query::Get { table, key } => {
                let table = tables
                    .get(&table)
                    .ok_or_else(|| (ErrorKind::QueryFailed, missing_table(&table)))?;
                return Ok(table.data.get(&key).cloned().unwrap_or(Value::Null));
            }
            Query::Changes { .. } => {
                return Err((ErrorKind::Internal, "feed request on query path".into()));
            }

            Query::Insert { table, documents } => {
                let outcome = table_mut(&mut tables, &table)?.data.insert(documents);
                (table, outcome)
            }
            Query::Update { table, key, patch } => {
                let outcome = table_mut(&mut tables, &table)?.data.update(&key, &patch);
                (table, outcome)
            }
            Query::Replace { table, document } => {
                let outcome = table_mut(&mut tables, &table)?.data.replace(document);
                (table, outcome)
            }
            Query::Delete { table, key } => {
                let outcome = table_mut(&mut tables, &table)?.data.delete(&key);
                (table, outcome)
            }
        };

        let (result, records): WriteOutcome = outcome;
        if let Some(table) = tables.get(&name) {
            table.emit(&records);
        }
        serde_json::to_value(result).map_err(|e| (ErrorKind::Internal, e.to_string()))
    }
}

fn missing_table(name: &str) -> String {
    format!("Table `{}` does not exist.", name)
}

fn table_mut<'a>(
    tables: &'a mut BTreeMap<String, Table>,
    name: &str,
) -> Result<&'a mut Table, (ErrorKind, String)> {
    tables
        .get_mut(name)
        .ok_or_else(|| (ErrorKind::QueryFailed, missing_table(name)))
}

impl Connector for MemoryServer {
    fn connect(&self, host: &str, port: u16) -> BoxFuture<'static, FeedResult<Link>> {
        let server = self.clone();
        let address = format!("{}:{}", host, port);
        async move {
            if server.state.refusing.load(Ordering::SeqCst) {
                return Err(FeedError::ConnectionError(format!(
                    "connection refused by {}",
                    address
                )));
            }
            Ok(server.accept())
        }
        .boxed()
    }
}
