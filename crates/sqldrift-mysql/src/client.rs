//! Asynchronous front door: connections whose operations run on a worker
//! pool and resolve through completions.
//!
//! Each [`AsyncConnection`] wraps exactly one blocking [`Connection`]. A
//! connection carries at most one in-flight operation; a second submission
//! while one is pending fails immediately on the caller's thread with a
//! state error, it is never queued behind the first.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use sqldrift_core::{Error, Result, Row, Value};
use sqldrift_dispatch::{Completion, DispatchConfig, Dispatcher, RowSender, StreamHandle};
use tracing::debug;

use crate::config::MySqlConfig;
use crate::connection::{Connection, ConnectionState};
use crate::executor::{QueryOutcome, RowSink, SinkFlow, StreamSummary};
use crate::types::ColumnDef;

/// Factory for pooled-dispatch connections.
///
/// Owns the worker pool; connections opened through one client share it.
/// Dropping the client (and every connection's pending completions) shuts
/// the pool down.
pub struct Client {
    dispatcher: Arc<Dispatcher>,
}

impl Client {
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new(config)),
        }
    }

    /// Open a connection on a worker thread.
    pub fn connect(&self, config: MySqlConfig) -> Completion<Result<AsyncConnection>> {
        let dispatcher = Arc::clone(&self.dispatcher);
        self.dispatcher.submit(move || {
            let conn = Connection::open(config)?;
            Ok(AsyncConnection {
                slot: Arc::new(Slot {
                    busy: AtomicBool::new(false),
                    conn: Mutex::new(Some(conn)),
                }),
                dispatcher,
            })
        })
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new(DispatchConfig::default())
    }
}

/// Shared between the handle and in-flight jobs.
struct Slot {
    /// Set while an operation is pending; checked on the caller's thread
    busy: AtomicBool,
    conn: Mutex<Option<Connection>>,
}

/// Clears the busy flag when the operation settles, even on panic.
struct BusyGuard {
    slot: Arc<Slot>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
    }
}

/// An item delivered by a streaming query.
#[derive(Debug, Clone)]
pub enum QueryEvent {
    /// Column definitions, delivered once before any row
    Columns(Vec<ColumnDef>),
    Row(Row),
}

/// Bridges the executor's sink callbacks onto the stream channel.
struct ChannelSink {
    rows: RowSender<QueryEvent>,
}

impl RowSink for ChannelSink {
    fn on_columns(&mut self, columns: &[ColumnDef]) -> SinkFlow {
        match self.rows.send(QueryEvent::Columns(columns.to_vec())) {
            Ok(()) => SinkFlow::Continue,
            Err(_) => SinkFlow::Stop,
        }
    }

    fn on_row(&mut self, row: Row) -> SinkFlow {
        match self.rows.send(QueryEvent::Row(row)) {
            Ok(()) => SinkFlow::Continue,
            Err(_) => SinkFlow::Stop,
        }
    }
}

/// A MySQL connection whose operations run off the caller's thread.
pub struct AsyncConnection {
    slot: Arc<Slot>,
    dispatcher: Arc<Dispatcher>,
}

impl AsyncConnection {
    /// Run a statement and resolve with its buffered outcome.
    pub fn query(&self, sql: impl Into<String>) -> Completion<Result<QueryOutcome>> {
        let sql = sql.into();
        self.submit(move |conn| conn.execute(&sql))
    }

    /// Run a statement with `?` placeholders substituted from `params`.
    pub fn query_params(
        &self,
        sql: impl Into<String>,
        params: Vec<Value>,
    ) -> Completion<Result<QueryOutcome>> {
        let sql = sql.into();
        self.submit(move |conn| conn.execute_params(&sql, &params))
    }

    /// Run a statement, streaming rows back as they are decoded.
    ///
    /// Rows arrive in wire order, strictly before the final summary.
    /// Cancelling the handle stops delivery; the worker drains the rest
    /// of the result set so the connection comes back `Ready`.
    pub fn query_streaming(
        &self,
        sql: impl Into<String>,
    ) -> StreamHandle<QueryEvent, Result<StreamSummary>> {
        let sql = sql.into();
        let guard = match self.acquire() {
            Ok(guard) => guard,
            Err(err) => return StreamHandle::ready(Err(err)),
        };
        let slot = Arc::clone(&self.slot);
        self.dispatcher.submit_streaming(move |rows| {
            let _guard = guard;
            let mut conn = slot.conn.lock();
            let Some(conn) = conn.as_mut() else {
                return Err(closed_error());
            };
            let mut sink = ChannelSink { rows };
            conn.execute_streaming(&sql, &mut sink)
        })
    }

    /// Check liveness with COM_PING.
    pub fn ping(&self) -> Completion<Result<()>> {
        self.submit(Connection::ping)
    }

    /// Switch the default database.
    pub fn use_database(&self, database: impl Into<String>) -> Completion<Result<()>> {
        let database = database.into();
        self.submit(move |conn| conn.use_database(&database))
    }

    /// Close the connection. Idempotent; pending is still pending, so a
    /// close issued while an operation is in flight fails fast like any
    /// other second operation.
    pub fn close(&self) -> Completion<Result<()>> {
        let guard = match self.acquire() {
            Ok(guard) => guard,
            Err(err) => return Completion::ready(Err(err)),
        };
        let slot = Arc::clone(&self.slot);
        self.dispatcher.submit(move || {
            let _guard = guard;
            if let Some(mut conn) = slot.conn.lock().take() {
                conn.close();
                debug!("connection closed");
            }
            Ok(())
        })
    }

    /// True while an operation is in flight.
    pub fn is_busy(&self) -> bool {
        self.slot.busy.load(Ordering::Acquire)
    }

    /// Current connection state. `Disconnected` after close.
    pub fn state(&self) -> ConnectionState {
        self.slot
            .conn
            .lock()
            .as_ref()
            .map_or(ConnectionState::Disconnected, Connection::state)
    }

    fn submit<T, F>(&self, op: F) -> Completion<Result<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let guard = match self.acquire() {
            Ok(guard) => guard,
            Err(err) => return Completion::ready(Err(err)),
        };
        let slot = Arc::clone(&self.slot);
        self.dispatcher.submit(move || {
            let _guard = guard;
            let mut conn = slot.conn.lock();
            match conn.as_mut() {
                Some(conn) => op(conn),
                None => Err(closed_error()),
            }
        })
    }

    /// Claim the single-operation slot on the caller's thread, so a
    /// rejected submission never depends on worker scheduling.
    fn acquire(&self) -> Result<BusyGuard> {
        if self
            .slot
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Ok(BusyGuard {
                slot: Arc::clone(&self.slot),
            })
        } else {
            Err(Error::state(
                "an operation is already in flight on this connection",
            ))
        }
    }
}

impl std::fmt::Debug for AsyncConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncConnection")
            .field("busy", &self.is_busy())
            .field("state", &self.state())
            .finish()
    }
}

fn closed_error() -> Error {
    Error::state("connection is closed")
}
