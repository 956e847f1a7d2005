//! MySQL client core for sqldrift.
//!
//! Implements the client side of the MySQL wire protocol over plain TCP:
//! framing and packet codec, handshake and authentication, text-protocol
//! query execution, and an asynchronous dispatch front end backed by a
//! worker pool.
//!
//! ```no_run
//! use sqldrift_dispatch::DispatchConfig;
//! use sqldrift_mysql::{Client, MySqlConfig, QueryEvent, QueryOutcome};
//!
//! # fn main() -> sqldrift_core::Result<()> {
//! let client = Client::new(DispatchConfig::new().workers(2));
//! let conn = client
//!     .connect(MySqlConfig::new("127.0.0.1", "app").password("secret"))
//!     .wait()
//!     .map_err(|e| sqldrift_core::Error::state(e.to_string()))??;
//!
//! if let QueryOutcome::Rows(rs) = conn
//!     .query("SELECT id, name FROM users")
//!     .wait()
//!     .map_err(|e| sqldrift_core::Error::state(e.to_string()))??
//! {
//!     for row in &rs.rows {
//!         println!("{:?}", row.get_by_name("name"));
//!     }
//! }
//!
//! let mut stream = conn.query_streaming("SELECT id FROM big_table");
//! while let Some(event) = stream.next_row() {
//!     if let QueryEvent::Row(row) = event {
//!         let _ = row;
//!         break; // cancellation drains the rest server-side
//!     }
//! }
//! stream.cancel();
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod executor;
pub mod protocol;
pub mod types;

pub use client::{AsyncConnection, Client, QueryEvent};
pub use config::MySqlConfig;
pub use connection::{Connection, ConnectionState, ServerInfo};
pub use executor::{
    OkSummary, QueryOutcome, ResultSet, RowSink, SinkFlow, StreamSummary,
};
pub use types::{ColumnDef, FieldType};

// Core types most callers need alongside the client.
pub use sqldrift_core::{ColumnInfo, Error, Result, Row, Value};
