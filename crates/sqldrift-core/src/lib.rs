//! Shared leaf types for the sqldrift MySQL client.
//!
//! This crate carries the pieces every other sqldrift crate needs:
//!
//! - The [`Error`] taxonomy (network, timeout, protocol, auth, state, query)
//! - [`Value`], a dynamically-typed SQL value
//! - [`Row`] and [`ColumnInfo`], with column metadata shared via `Arc`
//!
//! Nothing in here touches a socket or a thread; it is all plain data.

pub mod error;
pub mod row;
pub mod value;

pub use error::{
    AuthError, Error, NetworkError, NetworkErrorKind, ProtocolError, QueryError, Result,
    StateError, TimeoutError, TimeoutPhase,
};
pub use row::{ColumnInfo, Row};
pub use value::{FromValue, Value};
