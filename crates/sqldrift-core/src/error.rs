//! Error types for sqldrift operations.
//!
//! The taxonomy distinguishes failures by what the caller can do next and by
//! what happens to the connection that produced them:
//!
//! | variant    | connection afterwards | caller action              |
//! |------------|-----------------------|----------------------------|
//! | `Network`  | Disconnected          | retry/backoff              |
//! | `Timeout`  | Disconnected          | reconnect                  |
//! | `Protocol` | Disconnected          | reconnect, report mismatch |
//! | `Auth`     | no connection         | fix credentials            |
//! | `State`    | untouched             | fix the calling code       |
//! | `Query`    | Ready (reusable)      | fix the SQL                |

use std::fmt;
use std::time::Duration;

/// The primary error type for all sqldrift operations.
#[derive(Debug)]
pub enum Error {
    /// Socket-level failures: refused, reset, DNS, lost connection
    Network(NetworkError),
    /// A connect/read/write exceeded its deadline
    Timeout(TimeoutError),
    /// Malformed or out-of-phase packet (wire-level)
    Protocol(ProtocolError),
    /// Credentials rejected or auth exchange failed
    Auth(AuthError),
    /// Operation issued against a busy or non-Ready connection
    State(StateError),
    /// Server-reported SQL error inside a healthy protocol exchange
    Query(QueryError),
}

#[derive(Debug)]
pub struct NetworkError {
    pub kind: NetworkErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Connection refused by the peer
    Refused,
    /// Connection reset mid-exchange
    Reset,
    /// Hostname resolution failed
    Dns,
    /// Other connect-phase failure
    Connect,
    /// Connection lost during an operation
    Disconnected,
}

#[derive(Debug)]
pub struct TimeoutError {
    pub phase: TimeoutPhase,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    Connect,
    Read,
    Write,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    /// Offending payload bytes, when captured
    pub raw: Option<Vec<u8>>,
}

#[derive(Debug)]
pub struct AuthError {
    /// Authentication plugin in use when the exchange failed
    pub plugin: String,
    pub message: String,
}

#[derive(Debug)]
pub struct StateError {
    pub message: String,
}

#[derive(Debug)]
pub struct QueryError {
    /// Server error code (e.g. 1064 for a syntax error)
    pub code: u16,
    /// Five-character SQLSTATE, empty when the server omitted it
    pub sqlstate: String,
    pub message: String,
}

impl Error {
    /// Shorthand for a protocol violation without captured bytes.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(ProtocolError {
            message: message.into(),
            raw: None,
        })
    }

    /// Shorthand for a caller-bug state error.
    pub fn state(message: impl Into<String>) -> Self {
        Error::State(StateError {
            message: message.into(),
        })
    }

    /// Does this failure force the connection to Disconnected?
    ///
    /// `Query` leaves the connection Ready; `State` leaves it untouched.
    pub fn forces_disconnect(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Timeout(_) | Error::Protocol(_)
        )
    }

    /// Can the caller reasonably retry after backoff?
    ///
    /// Retrying is the caller's job; sqldrift never retries internally.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_))
    }

    /// Server error code, if this is a `Query` error.
    pub fn server_code(&self) -> Option<u16> {
        match self {
            Error::Query(q) => Some(q.code),
            _ => None,
        }
    }
}

impl NetworkError {
    /// Build a `NetworkError` from an I/O error, classifying by its kind.
    pub fn from_io(context: impl Into<String>, err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::ConnectionRefused => NetworkErrorKind::Refused,
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe => {
                NetworkErrorKind::Reset
            }
            _ => NetworkErrorKind::Disconnected,
        };
        Self {
            kind,
            message: format!("{}: {}", context.into(), err),
            source: Some(Box::new(err)),
        }
    }
}

impl QueryError {
    /// MySQL error code 1062 = ER_DUP_ENTRY.
    pub fn is_duplicate_key(&self) -> bool {
        self.code == 1062
    }

    /// MySQL error codes 1451/1452 = foreign key violations.
    pub fn is_foreign_key_violation(&self) -> bool {
        self.code == 1451 || self.code == 1452
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Network(e) => write!(f, "Network error: {}", e.message),
            Error::Timeout(e) => write!(
                f,
                "Timed out during {} after {:?}",
                match e.phase {
                    TimeoutPhase::Connect => "connect",
                    TimeoutPhase::Read => "read",
                    TimeoutPhase::Write => "write",
                },
                e.elapsed
            ),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Auth(e) => write!(f, "Authentication error ({}): {}", e.plugin, e.message),
            Error::State(e) => write!(f, "State error: {}", e.message),
            Error::Query(e) => {
                if e.sqlstate.is_empty() {
                    write!(f, "Query error {}: {}", e.code, e.message)
                } else {
                    write!(
                        f,
                        "Query error {} (SQLSTATE {}): {}",
                        e.code, e.sqlstate, e.message
                    )
                }
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Network(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sqlstate.is_empty() {
            write!(f, "{} ({})", self.message, self.code)
        } else {
            write!(f, "{} ({}, SQLSTATE {})", self.message, self.code, self.sqlstate)
        }
    }
}

impl From<NetworkError> for Error {
    fn from(err: NetworkError) -> Self {
        Error::Network(err)
    }
}

impl From<TimeoutError> for Error {
    fn from(err: TimeoutError) -> Self {
        Error::Timeout(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<AuthError> for Error {
    fn from(err: AuthError) -> Self {
        Error::Auth(err)
    }
}

impl From<StateError> for Error {
    fn from(err: StateError) -> Self {
        Error::State(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

/// Result type alias for sqldrift operations.
pub type Result<T> = std::result::Result<T, Error>;
