//! Connection configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::protocol::{capabilities, charset};

/// Settings for opening a MySQL connection.
///
/// Built with chained setters:
///
/// ```
/// use sqldrift_mysql::MySqlConfig;
///
/// let config = MySqlConfig::new("db.example.com", "app")
///     .password("secret")
///     .database("orders")
///     .connect_timeout(std::time::Duration::from_secs(5));
/// assert_eq!(config.port, 3306);
/// ```
#[derive(Debug, Clone)]
pub struct MySqlConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Default database to select during the handshake
    pub database: Option<String>,
    pub charset: u8,
    pub connect_timeout: Duration,
    /// Per-read socket timeout; a blocked read past this fails the
    /// operation and drops the connection
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Key/value attributes reported to the server at connect time
    pub attributes: BTreeMap<String, String>,
    pub max_allowed_packet: u32,
}

impl MySqlConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert("_client_name".to_string(), "sqldrift".to_string());
        attributes.insert(
            "_client_version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        Self {
            host: host.into(),
            port: 3306,
            username: username.into(),
            password: String::new(),
            database: None,
            charset: charset::DEFAULT_CHARSET,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            attributes,
            max_allowed_packet: 16 * 1024 * 1024,
        }
    }

    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    #[must_use]
    pub fn charset(mut self, charset: u8) -> Self {
        self.charset = charset;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    #[must_use]
    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Capability flags to request, given what the server advertised.
    pub fn capability_flags(&self, server_caps: u32) -> u32 {
        let mut flags = capabilities::DEFAULT_CLIENT_FLAGS;
        if self.database.is_some() {
            flags |= capabilities::CLIENT_CONNECT_WITH_DB;
        }
        if !self.attributes.is_empty() {
            flags |= capabilities::CLIENT_CONNECT_ATTRS;
        }
        if server_caps & capabilities::CLIENT_DEPRECATE_EOF != 0 {
            flags |= capabilities::CLIENT_DEPRECATE_EOF;
        }
        flags & (server_caps | capabilities::CLIENT_CONNECT_WITH_DB | capabilities::CLIENT_CONNECT_ATTRS)
    }

    /// host:port for `ToSocketAddrs`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
