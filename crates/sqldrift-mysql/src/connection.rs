//! Blocking MySQL connection: socket lifecycle, handshake, auth, and the
//! framed read/write path the executor builds on.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Instant;

use sqldrift_core::{
    AuthError, Error, NetworkError, NetworkErrorKind, Result, TimeoutError, TimeoutPhase,
};
use tracing::{debug, trace, warn};

use crate::auth::{self, plugins, sha2_response};
use crate::config::MySqlConfig;
use crate::protocol::{
    Command, ErrPacket, Frame, HandshakePacket, OkPacket, PacketType, PayloadWriter, capabilities,
    decode_frame,
    writer::{encode_command, encode_frames},
};

/// Lifecycle of a connection.
///
/// ```text
/// Disconnected -> Connecting -> Authenticating -> Ready <-> Querying
///       ^                                           |
///       +--------------- close / fatal error -------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Querying,
}

/// Facts the server reported during the handshake.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub version: String,
    pub connection_id: u32,
    pub capabilities: u32,
}

/// A single blocking connection to a MySQL server.
///
/// One operation at a time: every request/response exchange runs to
/// completion before the next may start. The async layer in
/// [`crate::client`] enforces that across threads.
pub struct Connection {
    stream: Option<TcpStream>,
    state: ConnectionState,
    config: MySqlConfig,
    server: Option<ServerInfo>,
    /// Capabilities negotiated for this session (client ∩ server)
    negotiated: u32,
    sequence_id: u8,
    /// Bytes read off the socket but not yet decoded into frames
    recv_buf: Vec<u8>,
    status_flags: u16,
}

impl Connection {
    /// Open a connection: resolve, connect, handshake, authenticate.
    ///
    /// On success the connection is `Ready`. Any failure tears the socket
    /// down; there is no half-connected state to observe.
    pub fn open(config: MySqlConfig) -> Result<Self> {
        let mut conn = Self {
            stream: None,
            state: ConnectionState::Disconnected,
            config,
            server: None,
            negotiated: 0,
            sequence_id: 0,
            recv_buf: Vec::new(),
            status_flags: 0,
        };
        match conn.connect_and_authenticate() {
            Ok(()) => Ok(conn),
            Err(err) => {
                conn.teardown();
                Err(err)
            }
        }
    }

    fn connect_and_authenticate(&mut self) -> Result<()> {
        self.state = ConnectionState::Connecting;
        let address = self.config.address();
        debug!(address = %address, "connecting");

        let addrs: Vec<_> = address
            .to_socket_addrs()
            .map_err(|err| {
                Error::Network(NetworkError {
                    kind: NetworkErrorKind::Dns,
                    message: format!("failed to resolve {address}: {err}"),
                    source: Some(Box::new(err)),
                })
            })?
            .collect();

        let started = Instant::now();
        let mut last_err: Option<std::io::Error> = None;
        let mut stream = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(err) => last_err = Some(err),
            }
        }
        let stream = match stream {
            Some(s) => s,
            None => {
                let err = last_err.unwrap_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no addresses")
                });
                if err.kind() == std::io::ErrorKind::TimedOut
                    || err.kind() == std::io::ErrorKind::WouldBlock
                {
                    return Err(Error::Timeout(TimeoutError {
                        phase: TimeoutPhase::Connect,
                        elapsed: started.elapsed(),
                    }));
                }
                return Err(Error::Network(NetworkError::from_io(
                    format!("connect to {address}"),
                    err,
                )));
            }
        };

        stream
            .set_read_timeout(Some(self.config.read_timeout))
            .and_then(|()| stream.set_write_timeout(Some(self.config.write_timeout)))
            .and_then(|()| stream.set_nodelay(true))
            .map_err(|err| Error::Network(NetworkError::from_io("socket setup", err)))?;
        self.stream = Some(stream);

        let handshake_payload = self.read_payload()?;
        if PacketType::classify(handshake_payload[0], handshake_payload.len()) == PacketType::Error
        {
            // Server refused before auth (too many connections, host blocked)
            let err = ErrPacket::parse(&handshake_payload)
                .ok_or_else(|| Error::protocol("malformed pre-auth error packet"))?;
            return Err(Error::Auth(AuthError {
                plugin: String::new(),
                message: format!("server refused connection ({}): {}", err.error_code, err.error_message),
            }));
        }
        let handshake = HandshakePacket::parse(&handshake_payload).ok_or_else(|| {
            Error::Protocol(sqldrift_core::ProtocolError {
                message: "malformed handshake packet".to_string(),
                raw: Some(handshake_payload.clone()),
            })
        })?;
        debug!(
            server_version = %handshake.server_version,
            connection_id = handshake.connection_id,
            plugin = %handshake.auth_plugin,
            "handshake received"
        );

        self.state = ConnectionState::Authenticating;
        self.negotiated = self.config.capability_flags(handshake.capabilities);
        self.server = Some(ServerInfo {
            version: handshake.server_version.clone(),
            connection_id: handshake.connection_id,
            capabilities: handshake.capabilities,
        });
        self.status_flags = handshake.status_flags;

        self.send_handshake_response(&handshake)?;
        self.finish_authentication(handshake.auth_plugin)?;

        self.state = ConnectionState::Ready;
        debug!("connection ready");
        Ok(())
    }

    fn send_handshake_response(&mut self, handshake: &HandshakePacket) -> Result<()> {
        let plugin = handshake.auth_plugin.as_str();
        let scramble = auth::scramble_for_plugin(plugin, &self.config.password, &handshake.auth_data)
            .ok_or_else(|| {
                Error::Auth(AuthError {
                    plugin: plugin.to_string(),
                    message: "server requested an unsupported authentication plugin".to_string(),
                })
            })?;

        let mut w = PayloadWriter::new();
        w.write_u32_le(self.negotiated);
        w.write_u32_le(self.config.max_allowed_packet);
        w.write_u8(self.config.charset);
        w.write_zeros(23);
        w.write_null_string(&self.config.username);

        if self.negotiated & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            w.write_lenenc_bytes(&scramble);
        } else {
            w.write_u8(scramble.len() as u8);
            w.write_bytes(&scramble);
        }

        if self.negotiated & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
            if let Some(db) = &self.config.database {
                w.write_null_string(db);
            }
        }
        if self.negotiated & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            w.write_null_string(plugin);
        }
        if self.negotiated & capabilities::CLIENT_CONNECT_ATTRS != 0 {
            let mut attrs = PayloadWriter::new();
            for (key, value) in &self.config.attributes {
                attrs.write_lenenc_str(key);
                attrs.write_lenenc_str(value);
            }
            w.write_lenenc_bytes(attrs.as_bytes());
        }

        self.write_payload(&w.into_bytes())
    }

    /// Drive the post-response auth exchange to OK or failure.
    fn finish_authentication(&mut self, mut plugin: String) -> Result<()> {
        loop {
            let payload = self.read_payload()?;
            match payload[0] {
                0x00 => {
                    if let Some(ok) = OkPacket::parse(&payload) {
                        self.status_flags = ok.status_flags;
                    }
                    return Ok(());
                }
                0xFF => {
                    let err = ErrPacket::parse(&payload)
                        .ok_or_else(|| Error::protocol("malformed auth error packet"))?;
                    return Err(Error::Auth(AuthError {
                        plugin,
                        message: format!("({}) {}", err.error_code, err.error_message),
                    }));
                }
                // Auth switch request: new plugin name and seed.
                0xFE => {
                    let mut reader = crate::protocol::PayloadReader::new(&payload[1..]);
                    let next_plugin = reader
                        .read_null_string()
                        .ok_or_else(|| Error::protocol("malformed auth switch packet"))?;
                    let seed = reader.read_bytes(reader.remaining()).unwrap_or(&[]).to_vec();
                    debug!(plugin = %next_plugin, "auth switch requested");
                    let scramble =
                        auth::scramble_for_plugin(&next_plugin, &self.config.password, &seed)
                            .ok_or_else(|| {
                                Error::Auth(AuthError {
                                    plugin: next_plugin.clone(),
                                    message: "auth switch to an unsupported plugin".to_string(),
                                })
                            })?;
                    plugin = next_plugin;
                    self.write_payload(&scramble)?;
                }
                // caching_sha2 "more data"
                0x01 if payload.len() >= 2 => match payload[1] {
                    sha2_response::FAST_AUTH_SUCCESS => {
                        trace!("sha2 fast auth accepted");
                        // OK packet follows
                    }
                    sha2_response::PERFORM_FULL_AUTH => {
                        return Err(Error::Auth(AuthError {
                            plugin: plugins::CACHING_SHA2_PASSWORD.to_string(),
                            message:
                                "server requires full SHA-2 authentication, which needs TLS"
                                    .to_string(),
                        }));
                    }
                    other => {
                        return Err(Error::protocol(format!(
                            "unexpected auth continuation byte 0x{other:02X}"
                        )));
                    }
                },
                other => {
                    return Err(Error::protocol(format!(
                        "unexpected packet 0x{other:02X} during authentication"
                    )));
                }
            }
        }
    }

    /// Check liveness with COM_PING.
    pub fn ping(&mut self) -> Result<()> {
        self.send_command(Command::Ping, &[])?;
        let payload = self.read_payload()?;
        self.expect_ok(&payload)?;
        trace!("ping ok");
        Ok(())
    }

    /// Switch the default database with COM_INIT_DB.
    pub fn use_database(&mut self, database: &str) -> Result<()> {
        self.send_command(Command::InitDb, database.as_bytes())?;
        let payload = self.read_payload()?;
        self.expect_ok(&payload)?;
        self.config.database = Some(database.to_string());
        Ok(())
    }

    /// Close the connection. Idempotent: closing a closed connection is a
    /// no-op, and send failures during the goodbye are ignored.
    pub fn close(&mut self) {
        if let Some(stream) = &mut self.stream {
            let quit = encode_command(Command::Quit, &[]);
            if let Err(err) = stream.write_all(&quit) {
                trace!(error = %err, "COM_QUIT send failed during close");
            }
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.teardown();
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server.as_ref()
    }

    /// Thread id the server assigned to this session.
    pub fn connection_id(&self) -> Option<u32> {
        self.server.as_ref().map(|s| s.connection_id)
    }

    pub fn server_version(&self) -> Option<&str> {
        self.server.as_ref().map(|s| s.version.as_str())
    }

    /// Status flags from the most recent OK/EOF packet.
    pub fn status_flags(&self) -> u16 {
        self.status_flags
    }

    pub(crate) fn set_status_flags(&mut self, flags: u16) {
        self.status_flags = flags;
    }

    pub(crate) fn has_capability(&self, flag: u32) -> bool {
        self.negotiated & flag != 0
    }

    pub(crate) fn begin_query(&mut self) -> Result<()> {
        if self.state != ConnectionState::Ready {
            return Err(Error::state(format!(
                "connection is {:?}, expected Ready",
                self.state
            )));
        }
        self.state = ConnectionState::Querying;
        Ok(())
    }

    pub(crate) fn end_query(&mut self) {
        if self.state == ConnectionState::Querying {
            self.state = ConnectionState::Ready;
        }
    }

    /// Send a command packet, resetting the sequence counter.
    pub(crate) fn send_command(&mut self, command: Command, arg: &[u8]) -> Result<()> {
        if self.state != ConnectionState::Ready && self.state != ConnectionState::Querying {
            return Err(Error::state(format!(
                "cannot send command on a {:?} connection",
                self.state
            )));
        }
        self.sequence_id = 0;
        let mut payload = Vec::with_capacity(1 + arg.len());
        payload.push(command as u8);
        payload.extend_from_slice(arg);
        self.write_payload(&payload)
    }

    /// Parse an OK payload, or surface an ERR as a query error.
    pub(crate) fn expect_ok(&mut self, payload: &[u8]) -> Result<OkPacket> {
        match PacketType::classify(payload[0], payload.len()) {
            PacketType::Ok => {
                let ok = OkPacket::parse(payload).ok_or_else(|| {
                    Error::Protocol(sqldrift_core::ProtocolError {
                        message: "malformed OK packet".to_string(),
                        raw: Some(payload.to_vec()),
                    })
                })?;
                self.status_flags = ok.status_flags;
                Ok(ok)
            }
            PacketType::Error => Err(self.server_error(payload)),
            _ => {
                self.teardown();
                Err(Error::Protocol(sqldrift_core::ProtocolError {
                    message: format!("expected OK packet, got first byte 0x{:02X}", payload[0]),
                    raw: Some(payload.to_vec()),
                }))
            }
        }
    }

    /// Turn an ERR payload into a query error. The protocol exchange is
    /// intact, so the connection stays usable.
    pub(crate) fn server_error(&mut self, payload: &[u8]) -> Error {
        match ErrPacket::parse(payload) {
            Some(err) => Error::Query(sqldrift_core::QueryError {
                code: err.error_code,
                sqlstate: err.sql_state,
                message: err.error_message,
            }),
            None => {
                self.teardown();
                Error::Protocol(sqldrift_core::ProtocolError {
                    message: "malformed error packet".to_string(),
                    raw: Some(payload.to_vec()),
                })
            }
        }
    }

    /// Read one logical payload, reassembling continuation frames.
    ///
    /// Never returns an empty payload; an empty frame outside a
    /// continuation is a protocol violation.
    pub(crate) fn read_payload(&mut self) -> Result<Vec<u8>> {
        let first = self.read_frame()?;
        if !first.is_continued() {
            if first.payload.is_empty() {
                self.teardown();
                return Err(Error::protocol("server sent an empty packet"));
            }
            return Ok(first.payload);
        }
        let mut payload = first.payload;
        loop {
            let next = self.read_frame()?;
            let more = next.is_continued();
            payload.extend_from_slice(&next.payload);
            if !more {
                return Ok(payload);
            }
        }
    }

    /// Write one logical payload, splitting into frames as needed.
    pub(crate) fn write_payload(&mut self, payload: &[u8]) -> Result<()> {
        let (bytes, next_seq) = encode_frames(payload, self.sequence_id);
        self.sequence_id = next_seq;
        let Some(stream) = &mut self.stream else {
            return Err(self.disconnected_error("write"));
        };
        if let Err(err) = stream.write_all(&bytes) {
            return Err(self.io_failure(TimeoutPhase::Write, "write", err));
        }
        Ok(())
    }

    /// Pull the next frame out of the receive buffer, reading from the
    /// socket as needed.
    fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some((frame, used)) = decode_frame(&self.recv_buf) {
                self.recv_buf.drain(..used);
                if frame.sequence_id != self.sequence_id {
                    warn!(
                        expected = self.sequence_id,
                        got = frame.sequence_id,
                        "out-of-order sequence id"
                    );
                    self.teardown();
                    return Err(Error::protocol(format!(
                        "out-of-order packet: expected sequence {}, got {}",
                        self.sequence_id, frame.sequence_id
                    )));
                }
                self.sequence_id = frame.sequence_id.wrapping_add(1);
                return Ok(frame);
            }

            let Some(stream) = &mut self.stream else {
                return Err(self.disconnected_error("read"));
            };
            let mut chunk = [0u8; 8192];
            match stream.read(&mut chunk) {
                Ok(0) => {
                    self.teardown();
                    return Err(Error::Network(NetworkError {
                        kind: NetworkErrorKind::Disconnected,
                        message: "server closed the connection".to_string(),
                        source: None,
                    }));
                }
                Ok(n) => self.recv_buf.extend_from_slice(&chunk[..n]),
                Err(err) => return Err(self.io_failure(TimeoutPhase::Read, "read", err)),
            }
        }
    }

    /// Classify an I/O failure and force the connection down.
    fn io_failure(&mut self, phase: TimeoutPhase, context: &str, err: std::io::Error) -> Error {
        let timed_out = matches!(
            err.kind(),
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
        );
        self.teardown();
        if timed_out {
            let elapsed = match phase {
                TimeoutPhase::Read => self.config.read_timeout,
                TimeoutPhase::Write => self.config.write_timeout,
                TimeoutPhase::Connect => self.config.connect_timeout,
            };
            Error::Timeout(TimeoutError { phase, elapsed })
        } else {
            Error::Network(NetworkError::from_io(context, err))
        }
    }

    fn disconnected_error(&self, context: &str) -> Error {
        Error::Network(NetworkError {
            kind: NetworkErrorKind::Disconnected,
            message: format!("{context} on a disconnected connection"),
            source: None,
        })
    }

    /// Drop the socket and force Disconnected. Idempotent.
    pub(crate) fn teardown(&mut self) {
        self.stream = None;
        self.state = ConnectionState::Disconnected;
        self.recv_buf.clear();
        self.sequence_id = 0;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.stream.is_some() {
            self.close();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("address", &self.config.address())
            .field(
                "connection_id",
                &self.server.as_ref().map(|s| s.connection_id),
            )
            .finish_non_exhaustive()
    }
}
