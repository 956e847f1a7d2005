//! MySQL wire protocol: framing, packet classification, packet payloads.
//!
//! Every packet on the wire is a frame: a 4-byte header (3-byte
//! little-endian payload length, 1-byte sequence number) followed by the
//! payload. Payloads of 2^24 - 1 bytes continue in the next frame; frame
//! reassembly lives in the connection's read path.
//!
//! Payload shape depends on the protocol phase, so classification takes
//! the phase into account: a 0xFE lead byte is an EOF packet only while a
//! result set is being read and only when the payload is short.

pub mod reader;
pub mod writer;

pub use reader::PayloadReader;
pub use writer::PayloadWriter;

/// Maximum payload carried by a single frame (2^24 - 1 bytes).
pub const MAX_PAYLOAD_SIZE: usize = 0xFF_FF_FF;

/// Client/server capability flags.
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Capabilities this client asks for before intersecting with the
    /// server's advertised set.
    pub const DEFAULT_CLIENT_FLAGS: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;
}

/// Command codes sent as the first payload byte of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Close the connection
    Quit = 0x01,
    /// Switch default database
    InitDb = 0x02,
    /// Text protocol query
    Query = 0x03,
    /// Liveness check
    Ping = 0x0E,
}

/// Server status flags carried by OK and EOF packets.
#[allow(dead_code)]
pub mod server_status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_LAST_ROW_SENT: u16 = 0x0080;
    pub const SERVER_SESSION_STATE_CHANGED: u16 = 0x4000;
}

/// Character set codes used in the handshake.
#[allow(dead_code)]
pub mod charset {
    pub const LATIN1_SWEDISH_CI: u8 = 8;
    pub const UTF8_GENERAL_CI: u8 = 33;
    pub const BINARY: u8 = 63;
    pub const UTF8MB4_GENERAL_CI: u8 = 45;
    pub const UTF8MB4_0900_AI_CI: u8 = 255;

    pub const DEFAULT_CHARSET: u8 = UTF8MB4_0900_AI_CI;
}

/// A frame header.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Payload length (3 bytes, max 16MB - 1)
    pub payload_length: u32,
    /// Sequence number (wraps at 255)
    pub sequence_id: u8,
}

impl FrameHeader {
    /// Header size in bytes.
    pub const SIZE: usize = 4;

    /// Parse a header from its 4 wire bytes.
    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        let payload_length =
            u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16);
        Self {
            payload_length,
            sequence_id: bytes[3],
        }
    }

    /// Encode the header to 4 wire bytes.
    pub fn to_bytes(self) -> [u8; 4] {
        [
            (self.payload_length & 0xFF) as u8,
            ((self.payload_length >> 8) & 0xFF) as u8,
            ((self.payload_length >> 16) & 0xFF) as u8,
            self.sequence_id,
        ]
    }
}

/// One decoded frame: sequence id plus raw payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub sequence_id: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// True when this frame's payload continues in the next frame.
    pub fn is_continued(&self) -> bool {
        self.payload.len() == MAX_PAYLOAD_SIZE
    }
}

/// Pull one complete frame off the front of `buf`.
///
/// Returns `None` when the buffer does not yet hold the whole frame; that
/// is a read-more signal, not an error. On success the second element is
/// the number of bytes consumed. Pure: the buffer is never mutated.
pub fn decode_frame(buf: &[u8]) -> Option<(Frame, usize)> {
    if buf.len() < FrameHeader::SIZE {
        return None;
    }
    let mut header_bytes = [0u8; 4];
    header_bytes.copy_from_slice(&buf[..FrameHeader::SIZE]);
    let header = FrameHeader::from_bytes(&header_bytes);
    let total = FrameHeader::SIZE + header.payload_length as usize;
    if buf.len() < total {
        return None;
    }
    let frame = Frame {
        sequence_id: header.sequence_id,
        payload: buf[FrameHeader::SIZE..total].to_vec(),
    };
    Some((frame, total))
}

/// Classification of a server payload by its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// OK packet (0x00)
    Ok,
    /// Error packet (0xFF)
    Error,
    /// EOF packet (0xFE with payload < 9 bytes)
    Eof,
    /// LOCAL INFILE request (0xFB)
    LocalInfile,
    /// Anything else: column count, column definition, row data
    Data,
}

impl PacketType {
    /// Classify a payload from its first byte and total length.
    ///
    /// A long 0xFE payload is a row whose first field happens to start
    /// with a lenenc 8-byte integer marker, not an EOF.
    pub fn classify(first_byte: u8, payload_len: usize) -> Self {
        match first_byte {
            0x00 => PacketType::Ok,
            0xFF => PacketType::Error,
            0xFE if payload_len < 9 => PacketType::Eof,
            0xFB => PacketType::LocalInfile,
            _ => PacketType::Data,
        }
    }
}

/// Parsed OK packet.
#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    /// Human-readable info string, often empty
    pub info: String,
}

impl OkPacket {
    /// Parse an OK payload (protocol 4.1+), marker byte included.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut reader = PayloadReader::new(payload);
        if reader.peek() == Some(0x00) || reader.peek() == Some(0xFE) {
            reader.skip(1);
        }
        let affected_rows = reader.read_lenenc_int()?;
        let last_insert_id = reader.read_lenenc_int()?;
        let status_flags = reader.read_u16_le()?;
        let warnings = reader.read_u16_le()?;
        let info = reader.read_rest_string();
        Some(Self {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
        })
    }
}

/// Parsed ERR packet.
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub error_code: u16,
    /// Five-character SQLSTATE; empty when the server omitted the marker
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    /// Parse an ERR payload (protocol 4.1+), 0xFF marker included.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut reader = PayloadReader::new(payload);
        if reader.peek() == Some(0xFF) {
            reader.skip(1);
        }
        let error_code = reader.read_u16_le()?;
        let sql_state = if reader.peek() == Some(b'#') {
            reader.skip(1);
            reader.read_string(5)?
        } else {
            String::new()
        };
        let error_message = reader.read_rest_string();
        Some(Self {
            error_code,
            sql_state,
            error_message,
        })
    }
}

/// Parsed EOF packet (pre-DEPRECATE_EOF servers).
#[derive(Debug, Clone, Copy)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

impl EofPacket {
    /// Parse an EOF payload, 0xFE marker included.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut reader = PayloadReader::new(payload);
        if reader.peek() == Some(0xFE) {
            reader.skip(1);
        }
        let warnings = reader.read_u16_le()?;
        let status_flags = reader.read_u16_le()?;
        Some(Self {
            warnings,
            status_flags,
        })
    }
}

/// Parsed protocol-v10 handshake initiation packet.
#[derive(Debug, Clone)]
pub struct HandshakePacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Server capability flags (lower and upper halves combined)
    pub capabilities: u32,
    pub charset: u8,
    pub status_flags: u16,
    /// Authentication plugin advertised by the server
    pub auth_plugin: String,
    /// Scramble bytes (part 1 + part 2, trailing NUL stripped)
    pub auth_data: Vec<u8>,
}

impl HandshakePacket {
    /// Parse the server's handshake initiation payload.
    ///
    /// Only protocol version 10 is supported; anything else is a `None`
    /// the caller reports as a protocol error.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut reader = PayloadReader::new(payload);

        let protocol_version = reader.read_u8()?;
        if protocol_version != 10 {
            return None;
        }

        let server_version = reader.read_null_string()?;
        let connection_id = reader.read_u32_le()?;

        // Scramble part 1 (8 bytes) then a filler byte
        let auth_data_1 = reader.read_bytes(8)?;
        reader.skip(1);

        let caps_lower = reader.read_u16_le()?;
        let charset = reader.read_u8().unwrap_or(charset::DEFAULT_CHARSET);
        let status_flags = reader.read_u16_le().unwrap_or(0);
        let caps_upper = reader.read_u16_le().unwrap_or(0);
        let caps = u32::from(caps_lower) | (u32::from(caps_upper) << 16);

        let auth_data_len = if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            reader.read_u8().unwrap_or(0) as usize
        } else {
            0
        };

        // Reserved
        reader.skip(10);

        let mut auth_data = auth_data_1.to_vec();
        if caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            let len2 = if auth_data_len > 8 { auth_data_len - 8 } else { 13 };
            if let Some(part2) = reader.read_bytes(len2) {
                let trimmed = if part2.last() == Some(&0) {
                    &part2[..part2.len() - 1]
                } else {
                    part2
                };
                auth_data.extend_from_slice(trimmed);
            }
        }

        let auth_plugin = if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            reader.read_null_string().unwrap_or_default()
        } else {
            crate::auth::plugins::MYSQL_NATIVE_PASSWORD.to_string()
        };

        Some(Self {
            protocol_version,
            server_version,
            connection_id,
            capabilities: caps,
            charset,
            status_flags,
            auth_plugin,
            auth_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header_round_trip() {
        let header = FrameHeader {
            payload_length: 0x0012_3456,
            sequence_id: 7,
        };
        let parsed = FrameHeader::from_bytes(&header.to_bytes());
        assert_eq!(parsed.payload_length, 0x0012_3456);
        assert_eq!(parsed.sequence_id, 7);
    }

    #[test]
    fn decode_frame_needs_full_header_and_payload() {
        assert!(decode_frame(&[0x05, 0x00]).is_none());
        // Header claims 5 bytes, only 3 present: read-more signal.
        assert!(decode_frame(&[0x05, 0x00, 0x00, 0x01, b'h', b'e', b'l']).is_none());

        let (frame, used) = decode_frame(&[0x05, 0x00, 0x00, 0x01, b'h', b'e', b'l', b'l', b'o'])
            .expect("complete frame");
        assert_eq!(frame.sequence_id, 1);
        assert_eq!(frame.payload, b"hello");
        assert_eq!(used, 9);
        assert!(!frame.is_continued());
    }

    #[test]
    fn decode_frame_leaves_trailing_bytes() {
        let mut buf = vec![0x01, 0x00, 0x00, 0x00, 0xAB];
        buf.extend_from_slice(&[0x02, 0x00, 0x00, 0x01, 0x01, 0x02]);
        let (first, used) = decode_frame(&buf).expect("first frame");
        assert_eq!(first.payload, vec![0xAB]);
        let (second, used2) = decode_frame(&buf[used..]).expect("second frame");
        assert_eq!(second.payload, vec![0x01, 0x02]);
        assert_eq!(used + used2, buf.len());
    }

    #[test]
    fn packet_classification() {
        assert_eq!(PacketType::classify(0x00, 10), PacketType::Ok);
        assert_eq!(PacketType::classify(0xFF, 10), PacketType::Error);
        assert_eq!(PacketType::classify(0xFE, 5), PacketType::Eof);
        assert_eq!(PacketType::classify(0xFE, 100), PacketType::Data);
        assert_eq!(PacketType::classify(0xFB, 10), PacketType::LocalInfile);
        assert_eq!(PacketType::classify(0x03, 10), PacketType::Data);
    }

    #[test]
    fn ok_packet_round_trip() {
        let mut writer = PayloadWriter::new();
        writer.write_u8(0x00);
        writer.write_lenenc_int(3);
        writer.write_lenenc_int(42);
        writer.write_u16_le(0x0002);
        writer.write_u16_le(1);
        writer.write_bytes(b"done");

        let ok = OkPacket::parse(writer.as_bytes()).expect("ok packet");
        assert_eq!(ok.affected_rows, 3);
        assert_eq!(ok.last_insert_id, 42);
        assert_eq!(ok.status_flags, 2);
        assert_eq!(ok.warnings, 1);
        assert_eq!(ok.info, "done");
    }

    #[test]
    fn err_packet_round_trip() {
        let mut writer = PayloadWriter::new();
        writer.write_u8(0xFF);
        writer.write_u16_le(1045);
        writer.write_u8(b'#');
        writer.write_bytes(b"28000");
        writer.write_bytes(b"Access denied");

        let err = ErrPacket::parse(writer.as_bytes()).expect("err packet");
        assert_eq!(err.error_code, 1045);
        assert_eq!(err.sql_state, "28000");
        assert_eq!(err.error_message, "Access denied");
    }

    #[test]
    fn err_packet_without_sqlstate() {
        let mut writer = PayloadWriter::new();
        writer.write_u8(0xFF);
        writer.write_u16_le(2013);
        writer.write_bytes(b"Lost connection");

        let err = ErrPacket::parse(writer.as_bytes()).expect("err packet");
        assert_eq!(err.error_code, 2013);
        assert!(err.sql_state.is_empty());
    }

    #[test]
    fn eof_packet_round_trip() {
        let eof = EofPacket::parse(&[0xFE, 0x01, 0x00, 0x02, 0x00]).expect("eof packet");
        assert_eq!(eof.warnings, 1);
        assert_eq!(eof.status_flags, 2);
    }

    #[test]
    fn truncated_ok_packet_is_rejected() {
        // Marker plus one lenenc int, missing the rest.
        assert!(OkPacket::parse(&[0x00, 0x01]).is_none());
    }

    #[test]
    fn handshake_v10_parse() {
        let mut writer = PayloadWriter::new();
        writer.write_u8(10);
        writer.write_null_string("8.0.99-test");
        writer.write_u32_le(99);
        writer.write_bytes(&[1, 2, 3, 4, 5, 6, 7, 8]); // scramble part 1
        writer.write_u8(0); // filler
        let caps = capabilities::CLIENT_PROTOCOL_41
            | capabilities::CLIENT_SECURE_CONNECTION
            | capabilities::CLIENT_PLUGIN_AUTH;
        writer.write_u16_le((caps & 0xFFFF) as u16);
        writer.write_u8(charset::UTF8MB4_GENERAL_CI);
        writer.write_u16_le(0x0002);
        writer.write_u16_le((caps >> 16) as u16);
        writer.write_u8(21); // auth data length
        writer.write_zeros(10); // reserved
        writer.write_bytes(&[9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20]);
        writer.write_u8(0); // trailing NUL of scramble part 2
        writer.write_null_string("mysql_native_password");

        let hs = HandshakePacket::parse(writer.as_bytes()).expect("handshake");
        assert_eq!(hs.protocol_version, 10);
        assert_eq!(hs.server_version, "8.0.99-test");
        assert_eq!(hs.connection_id, 99);
        assert_eq!(hs.capabilities, caps);
        assert_eq!(hs.auth_plugin, "mysql_native_password");
        assert_eq!(hs.auth_data.len(), 20);
        assert_eq!(hs.auth_data[..8], [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn handshake_rejects_other_protocol_versions() {
        assert!(HandshakePacket::parse(&[9, 0]).is_none());
    }
}
