//! End-to-end tests against a scripted in-process server speaking the
//! MySQL wire protocol over loopback.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use sqldrift_core::{Error, Value};
use sqldrift_dispatch::DispatchConfig;
use sqldrift_mysql::protocol::{FrameHeader, MAX_PAYLOAD_SIZE, PayloadReader, PayloadWriter, writer};
use sqldrift_mysql::{
    auth, Client, ConnectionState, MySqlConfig, QueryEvent, QueryOutcome,
};

const SERVER_PASSWORD: &str = "secret";
const SEED: [u8; 20] = [
    1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20,
];

const CAP_PROTOCOL_41: u32 = 1 << 9;
const CAP_SECURE_CONNECTION: u32 = 1 << 15;
const CAP_PLUGIN_AUTH: u32 = 1 << 19;
const CAP_CONNECT_ATTRS: u32 = 1 << 20;
const CAP_LENENC_AUTH: u32 = 1 << 21;
const CAP_DEPRECATE_EOF: u32 = 1 << 24;

fn server_caps() -> u32 {
    CAP_PROTOCOL_41
        | CAP_SECURE_CONNECTION
        | CAP_PLUGIN_AUTH
        | CAP_CONNECT_ATTRS
        | CAP_LENENC_AUTH
}

fn write_frame(stream: &mut TcpStream, sequence_id: u8, payload: &[u8]) {
    let header = FrameHeader {
        payload_length: payload.len() as u32,
        sequence_id,
    };
    stream.write_all(&header.to_bytes()).unwrap();
    stream.write_all(payload).unwrap();
}

fn read_frame(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).ok()?;
    let header = FrameHeader::from_bytes(&header);
    let mut payload = vec![0u8; header.payload_length as usize];
    stream.read_exact(&mut payload).ok()?;
    Some((header.sequence_id, payload))
}

fn ok_payload(affected_rows: u64, last_insert_id: u64) -> Vec<u8> {
    let mut w = PayloadWriter::new();
    w.write_u8(0x00);
    w.write_lenenc_int(affected_rows);
    w.write_lenenc_int(last_insert_id);
    w.write_u16_le(0x0002);
    w.write_u16_le(0);
    w.into_bytes()
}

fn err_payload(code: u16, sqlstate: &str, message: &str) -> Vec<u8> {
    let mut w = PayloadWriter::new();
    w.write_u8(0xFF);
    w.write_u16_le(code);
    w.write_u8(b'#');
    w.write_bytes(sqlstate.as_bytes());
    w.write_bytes(message.as_bytes());
    w.into_bytes()
}

fn eof_payload() -> Vec<u8> {
    vec![0xFE, 0x00, 0x00, 0x02, 0x00]
}

/// Result-set terminator for DEPRECATE_EOF sessions: an OK packet with
/// an 0xFE marker, long enough not to read as a legacy EOF.
fn ok_terminator_payload() -> Vec<u8> {
    let mut w = PayloadWriter::new();
    w.write_u8(0xFE);
    w.write_lenenc_int(0);
    w.write_lenenc_int(0);
    w.write_u16_le(0x0002);
    w.write_u16_le(0);
    w.write_bytes(b"last row sent");
    w.into_bytes()
}

fn column_def_payload(name: &str, field_type: u8) -> Vec<u8> {
    let mut w = PayloadWriter::new();
    w.write_lenenc_str("def");
    w.write_lenenc_str("mock");
    w.write_lenenc_str("t");
    w.write_lenenc_str("t");
    w.write_lenenc_str(name);
    w.write_lenenc_str(name);
    w.write_lenenc_int(0x0c);
    w.write_u16_le(45);
    w.write_u32_le(20);
    w.write_u8(field_type);
    w.write_u16_le(0);
    w.write_u8(0);
    w.write_u16_le(0);
    w.into_bytes()
}

fn send_handshake(stream: &mut TcpStream, caps: u32) {
    let mut w = PayloadWriter::new();
    w.write_u8(10);
    w.write_null_string("8.0.0-mock");
    w.write_u32_le(1);
    w.write_bytes(&SEED[..8]);
    w.write_u8(0);
    w.write_u16_le((caps & 0xFFFF) as u16);
    w.write_u8(45);
    w.write_u16_le(0x0002);
    w.write_u16_le((caps >> 16) as u16);
    w.write_u8(21);
    w.write_zeros(10);
    w.write_bytes(&SEED[8..]);
    w.write_u8(0);
    w.write_null_string("mysql_native_password");
    write_frame(stream, 0, w.as_bytes());
}

/// Returns true when the client's scramble matches the server password.
fn check_auth(payload: &[u8]) -> bool {
    let mut reader = PayloadReader::new(payload);
    let _client_flags = reader.read_u32_le().unwrap();
    let _max_packet = reader.read_u32_le().unwrap();
    let _charset = reader.read_u8().unwrap();
    reader.skip(23);
    let _user = reader.read_null_string().unwrap();
    let scramble = reader.read_lenenc_string().unwrap_or_default();
    scramble == auth::native_password_scramble(SERVER_PASSWORD, &SEED)
}

/// Send a result set with one BIGINT column and `rows` ascending values.
fn send_int_rows(stream: &mut TcpStream, rows: u64, deprecate_eof: bool) {
    let mut seq = 1;
    write_frame(stream, seq, &[0x01]); // column count
    seq += 1;
    write_frame(stream, seq, &column_def_payload("n", 0x08));
    seq += 1;
    if !deprecate_eof {
        write_frame(stream, seq, &eof_payload());
        seq += 1;
    }
    for i in 0..rows {
        let mut w = PayloadWriter::new();
        w.write_lenenc_str(&i.to_string());
        write_frame(stream, seq, w.as_bytes());
        seq = seq.wrapping_add(1);
    }
    if deprecate_eof {
        write_frame(stream, seq, &ok_terminator_payload());
    } else {
        write_frame(stream, seq, &eof_payload());
    }
}

/// Send a single-row result set whose row payload spans multiple frames.
fn send_oversize_row(stream: &mut TcpStream) {
    let mut seq = 1;
    write_frame(stream, seq, &[0x01]);
    seq += 1;
    write_frame(stream, seq, &column_def_payload("payload", 0xFD));
    seq += 1;
    write_frame(stream, seq, &eof_payload());
    seq += 1;
    let mut w = PayloadWriter::new();
    w.write_lenenc_bytes(&vec![b'x'; MAX_PAYLOAD_SIZE]);
    // Payload exceeds one frame; encode_frames splits it.
    let (bytes, next_seq) = writer::encode_frames(w.as_bytes(), seq);
    stream.write_all(&bytes).unwrap();
    write_frame(stream, next_seq, &eof_payload());
}

fn handle_query(stream: &mut TcpStream, sql: &str, deprecate_eof: bool) {
    if sql == "SELECT 1" {
        send_int_rows(stream, 1, deprecate_eof);
    } else if let Some(count) = sql
        .strip_prefix("SELECT n FROM seq_")
        .and_then(|s| s.parse::<u64>().ok())
    {
        send_int_rows(stream, count, deprecate_eof);
    } else if sql == "SELECT big" {
        send_oversize_row(stream);
    } else if sql == "SELECT broken" {
        // Column count followed by a truncated column definition.
        write_frame(stream, 1, &[0x01]);
        write_frame(stream, 2, &[0x03, b'a']);
    } else if sql.starts_with("INSERT") {
        write_frame(stream, 1, &ok_payload(1, 42));
    } else {
        write_frame(
            stream,
            1,
            &err_payload(1054, "42S22", "Unknown column in field list"),
        );
    }
}

fn handle_connection(mut stream: TcpStream, caps: u32) {
    let deprecate_eof = caps & CAP_DEPRECATE_EOF != 0;
    send_handshake(&mut stream, caps);

    let Some((_, response)) = read_frame(&mut stream) else {
        return;
    };
    if check_auth(&response) {
        write_frame(&mut stream, 2, &ok_payload(0, 0));
    } else {
        write_frame(
            &mut stream,
            2,
            &err_payload(1045, "28000", "Access denied for user"),
        );
        return;
    }

    while let Some((_, payload)) = read_frame(&mut stream) {
        match payload.first() {
            Some(0x01) => return, // COM_QUIT
            Some(0x02) | Some(0x0E) => write_frame(&mut stream, 1, &ok_payload(0, 0)),
            Some(0x03) => {
                let sql = String::from_utf8_lossy(&payload[1..]).into_owned();
                handle_query(&mut stream, &sql, deprecate_eof);
            }
            _ => write_frame(&mut stream, 1, &err_payload(1047, "08S01", "Unknown command")),
        }
    }
}

/// Spawn a scripted server; each accepted connection gets its own thread.
fn spawn_server_with(caps: u32) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            thread::spawn(move || handle_connection(stream, caps));
        }
    });
    addr
}

fn spawn_server() -> SocketAddr {
    spawn_server_with(server_caps())
}

fn config_for(addr: SocketAddr) -> MySqlConfig {
    MySqlConfig::new(addr.ip().to_string(), "app")
        .port(addr.port())
        .password(SERVER_PASSWORD)
        .connect_timeout(Duration::from_secs(2))
        .read_timeout(Duration::from_secs(2))
}

fn connect(addr: SocketAddr) -> (Client, sqldrift_mysql::AsyncConnection) {
    let client = Client::new(DispatchConfig::new().workers(2));
    let conn = client
        .connect(config_for(addr))
        .wait()
        .unwrap()
        .expect("connect should succeed");
    (client, conn)
}

#[test]
fn connect_ping_and_close() {
    let addr = spawn_server();
    let (_client, conn) = connect(addr);
    assert_eq!(conn.state(), ConnectionState::Ready);
    assert!(!conn.is_busy());

    conn.ping().wait().unwrap().expect("ping");

    conn.close().wait().unwrap().expect("close");
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    // Closing again is a no-op.
    conn.close().wait().unwrap().expect("second close");
}

#[test]
fn wrong_password_is_an_auth_error() {
    let addr = spawn_server();
    let client = Client::new(DispatchConfig::new().workers(1));
    let result = client
        .connect(config_for(addr).password("nope"))
        .wait()
        .unwrap();
    match result {
        Err(Error::Auth(e)) => assert!(e.message.contains("1045"), "got: {}", e.message),
        other => panic!("expected auth error, got {other:?}"),
    }
}

#[test]
fn buffered_select_returns_rows() {
    let addr = spawn_server();
    let (_client, conn) = connect(addr);

    let outcome = conn.query("SELECT 1").wait().unwrap().expect("query");
    let rs = match outcome {
        QueryOutcome::Rows(rs) => rs,
        QueryOutcome::Ok(_) => panic!("expected rows"),
    };
    assert_eq!(rs.column_names(), vec!["n"]);
    assert_eq!(rs.rows.len(), 1);
    assert_eq!(rs.rows[0].get_by_name("n"), Some(&Value::BigInt(0)));
}

#[test]
fn insert_resolves_with_ok_summary() {
    let addr = spawn_server();
    let (_client, conn) = connect(addr);

    let outcome = conn
        .query("INSERT INTO t (a) VALUES (1)")
        .wait()
        .unwrap()
        .expect("insert");
    match outcome {
        QueryOutcome::Ok(ok) => {
            assert_eq!(ok.affected_rows, 1);
            assert_eq!(ok.last_insert_id, 42);
        }
        QueryOutcome::Rows(_) => panic!("expected OK summary"),
    }
}

#[test]
fn parameter_interpolation_round_trip() {
    let addr = spawn_server();
    let (_client, conn) = connect(addr);

    // The placeholder expands before the statement reaches the server.
    let outcome = conn
        .query_params("INSERT INTO t (a) VALUES (?)", vec![Value::Int(7)])
        .wait()
        .unwrap()
        .expect("insert");
    assert_eq!(outcome.affected_rows(), 1);
}

#[test]
fn server_error_leaves_connection_ready() {
    let addr = spawn_server();
    let (_client, conn) = connect(addr);

    let err = conn
        .query("SELECT bogus FROM nowhere")
        .wait()
        .unwrap()
        .expect_err("server should reject");
    match &err {
        Error::Query(q) => {
            assert_eq!(q.code, 1054);
            assert_eq!(q.sqlstate, "42S22");
        }
        other => panic!("expected query error, got {other:?}"),
    }
    assert!(!err.forces_disconnect());

    // Same connection keeps working.
    assert_eq!(conn.state(), ConnectionState::Ready);
    conn.ping().wait().unwrap().expect("ping after error");
}

#[test]
fn streaming_delivers_rows_then_summary() {
    let addr = spawn_server();
    let (_client, conn) = connect(addr);

    let mut stream = conn.query_streaming("SELECT n FROM seq_5");
    let mut rows = Vec::new();
    let mut saw_columns = false;
    while let Some(event) = stream.next_row() {
        match event {
            QueryEvent::Columns(cols) => {
                assert!(!saw_columns, "columns delivered once");
                assert!(rows.is_empty(), "columns precede rows");
                assert_eq!(cols[0].name, "n");
                saw_columns = true;
            }
            QueryEvent::Row(row) => rows.push(row.get_as::<i64>(0).unwrap()),
        }
    }
    assert!(saw_columns);
    assert_eq!(rows, vec![0, 1, 2, 3, 4]);

    let summary = stream.finish().unwrap().expect("summary");
    assert_eq!(summary.rows_scanned, 5);
    assert_eq!(summary.rows_delivered, 5);
    assert!(!summary.stopped_early);
}

#[test]
fn cancel_mid_stream_then_reuse_the_connection() {
    let addr = spawn_server();
    let (_client, conn) = connect(addr);

    let mut stream = conn.query_streaming("SELECT n FROM seq_1000");
    let mut delivered = 0;
    while let Some(event) = stream.next_row() {
        if matches!(event, QueryEvent::Row(_)) {
            delivered += 1;
            if delivered == 3 {
                stream.cancel();
            }
        }
    }
    let summary = stream.finish().unwrap().expect("summary");
    assert!(summary.stopped_early);
    assert_eq!(summary.rows_scanned, 1000, "remaining rows are drained");
    assert!(summary.rows_delivered < 1000);

    // The drain left the connection in step with the server.
    assert_eq!(conn.state(), ConnectionState::Ready);
    let outcome = conn.query("SELECT 1").wait().unwrap().expect("reuse");
    assert!(outcome.as_rows().is_some());
}

#[test]
fn second_operation_on_busy_connection_fails_fast() {
    let addr = spawn_server();
    let (_client, conn) = connect(addr);

    let mut stream = conn.query_streaming("SELECT n FROM seq_1000");
    // Wait until the worker picked the job up and produced a row, so the
    // operation is provably in flight.
    let first = stream.next_row();
    assert!(first.is_some());
    assert!(conn.is_busy());

    let err = conn
        .query("SELECT 1")
        .wait()
        .unwrap()
        .expect_err("connection is busy");
    assert!(matches!(err, Error::State(_)), "got {err:?}");
    // Close while busy is refused the same way.
    assert!(matches!(
        conn.close().wait().unwrap(),
        Err(Error::State(_))
    ));

    stream.cancel();
    let _ = stream.finish().unwrap().expect("summary");

    // Slot is free again.
    conn.query("SELECT 1").wait().unwrap().expect("after busy");
}

#[test]
fn connection_refused_is_a_recoverable_network_error() {
    // Bind to learn a free port, then close it before connecting.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let client = Client::new(DispatchConfig::new().workers(1));
    let result = client.connect(config_for(addr)).wait().unwrap();
    match result {
        Err(err @ Error::Network(_)) => assert!(err.is_recoverable()),
        other => panic!("expected network error, got {other:?}"),
    }
}

#[test]
fn silent_server_times_out_the_handshake() {
    // Accepts connections but never says anything.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let mut held = Vec::new();
        for stream in listener.incoming().flatten() {
            held.push(stream);
        }
    });

    let client = Client::new(DispatchConfig::new().workers(1));
    let config = config_for(addr).read_timeout(Duration::from_millis(200));
    let result = client.connect(config).wait().unwrap();
    match result {
        Err(err @ Error::Timeout(_)) => {
            assert!(err.forces_disconnect());
            assert!(err.is_recoverable());
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[test]
fn malformed_column_definition_disconnects() {
    let addr = spawn_server();
    let (_client, conn) = connect(addr);

    let err = conn
        .query("SELECT broken")
        .wait()
        .unwrap()
        .expect_err("truncated column definition");
    assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
    assert!(err.forces_disconnect());

    // The stream is desynchronized; the connection must not stay usable.
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    let err = conn
        .query("SELECT 1")
        .wait()
        .unwrap()
        .expect_err("dead connection refuses work");
    assert!(matches!(err, Error::State(_)), "got {err:?}");
}

#[test]
fn deprecate_eof_result_set_round_trip() {
    let addr = spawn_server_with(server_caps() | CAP_DEPRECATE_EOF);
    let (_client, conn) = connect(addr);

    // No EOF between column defs and rows; the terminator is an OK
    // packet with an 0xFE marker.
    let outcome = conn
        .query("SELECT n FROM seq_3")
        .wait()
        .unwrap()
        .expect("query");
    let rs = match outcome {
        QueryOutcome::Rows(rs) => rs,
        QueryOutcome::Ok(_) => panic!("expected rows"),
    };
    assert_eq!(rs.rows.len(), 3);
    assert_eq!(rs.rows[2].get_as::<i64>(0).unwrap(), 2);

    assert_eq!(conn.state(), ConnectionState::Ready);
    conn.ping().wait().unwrap().expect("ping after query");
}

#[test]
fn multi_frame_payload_reassembles() {
    let addr = spawn_server();
    let (_client, conn) = connect(addr);

    let outcome = conn.query("SELECT big").wait().unwrap().expect("query");
    let rs = match outcome {
        QueryOutcome::Rows(rs) => rs,
        QueryOutcome::Ok(_) => panic!("expected rows"),
    };
    assert_eq!(rs.rows.len(), 1);
    match rs.rows[0].get(0) {
        Some(Value::Text(s)) => {
            assert_eq!(s.len(), MAX_PAYLOAD_SIZE);
            assert!(s.bytes().all(|b| b == b'x'));
        }
        other => panic!("expected text field, got {other:?}"),
    }

    // The connection is still in step after the continued payload.
    conn.ping().wait().unwrap().expect("ping after big row");
}

#[test]
fn use_database_switches_and_acknowledges() {
    let addr = spawn_server();
    let (_client, conn) = connect(addr);
    conn.use_database("analytics")
        .wait()
        .unwrap()
        .expect("init db");
    conn.ping().wait().unwrap().expect("ping");
}
