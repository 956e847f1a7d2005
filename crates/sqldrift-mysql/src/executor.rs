//! Text-protocol query execution over a [`Connection`].
//!
//! Two consumption modes share one wire loop: buffered execution
//! collects every row into a [`ResultSet`], streaming execution hands
//! each row to a [`RowSink`] as it is decoded. A sink that stops early
//! does not get to abandon the exchange; the remaining rows are drained
//! so the connection comes back `Ready`.

use std::sync::Arc;

use sqldrift_core::{ColumnInfo, Error, Result, Row, Value};
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::protocol::{
    Command, EofPacket, OkPacket, PacketType, PayloadReader, capabilities, server_status,
};
use crate::types::{ColumnDef, decode_text_value, interpolate_params};

/// What a sink wants after seeing a row or the column list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFlow {
    Continue,
    /// Stop delivering rows; the executor drains the rest off the wire
    Stop,
}

/// Receives result-set data as it is decoded.
pub trait RowSink {
    /// Called once, before any row, with the column definitions.
    fn on_columns(&mut self, columns: &[ColumnDef]) -> SinkFlow;

    /// Called per row, in wire order.
    fn on_row(&mut self, row: Row) -> SinkFlow;
}

/// Summary of a statement that returned no rows.
#[derive(Debug, Clone, Default)]
pub struct OkSummary {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub warnings: u16,
    pub info: String,
}

impl From<OkPacket> for OkSummary {
    fn from(ok: OkPacket) -> Self {
        Self {
            affected_rows: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
            warnings: ok.warnings,
            info: ok.info,
        }
    }
}

/// A fully buffered result set.
#[derive(Debug, Clone)]
pub struct ResultSet {
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Row>,
}

impl ResultSet {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Result of a buffered query.
#[derive(Debug, Clone)]
pub enum QueryOutcome {
    /// The statement produced a result set
    Rows(ResultSet),
    /// The statement produced an OK acknowledgement
    Ok(OkSummary),
}

impl QueryOutcome {
    pub fn as_rows(&self) -> Option<&ResultSet> {
        match self {
            QueryOutcome::Rows(rs) => Some(rs),
            QueryOutcome::Ok(_) => None,
        }
    }

    pub fn affected_rows(&self) -> u64 {
        match self {
            QueryOutcome::Rows(_) => 0,
            QueryOutcome::Ok(ok) => ok.affected_rows,
        }
    }
}

/// Summary of a streamed query.
#[derive(Debug, Clone, Default)]
pub struct StreamSummary {
    /// Rows read off the wire, delivered or not
    pub rows_scanned: u64,
    /// Rows handed to the sink
    pub rows_delivered: u64,
    /// True when the sink stopped before the result set ended
    pub stopped_early: bool,
    /// Present when the statement produced an OK instead of rows
    pub ok: Option<OkSummary>,
}

/// Sink behind [`Connection::execute`]: buffers everything.
struct BufferingSink {
    columns: Vec<ColumnDef>,
    rows: Vec<Row>,
}

impl RowSink for BufferingSink {
    fn on_columns(&mut self, columns: &[ColumnDef]) -> SinkFlow {
        self.columns = columns.to_vec();
        SinkFlow::Continue
    }

    fn on_row(&mut self, row: Row) -> SinkFlow {
        self.rows.push(row);
        SinkFlow::Continue
    }
}

impl Connection {
    /// Run a statement and buffer the whole response.
    pub fn execute(&mut self, sql: &str) -> Result<QueryOutcome> {
        let mut sink = BufferingSink {
            columns: Vec::new(),
            rows: Vec::new(),
        };
        let summary = self.execute_streaming(sql, &mut sink)?;
        match summary.ok {
            Some(ok) => Ok(QueryOutcome::Ok(ok)),
            None => Ok(QueryOutcome::Rows(ResultSet {
                columns: sink.columns,
                rows: sink.rows,
            })),
        }
    }

    /// Run a statement with `?` placeholders substituted from `params`.
    pub fn execute_params(&mut self, sql: &str, params: &[Value]) -> Result<QueryOutcome> {
        let sql = interpolate_params(sql, params)?;
        self.execute(&sql)
    }

    /// Run a statement, delivering rows to `sink` as they arrive.
    ///
    /// The connection moves `Ready -> Querying -> Ready`; a fatal wire
    /// failure leaves it `Disconnected` instead. A server-side SQL error
    /// ends the exchange cleanly and leaves the connection `Ready`.
    pub fn execute_streaming(&mut self, sql: &str, sink: &mut dyn RowSink) -> Result<StreamSummary> {
        self.begin_query()?;
        debug!(sql_len = sql.len(), "executing query");
        let result = self.run_query(sql, sink);
        // A desynchronized stream cannot be reused; drop the socket.
        if result.as_ref().is_err_and(Error::forces_disconnect) {
            self.teardown();
        }
        self.end_query();
        result
    }

    fn run_query(&mut self, sql: &str, sink: &mut dyn RowSink) -> Result<StreamSummary> {
        self.send_command(Command::Query, sql.as_bytes())?;

        let payload = self.read_payload()?;
        let column_count = match PacketType::classify(payload[0], payload.len()) {
            PacketType::Ok => {
                let ok = self.expect_ok(&payload)?;
                return Ok(StreamSummary {
                    ok: Some(OkSummary::from(ok)),
                    ..StreamSummary::default()
                });
            }
            PacketType::Error => return Err(self.server_error(&payload)),
            PacketType::LocalInfile => {
                return Err(Error::protocol("LOCAL INFILE requests are not supported"));
            }
            PacketType::Eof | PacketType::Data => {
                let mut reader = PayloadReader::new(&payload);
                let count = reader.read_lenenc_int().ok_or_else(|| {
                    Error::protocol("malformed result set header")
                })?;
                if !reader.is_exhausted() {
                    return Err(Error::protocol("trailing bytes in result set header"));
                }
                count as usize
            }
        };

        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let payload = self.read_payload()?;
            columns.push(ColumnDef::parse(&payload)?);
        }

        // Classic servers send an EOF between column defs and rows.
        if !self.has_capability(capabilities::CLIENT_DEPRECATE_EOF) {
            let payload = self.read_payload()?;
            if PacketType::classify(payload[0], payload.len()) != PacketType::Eof {
                return Err(Error::protocol("expected EOF after column definitions"));
            }
        }

        let column_info = Arc::new(ColumnInfo::new(
            columns.iter().map(|c| c.name.clone()).collect(),
        ));
        let mut delivering = sink.on_columns(&columns) == SinkFlow::Continue;
        let mut summary = StreamSummary {
            stopped_early: !delivering,
            ..StreamSummary::default()
        };

        loop {
            let payload = self.read_payload()?;
            match PacketType::classify(payload[0], payload.len()) {
                PacketType::Error => return Err(self.server_error(&payload)),
                PacketType::Eof => {
                    let eof = EofPacket::parse(&payload)
                        .ok_or_else(|| Error::protocol("malformed EOF packet"))?;
                    self.set_status_flags(eof.status_flags);
                    self.check_trailing_results(eof.status_flags)?;
                    break;
                }
                // Under DEPRECATE_EOF the terminator is an OK with an
                // 0xFE header; payload length distinguishes it from a row.
                PacketType::Data
                    if payload[0] == 0xFE
                        && payload.len() < 0xFF_FFFF
                        && self.has_capability(capabilities::CLIENT_DEPRECATE_EOF) =>
                {
                    let ok = self.expect_ok(&payload)?;
                    self.check_trailing_results(ok.status_flags)?;
                    break;
                }
                _ => {
                    summary.rows_scanned += 1;
                    if delivering {
                        let row = parse_text_row(&payload, &columns, &column_info)?;
                        if sink.on_row(row) == SinkFlow::Continue {
                            summary.rows_delivered += 1;
                        } else {
                            // Sink is done; drain the rest to keep the
                            // connection usable.
                            summary.rows_delivered += 1;
                            summary.stopped_early = true;
                            delivering = false;
                            trace!(
                                rows_delivered = summary.rows_delivered,
                                "sink stopped, draining result set"
                            );
                        }
                    }
                }
            }
        }

        debug!(
            rows_scanned = summary.rows_scanned,
            rows_delivered = summary.rows_delivered,
            stopped_early = summary.stopped_early,
            "query complete"
        );
        Ok(summary)
    }

    /// Multi-statement responses are out of scope; refusing loudly beats
    /// desynchronizing the stream.
    fn check_trailing_results(&mut self, status_flags: u16) -> Result<()> {
        if status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0 {
            return Err(Error::protocol(
                "server sent additional result sets; multi-statement queries are not supported",
            ));
        }
        Ok(())
    }
}

/// Decode a text-protocol row payload against its column definitions.
fn parse_text_row(
    payload: &[u8],
    columns: &[ColumnDef],
    column_info: &Arc<ColumnInfo>,
) -> Result<Row> {
    let mut reader = PayloadReader::new(payload);
    let mut values = Vec::with_capacity(columns.len());
    for column in columns {
        if reader.is_exhausted() {
            return Err(Error::Protocol(sqldrift_core::ProtocolError {
                message: format!(
                    "row has fewer fields than the {} declared columns",
                    columns.len()
                ),
                raw: Some(payload.to_vec()),
            }));
        }
        let raw = reader.read_lenenc_string();
        values.push(decode_text_value(raw, column));
    }
    if !reader.is_exhausted() {
        return Err(Error::Protocol(sqldrift_core::ProtocolError {
            message: "row has trailing bytes past the declared columns".to_string(),
            raw: Some(payload.to_vec()),
        }));
    }
    Ok(Row::with_columns(Arc::clone(column_info), values))
}
