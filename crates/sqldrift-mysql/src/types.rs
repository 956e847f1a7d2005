//! Column metadata, text-protocol value decoding, and SQL literal
//! formatting for parameter interpolation.

use sqldrift_core::{Error, Result, Value};

use crate::protocol::PayloadReader;

/// Wire type codes from column definition packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    Bit = 0x10,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Map a wire type code; unknown codes come back as `VarString` so
    /// their values still decode as text.
    pub fn from_u8(v: u8) -> Self {
        match v {
            0x00 => Self::Decimal,
            0x01 => Self::Tiny,
            0x02 => Self::Short,
            0x03 => Self::Long,
            0x04 => Self::Float,
            0x05 => Self::Double,
            0x06 => Self::Null,
            0x07 => Self::Timestamp,
            0x08 => Self::LongLong,
            0x09 => Self::Int24,
            0x0A => Self::Date,
            0x0B => Self::Time,
            0x0C => Self::DateTime,
            0x0D => Self::Year,
            0x10 => Self::Bit,
            0xF5 => Self::Json,
            0xF6 => Self::NewDecimal,
            0xF7 => Self::Enum,
            0xF8 => Self::Set,
            0xF9 => Self::TinyBlob,
            0xFA => Self::MediumBlob,
            0xFB => Self::LongBlob,
            0xFC => Self::Blob,
            0xFE => Self::String,
            0xFF => Self::Geometry,
            _ => Self::VarString,
        }
    }
}

/// Column definition flags.
#[allow(dead_code)]
pub mod column_flags {
    pub const NOT_NULL: u16 = 0x0001;
    pub const PRIMARY_KEY: u16 = 0x0002;
    pub const UNIQUE_KEY: u16 = 0x0004;
    pub const UNSIGNED: u16 = 0x0020;
    pub const BINARY: u16 = 0x0080;
    pub const AUTO_INCREMENT: u16 = 0x0200;
}

/// One column definition from a result set header.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub schema: String,
    pub table: String,
    pub name: String,
    /// Original column name before aliasing
    pub org_name: String,
    pub charset: u16,
    pub column_length: u32,
    pub field_type: FieldType,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDef {
    /// Parse a protocol-4.1 column definition payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(payload);
        let err = || {
            Error::Protocol(sqldrift_core::ProtocolError {
                message: "malformed column definition packet".to_string(),
                raw: Some(payload.to_vec()),
            })
        };

        // catalog (always "def"), schema, table, org_table, name, org_name
        reader.read_lenenc_string().ok_or_else(err)?;
        let schema = reader.read_lenenc_string().ok_or_else(err)?;
        let table = reader.read_lenenc_string().ok_or_else(err)?;
        reader.read_lenenc_string().ok_or_else(err)?;
        let name = reader.read_lenenc_string().ok_or_else(err)?;
        let org_name = reader.read_lenenc_string().ok_or_else(err)?;

        // Fixed-length fields, preceded by their lenenc length (0x0c)
        reader.read_lenenc_int().ok_or_else(err)?;
        let charset = reader.read_u16_le().ok_or_else(err)?;
        let column_length = reader.read_u32_le().ok_or_else(err)?;
        let field_type = FieldType::from_u8(reader.read_u8().ok_or_else(err)?);
        let flags = reader.read_u16_le().ok_or_else(err)?;
        let decimals = reader.read_u8().ok_or_else(err)?;

        Ok(Self {
            schema: String::from_utf8_lossy(&schema).into_owned(),
            table: String::from_utf8_lossy(&table).into_owned(),
            name: String::from_utf8_lossy(&name).into_owned(),
            org_name: String::from_utf8_lossy(&org_name).into_owned(),
            charset,
            column_length,
            field_type,
            flags,
            decimals,
        })
    }

    pub fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    pub fn is_nullable(&self) -> bool {
        self.flags & column_flags::NOT_NULL == 0
    }

    /// Binary charset means the column carries bytes, not text.
    pub fn is_binary(&self) -> bool {
        self.charset == u16::from(crate::protocol::charset::BINARY)
    }
}

/// Decode one text-protocol field into a typed value.
///
/// The text protocol sends every field as a string; the column type
/// decides the target. Values that fail to parse as their declared type
/// fall back to text rather than erroring, matching server behaviour for
/// odd modes.
pub fn decode_text_value(raw: Option<Vec<u8>>, column: &ColumnDef) -> Value {
    let Some(bytes) = raw else {
        return Value::Null;
    };
    let text = || String::from_utf8_lossy(&bytes).into_owned();
    match column.field_type {
        FieldType::Null => Value::Null,
        FieldType::Tiny => text()
            .parse::<i8>()
            .map_or_else(|_| Value::Text(text()), Value::TinyInt),
        FieldType::Short | FieldType::Year => text()
            .parse::<i16>()
            .map_or_else(|_| Value::Text(text()), Value::SmallInt),
        FieldType::Long | FieldType::Int24 => text()
            .parse::<i32>()
            .map_or_else(|_| Value::Text(text()), Value::Int),
        FieldType::LongLong => text()
            .parse::<i64>()
            .map_or_else(|_| Value::Text(text()), Value::BigInt),
        FieldType::Float => text()
            .parse::<f32>()
            .map_or_else(|_| Value::Text(text()), Value::Float),
        FieldType::Double => text()
            .parse::<f64>()
            .map_or_else(|_| Value::Text(text()), Value::Double),
        FieldType::Json => serde_json::from_slice(&bytes)
            .map_or_else(|_| Value::Text(text()), Value::Json),
        FieldType::TinyBlob
        | FieldType::MediumBlob
        | FieldType::LongBlob
        | FieldType::Blob
        | FieldType::Geometry
        | FieldType::Bit => {
            if column.is_binary() {
                Value::Bytes(bytes)
            } else {
                Value::Text(text())
            }
        }
        // Decimals and temporal types stay textual; lossless and sortable.
        _ => Value::Text(text()),
    }
}

/// Escape a string for inclusion in a single-quoted SQL literal.
pub fn escape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for c in s.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\x1a' => out.push_str("\\Z"),
            _ => out.push(c),
        }
    }
    out
}

/// Format raw bytes as a hex literal.
pub fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("X'");
    for b in bytes {
        out.push_str(&format!("{b:02X}"));
    }
    out.push('\'');
    out
}

/// Render a value as a SQL literal.
pub fn format_value_for_sql(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::TinyInt(v) => v.to_string(),
        Value::SmallInt(v) => v.to_string(),
        Value::Int(v) => v.to_string(),
        Value::BigInt(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Text(s) => format!("'{}'", escape_string(s)),
        Value::Bytes(b) => escape_bytes(b),
        Value::Json(j) => format!("'{}'", escape_string(&j.to_string())),
    }
}

/// Substitute placeholders with escaped literals.
///
/// `?` consumes parameters left to right; `$N` references the Nth
/// parameter (1-based) and may repeat. Placeholders inside quoted
/// literals are left alone. Errors when a parameter is missing or goes
/// unused.
pub fn interpolate_params(sql: &str, params: &[Value]) -> Result<String> {
    let mut out = String::with_capacity(sql.len() + params.len() * 8);
    let mut next = 0;
    let mut highest = 0;
    let mut in_quote: Option<char> = None;
    let mut escaped = false;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match in_quote {
            Some(q) => {
                out.push(c);
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    in_quote = None;
                }
            }
            None => match c {
                '\'' | '"' | '`' => {
                    in_quote = Some(c);
                    out.push(c);
                }
                '?' => {
                    let value = params.get(next).ok_or_else(|| {
                        Error::state(format!(
                            "statement has more placeholders than parameters ({} given)",
                            params.len()
                        ))
                    })?;
                    out.push_str(&format_value_for_sql(value));
                    next += 1;
                    highest = highest.max(next);
                }
                '$' if chars.peek().is_some_and(char::is_ascii_digit) => {
                    let mut n = 0usize;
                    while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                        n = n * 10 + d as usize;
                        chars.next();
                    }
                    let value = params.get(n.wrapping_sub(1)).ok_or_else(|| {
                        Error::state(format!(
                            "placeholder ${n} is out of range ({} parameters given)",
                            params.len()
                        ))
                    })?;
                    out.push_str(&format_value_for_sql(value));
                    highest = highest.max(n);
                }
                _ => out.push(c),
            },
        }
    }

    if highest != params.len() {
        return Err(Error::state(format!(
            "statement uses {highest} parameters but {} were given",
            params.len()
        )));
    }
    Ok(out)
}
