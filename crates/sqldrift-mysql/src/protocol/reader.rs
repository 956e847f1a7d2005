//! Cursor-style reader over a packet payload.
//!
//! All reads are bounds-checked and return `None` on a short payload;
//! callers turn that into a protocol error with the raw payload attached.

/// Reads wire primitives from a payload, tracking position.
pub struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    /// Wrap a payload slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// True when the cursor has reached the end.
    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Next byte without advancing.
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// Advance the cursor by `n` bytes (clamped to the end).
    pub fn skip(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.data.len());
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let byte = self.data.get(self.pos).copied()?;
        self.pos += 1;
        Some(byte)
    }

    pub fn read_u16_le(&mut self) -> Option<u16> {
        let bytes = self.read_bytes(2)?;
        Some(u16::from(bytes[0]) | (u16::from(bytes[1]) << 8))
    }

    pub fn read_u24_le(&mut self) -> Option<u32> {
        let bytes = self.read_bytes(3)?;
        Some(u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16))
    }

    pub fn read_u32_le(&mut self) -> Option<u32> {
        let bytes = self.read_bytes(4)?;
        let mut arr = [0u8; 4];
        arr.copy_from_slice(bytes);
        Some(u32::from_le_bytes(arr))
    }

    pub fn read_u64_le(&mut self) -> Option<u64> {
        let bytes = self.read_bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Some(u64::from_le_bytes(arr))
    }

    /// Length-encoded integer. `None` for a truncated payload; the 0xFB
    /// NULL marker is not an integer and also yields `None`.
    pub fn read_lenenc_int(&mut self) -> Option<u64> {
        let first = self.read_u8()?;
        match first {
            0xFB => None,
            0xFC => self.read_u16_le().map(u64::from),
            0xFD => self.read_u24_le().map(u64::from),
            0xFE => self.read_u64_le(),
            b => Some(u64::from(b)),
        }
    }

    /// Length-encoded string, or `None` for the 0xFB NULL marker.
    pub fn read_lenenc_string(&mut self) -> Option<Vec<u8>> {
        if self.peek() == Some(0xFB) {
            self.skip(1);
            return None;
        }
        let len = self.read_lenenc_int()? as usize;
        self.read_bytes(len).map(<[u8]>::to_vec)
    }

    /// NUL-terminated string. Invalid UTF-8 is replaced, not rejected;
    /// server version strings are not guaranteed clean.
    pub fn read_null_string(&mut self) -> Option<String> {
        let start = self.pos;
        let nul = self.data[start..].iter().position(|&b| b == 0)?;
        let s = String::from_utf8_lossy(&self.data[start..start + nul]).into_owned();
        self.pos = start + nul + 1;
        Some(s)
    }

    /// Exactly `n` raw bytes.
    pub fn read_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    /// A UTF-8 string of exactly `n` bytes.
    pub fn read_string(&mut self, n: usize) -> Option<String> {
        self.read_bytes(n)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Everything from the cursor to the end, as a string.
    pub fn read_rest_string(&mut self) -> String {
        let s = String::from_utf8_lossy(&self.data[self.pos..]).into_owned();
        self.pos = self.data.len();
        s
    }
}
