//! Builder for packet payloads and outgoing frames.

use super::{Command, FrameHeader, MAX_PAYLOAD_SIZE};

/// Accumulates wire primitives into a payload buffer.
#[derive(Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16_le(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u24_le(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes()[..3]);
    }

    pub fn write_u32_le(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_lenenc_int(&mut self, v: u64) {
        match v {
            0..=0xFA => self.write_u8(v as u8),
            0xFB..=0xFFFF => {
                self.write_u8(0xFC);
                self.write_u16_le(v as u16);
            }
            0x1_0000..=0xFF_FFFF => {
                self.write_u8(0xFD);
                self.write_u24_le(v as u32);
            }
            _ => {
                self.write_u8(0xFE);
                self.buf.extend_from_slice(&v.to_le_bytes());
            }
        }
    }

    pub fn write_lenenc_bytes(&mut self, bytes: &[u8]) {
        self.write_lenenc_int(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_lenenc_str(&mut self, s: &str) {
        self.write_lenenc_bytes(s.as_bytes());
    }

    pub fn write_null_string(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_zeros(&mut self, n: usize) {
        self.buf.resize(self.buf.len() + n, 0);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Frame a payload for the wire, starting at `sequence_id`.
///
/// Payloads of 2^24 - 1 bytes or more are split across continuation
/// frames; a payload that is an exact multiple of the limit is followed
/// by an empty frame so the receiver sees the end. Returns the framed
/// bytes and the next sequence id.
pub fn encode_frames(payload: &[u8], sequence_id: u8) -> (Vec<u8>, u8) {
    let mut out = Vec::with_capacity(payload.len() + FrameHeader::SIZE);
    let mut seq = sequence_id;
    let mut offset = 0;
    loop {
        let chunk_len = (payload.len() - offset).min(MAX_PAYLOAD_SIZE);
        let header = FrameHeader {
            payload_length: chunk_len as u32,
            sequence_id: seq,
        };
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&payload[offset..offset + chunk_len]);
        seq = seq.wrapping_add(1);
        offset += chunk_len;
        if chunk_len < MAX_PAYLOAD_SIZE {
            break;
        }
    }
    (out, seq)
}

/// Frame a command packet: command byte followed by its argument.
pub fn encode_command(command: Command, arg: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + arg.len());
    payload.push(command as u8);
    payload.extend_from_slice(arg);
    // Commands reset the sequence counter.
    encode_frames(&payload, 0).0
}

#[cfg(test)]
mod tests {
    use super::super::decode_frame;
    use super::*;

    #[test]
    fn lenenc_int_encodings() {
        let mut w = PayloadWriter::new();
        w.write_lenenc_int(0xFA);
        assert_eq!(w.as_bytes(), &[0xFA]);

        let mut w = PayloadWriter::new();
        w.write_lenenc_int(0x1234);
        assert_eq!(w.as_bytes(), &[0xFC, 0x34, 0x12]);

        let mut w = PayloadWriter::new();
        w.write_lenenc_int(0x12_3456);
        assert_eq!(w.as_bytes(), &[0xFD, 0x56, 0x34, 0x12]);

        let mut w = PayloadWriter::new();
        w.write_lenenc_int(u64::from(u32::MAX) + 1);
        assert_eq!(w.as_bytes()[0], 0xFE);
        assert_eq!(w.len(), 9);
    }

    #[test]
    fn small_payload_is_one_frame() {
        let (bytes, next_seq) = encode_frames(b"hello", 3);
        assert_eq!(next_seq, 4);
        let (frame, used) = decode_frame(&bytes).expect("frame");
        assert_eq!(used, bytes.len());
        assert_eq!(frame.sequence_id, 3);
        assert_eq!(frame.payload, b"hello");
    }

    #[test]
    fn oversize_payload_splits_with_terminator() {
        let payload = vec![0xAB; MAX_PAYLOAD_SIZE];
        let (bytes, next_seq) = encode_frames(&payload, 0);
        assert_eq!(next_seq, 2);

        let (first, used) = decode_frame(&bytes).expect("first frame");
        assert_eq!(first.payload.len(), MAX_PAYLOAD_SIZE);
        assert!(first.is_continued());

        // Exact multiple of the limit: an empty terminator frame follows.
        let (second, used2) = decode_frame(&bytes[used..]).expect("terminator");
        assert!(second.payload.is_empty());
        assert_eq!(second.sequence_id, 1);
        assert_eq!(used + used2, bytes.len());
    }

    #[test]
    fn command_frame_layout() {
        let bytes = encode_command(Command::Query, b"SELECT 1");
        let (frame, _) = decode_frame(&bytes).expect("frame");
        assert_eq!(frame.sequence_id, 0);
        assert_eq!(frame.payload[0], 0x03);
        assert_eq!(&frame.payload[1..], b"SELECT 1");
    }
}
