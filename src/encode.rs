use bytes::BytesMut;

use crate::decode::MAX_BULK_LEN;
use crate::error::EncodeError;

const INITIAL_HINT: usize = 256;
const STEADY_HINT: usize = 4 * 1024;

/// Destination for encoded bytes: a growable scratch buffer plus a commit
/// call that makes everything appended so far visible downstream.
///
/// `RespWriter` appends whole tokens into the scratch and only calls
/// [`commit`] from its own `flush`, so a sink never observes a partial token.
///
/// [`commit`]: ByteSink::commit
pub trait ByteSink {
    /// Scratch buffer to append into, with at least `hint` bytes reserved.
    fn scratch(&mut self, hint: usize) -> &mut BytesMut;
    /// Publish the appended bytes to the consuming side.
    fn commit(&mut self);
}

/// A plain `BytesMut` is a sink with a no-op commit; useful for building
/// standalone command buffers.
impl ByteSink for BytesMut {
    fn scratch(&mut self, hint: usize) -> &mut BytesMut {
        self.reserve(hint);
        self
    }

    fn commit(&mut self) {}
}

/// Forward-only RESP token writer.
///
/// Emits RESP v2/v3 tokens into a [`ByteSink`]. The first allocation asks for
/// a small hint; once a flush has happened the writer assumes a long-lived
/// stream and asks for page-sized chunks instead.
#[derive(Debug)]
pub struct RespWriter<'a, S: ByteSink> {
    sink: &'a mut S,
    skip_validation: bool,
    pending: usize,
    flushed_once: bool,
}

impl<'a, S: ByteSink> RespWriter<'a, S> {
    pub fn new(sink: &'a mut S) -> Self {
        Self {
            sink,
            skip_validation: false,
            pending: 0,
            flushed_once: false,
        }
    }

    /// A writer that skips size and character validation.
    pub fn without_validation(sink: &'a mut S) -> Self {
        Self {
            skip_validation: true,
            ..Self::new(sink)
        }
    }

    /// Bytes appended since the last flush.
    pub fn pending(&self) -> usize {
        self.pending
    }

    fn buf(&mut self, need: usize) -> &mut BytesMut {
        let hint = need.max(if self.flushed_once {
            STEADY_HINT
        } else {
            INITIAL_HINT
        });
        self.sink.scratch(hint)
    }

    /// `*<n>\r\n`; `n == -1` emits the null-array literal.
    pub fn write_array_start(&mut self, n: i64) -> Result<(), EncodeError> {
        if n == -1 {
            self.append(b"*-1\r\n");
            return Ok(());
        }
        if n < 0 && !self.skip_validation {
            return Err(EncodeError::ArrayLengthInvalid);
        }
        self.write_header(b'*', n);
        Ok(())
    }

    /// `$<len>\r\n<bytes>\r\n`.
    pub fn write_bulk_string(&mut self, payload: &[u8]) -> Result<(), EncodeError> {
        if payload.len() as i64 > MAX_BULK_LEN && !self.skip_validation {
            return Err(EncodeError::BulkStringTooLarge);
        }
        self.write_header(b'$', payload.len() as i64);
        let buf = self.buf(payload.len() + 2);
        buf.extend_from_slice(payload);
        buf.extend_from_slice(b"\r\n");
        self.pending += payload.len() + 2;
        Ok(())
    }

    /// Fast path for a single-byte payload: `$1\r\n<b>\r\n`.
    pub fn write_bulk_string_byte(&mut self, b: u8) {
        self.append(&[b'$', b'1', b'\r', b'\n', b, b'\r', b'\n']);
    }

    /// `+<bytes>\r\n`; the payload may not contain CR or LF.
    pub fn write_simple_string(&mut self, payload: &[u8]) -> Result<(), EncodeError> {
        if !self.skip_validation && payload.iter().any(|&b| b == b'\r' || b == b'\n') {
            return Err(EncodeError::SimpleStringContainsNewline);
        }
        let buf = self.buf(payload.len() + 3);
        buf.extend_from_slice(b"+");
        buf.extend_from_slice(payload);
        buf.extend_from_slice(b"\r\n");
        self.pending += payload.len() + 3;
        Ok(())
    }

    /// `:<decimal>\r\n`, with a fast path for single-digit values.
    pub fn write_integer(&mut self, value: i64) {
        if (0..10).contains(&value) {
            self.append(&[b':', b'0' + value as u8, b'\r', b'\n']);
        } else {
            self.write_header(b':', value);
        }
    }

    /// Append pre-encoded bytes verbatim, no validation.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.append(bytes);
    }

    /// Commit pending bytes to the sink. Subsequent writes request fresh
    /// memory with the larger steady-state hint.
    pub fn flush(&mut self) {
        self.sink.commit();
        self.pending = 0;
        self.flushed_once = true;
    }

    fn append(&mut self, bytes: &[u8]) {
        self.buf(bytes.len()).extend_from_slice(bytes);
        self.pending += bytes.len();
    }

    /// `<ctrl><decimal>\r\n` with no leading zeros.
    fn write_header(&mut self, ctrl: u8, value: i64) {
        let mut digits = [0u8; 20];
        let text = format_decimal(&mut digits, value);
        let buf = self.buf(text.len() + 3);
        buf.extend_from_slice(&[ctrl]);
        buf.extend_from_slice(text);
        buf.extend_from_slice(b"\r\n");
        self.pending += text.len() + 3;
    }
}

/// Format `value` as ASCII decimal into `buf`, returning the written slice.
/// Negation is done on the magnitude as u64 so `i64::MIN` formats correctly.
fn format_decimal(buf: &mut [u8; 20], value: i64) -> &[u8] {
    let negative = value < 0;
    let mut magnitude = value.unsigned_abs();
    let mut at = buf.len();
    loop {
        at -= 1;
        buf[at] = b'0' + (magnitude % 10) as u8;
        magnitude /= 10;
        if magnitude == 0 {
            break;
        }
    }
    if negative {
        at -= 1;
        buf[at] = b'-';
    }
    &buf[at..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(write: impl FnOnce(&mut RespWriter<'_, BytesMut>)) -> Vec<u8> {
        let mut sink = BytesMut::new();
        let mut w = RespWriter::new(&mut sink);
        write(&mut w);
        w.flush();
        sink.to_vec()
    }

    #[test]
    fn array_header_forms() {
        assert_eq!(
            encoded(|w| w.write_array_start(3).unwrap()),
            b"*3\r\n".to_vec()
        );
        assert_eq!(
            encoded(|w| w.write_array_start(-1).unwrap()),
            b"*-1\r\n".to_vec()
        );
        let mut sink = BytesMut::new();
        let mut w = RespWriter::new(&mut sink);
        assert_eq!(
            w.write_array_start(-2),
            Err(EncodeError::ArrayLengthInvalid)
        );
    }

    #[test]
    fn bulk_string_with_internal_crlf() {
        assert_eq!(
            encoded(|w| w.write_bulk_string(b"abc\r\n123").unwrap()),
            b"$8\r\nabc\r\n123\r\n".to_vec()
        );
    }

    #[test]
    fn single_byte_fast_path() {
        assert_eq!(
            encoded(|w| w.write_bulk_string_byte(b'3')),
            b"$1\r\n3\r\n".to_vec()
        );
    }

    #[test]
    fn simple_string_rejects_newlines() {
        assert_eq!(
            encoded(|w| w.write_simple_string(b"PONG").unwrap()),
            b"+PONG\r\n".to_vec()
        );
        let mut sink = BytesMut::new();
        let mut w = RespWriter::new(&mut sink);
        assert_eq!(
            w.write_simple_string(b"no\r\nnewlines"),
            Err(EncodeError::SimpleStringContainsNewline)
        );
        // Suppressed validation lets it through.
        let mut w = RespWriter::without_validation(&mut sink);
        w.write_simple_string(b"ha\rck").unwrap();
    }

    #[test]
    fn integer_forms() {
        assert_eq!(encoded(|w| w.write_integer(7)), b":7\r\n".to_vec());
        assert_eq!(encoded(|w| w.write_integer(129)), b":129\r\n".to_vec());
        assert_eq!(encoded(|w| w.write_integer(-42)), b":-42\r\n".to_vec());
        assert_eq!(
            encoded(|w| w.write_integer(i64::MIN)),
            b":-9223372036854775808\r\n".to_vec()
        );
    }

    #[test]
    fn whole_command_round_trip() {
        let out = encoded(|w| {
            w.write_array_start(2).unwrap();
            w.write_bulk_string(b"GET").unwrap();
            w.write_bulk_string(b"key:1").unwrap();
        });
        assert_eq!(out, b"*2\r\n$3\r\nGET\r\n$5\r\nkey:1\r\n".to_vec());
    }

    #[test]
    fn raw_bytes_pass_through() {
        assert_eq!(
            encoded(|w| w.write_raw(b"$5\r\nHELLO\r\n")),
            b"$5\r\nHELLO\r\n".to_vec()
        );
    }

    #[test]
    fn pending_resets_on_flush() {
        let mut sink = BytesMut::new();
        let mut w = RespWriter::new(&mut sink);
        w.write_integer(5);
        assert_eq!(w.pending(), 4);
        w.flush();
        assert_eq!(w.pending(), 0);
    }
}
