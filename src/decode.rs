use crate::chain::{ByteChain, ChainCursor};
use crate::error::{Error, ProtocolError, ProtocolErrorKind, Result};

/// Protocol ceiling for a single bulk-string payload.
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// One syntactically complete RESP token.
///
/// Header variants carry the parsed length; the element tokens they announce
/// follow as separate reads. A `$-1`/`*-1` header decodes as [`TokenKind::Null`]
/// and is a self-contained token: there is no payload read after it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TokenKind {
    SimpleString,
    Error,
    Integer(i64),
    BulkStringHeader(i64),
    BulkString,
    ArrayHeader(i64),
    Null,
    // RESP3
    MapHeader(i64),
    SetHeader(i64),
    PushHeader(i64),
    Double(f64),
    Boolean(bool),
    BigNumber,
    VerbatimStringHeader(i64),
}

enum Line {
    Complete { value_end: u64, token_end: u64 },
    Partial,
}

/// Incremental, forward-only RESP reader.
///
/// The reader only commits cursor advancement on complete token boundaries:
/// when the buffered input cannot finish a token, `try_read` returns
/// `Ok(false)` without moving the cursor, and the caller retries after more
/// bytes arrive. Re-scanning a partial token is cheap; resumption state is
/// not.
///
/// After a successful read the last token is exposed through [`kind`],
/// [`token`] (control byte and terminators included) and [`value`] (semantic
/// payload only). All three are cleared at the start of every attempt.
///
/// [`kind`]: RespReader::kind
/// [`token`]: RespReader::token
/// [`value`]: RespReader::value
#[derive(Debug, Default)]
pub struct RespReader {
    skip_validation: bool,
    bytes_consumed: u64,
    kind: Option<TokenKind>,
    token: ByteChain,
    value: ByteChain,
}

impl RespReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// A reader that tolerates malformed terminators and oversize lengths
    /// while preserving framing semantics.
    pub fn lenient() -> Self {
        Self {
            skip_validation: true,
            ..Self::default()
        }
    }

    /// Total bytes consumed across all successful reads.
    pub fn bytes_consumed(&self) -> u64 {
        self.bytes_consumed
    }

    pub fn kind(&self) -> Option<TokenKind> {
        self.kind
    }

    /// The full span of the last token, control byte and terminators included.
    pub fn token(&self) -> &ByteChain {
        &self.token
    }

    /// The semantic payload of the last token.
    pub fn value(&self) -> &ByteChain {
        &self.value
    }

    /// Clears token state and zeroes the cumulative byte counter.
    pub fn reset(&mut self) {
        self.clear_token();
        self.bytes_consumed = 0;
    }

    fn clear_token(&mut self) {
        self.kind = None;
        self.token = ByteChain::new();
        self.value = ByteChain::new();
    }

    /// Attempt to read the next token at the cursor.
    ///
    /// Returns `Ok(true)` and advances the cursor past exactly one token on
    /// success, `Ok(false)` when more input is needed (cursor untouched).
    pub fn try_read(&mut self, cursor: &mut ChainCursor<'_>) -> Result<bool> {
        self.clear_token();
        let chain = cursor.chain();
        let start = cursor.position();
        let Some(ctrl) = cursor.peek() else {
            return Ok(false);
        };

        let (value_end, token_end) = match self.scan_line(chain, start)? {
            Line::Complete {
                value_end,
                token_end,
            } => (value_end, token_end),
            Line::Partial => return Ok(false),
        };
        let value = chain.slice(start + 1, value_end);

        let kind = match ctrl {
            b'+' => TokenKind::SimpleString,
            b'-' => TokenKind::Error,
            b':' => TokenKind::Integer(self.parse_full_integer(&value)?),
            b'$' => match self.parse_full_length(&value)? {
                -1 => TokenKind::Null,
                n => {
                    if n > MAX_BULK_LEN && !self.skip_validation {
                        return Err(
                            ProtocolError::new(ProtocolErrorKind::LengthOutOfRange, 1).into()
                        );
                    }
                    TokenKind::BulkStringHeader(n)
                }
            },
            b'*' => match self.parse_full_length(&value)? {
                -1 => TokenKind::Null,
                n => TokenKind::ArrayHeader(n),
            },
            b'%' => TokenKind::MapHeader(self.parse_container_length(&value)?),
            b'~' => TokenKind::SetHeader(self.parse_container_length(&value)?),
            b'>' => TokenKind::PushHeader(self.parse_container_length(&value)?),
            b'=' => {
                let n = self.parse_container_length(&value)?;
                // The payload starts with a 3-byte encoding tag and a colon.
                if n < 4 && !self.skip_validation {
                    return Err(ProtocolError::new(ProtocolErrorKind::LengthOutOfRange, 1).into());
                }
                TokenKind::VerbatimStringHeader(n)
            }
            b',' => TokenKind::Double(self.parse_double(&value)?),
            b'#' => match (value.len(), value.byte_at(value.start())) {
                (1, Some(b't')) => TokenKind::Boolean(true),
                (1, Some(b'f')) => TokenKind::Boolean(false),
                (_, first) => {
                    return Err(ProtocolError::new(
                        ProtocolErrorKind::UnexpectedControlByte(first.unwrap_or(ctrl)),
                        1,
                    )
                    .into());
                }
            },
            b'(' => {
                self.check_big_number(&value)?;
                TokenKind::BigNumber
            }
            other => {
                return Err(
                    ProtocolError::new(ProtocolErrorKind::UnexpectedControlByte(other), 0).into(),
                );
            }
        };

        self.kind = Some(kind);
        self.value = value;
        self.token = chain.slice(start, token_end);
        cursor.advance(token_end - start);
        self.bytes_consumed += token_end - start;
        Ok(true)
    }

    /// Read a bulk-string payload announced by a `BulkStringHeader(length)`
    /// (or `VerbatimStringHeader`) token.
    ///
    /// Consumes exactly `length + 2` bytes; the emitted token's value spans
    /// `length` bytes with the trailing CRLF verified and excluded.
    pub fn try_read_bulk_string(
        &mut self,
        cursor: &mut ChainCursor<'_>,
        length: i64,
    ) -> Result<bool> {
        self.clear_token();
        if length < 0 {
            return Err(Error::ArgumentOutOfRange(
                "bulk string length must be non-negative",
            ));
        }
        if length > MAX_BULK_LEN && !self.skip_validation {
            return Err(Error::ArgumentOutOfRange(
                "bulk string length exceeds the 512 MiB protocol limit",
            ));
        }
        let len = length as u64;
        let needed = len + 2;
        if cursor.remaining() < needed {
            return Ok(false);
        }
        let chain = cursor.chain();
        let start = cursor.position();
        if !self.skip_validation
            && (chain.byte_at(start + len) != Some(b'\r')
                || chain.byte_at(start + len + 1) != Some(b'\n'))
        {
            return Err(
                ProtocolError::new(ProtocolErrorKind::UnterminatedBulkString, len).into(),
            );
        }
        self.value = chain.slice(start, start + len);
        self.token = chain.slice(start, start + needed);
        self.kind = Some(TokenKind::BulkString);
        cursor.advance(needed);
        self.bytes_consumed += needed;
        Ok(true)
    }

    /// Locate the CRLF terminating the line that starts at `token_start`.
    /// In lenient mode a CR followed by a non-LF byte terminates the line by
    /// itself; in strict mode it is a framing error (line payloads may not
    /// contain a bare CR).
    fn scan_line(&self, chain: &ByteChain, token_start: u64) -> Result<Line> {
        let value_start = token_start + 1;
        let Some(cr) = chain.find_byte(b'\r', value_start) else {
            return Ok(Line::Partial);
        };
        if cr + 1 >= chain.end() {
            // Cannot tell yet whether the LF follows.
            return Ok(Line::Partial);
        }
        match chain.byte_at(cr + 1) {
            Some(b'\n') => Ok(Line::Complete {
                value_end: cr,
                token_end: cr + 2,
            }),
            _ if self.skip_validation => Ok(Line::Complete {
                value_end: cr,
                token_end: cr + 1,
            }),
            _ => Err(ProtocolError::new(
                ProtocolErrorKind::UnterminatedLine,
                cr - token_start,
            )
            .into()),
        }
    }

    fn parse_full_integer(&self, value: &ByteChain) -> Result<i64> {
        let (v, consumed) =
            parse_signed_integer(value).map_err(|(kind, off)| ProtocolError::new(kind, 1 + off))?;
        if consumed != value.len() {
            return Err(
                ProtocolError::new(ProtocolErrorKind::InvalidIntegerDigit, 1 + consumed).into(),
            );
        }
        Ok(v)
    }

    fn parse_full_length(&self, value: &ByteChain) -> Result<i64> {
        let (v, consumed) =
            parse_prefixed_length(value).map_err(|(kind, off)| ProtocolError::new(kind, 1 + off))?;
        if consumed != value.len() {
            return Err(
                ProtocolError::new(ProtocolErrorKind::InvalidIntegerDigit, 1 + consumed).into(),
            );
        }
        Ok(v)
    }

    /// Container headers may not announce a null length.
    fn parse_container_length(&self, value: &ByteChain) -> Result<i64> {
        match self.parse_full_length(value)? {
            -1 => Err(ProtocolError::new(ProtocolErrorKind::UnexpectedNull, 1).into()),
            n => Ok(n),
        }
    }

    fn parse_double(&self, value: &ByteChain) -> Result<f64> {
        let invalid = |off| ProtocolError::new(ProtocolErrorKind::InvalidIntegerDigit, 1 + off);
        let text = value.to_bytes();
        let text = std::str::from_utf8(&text).map_err(|e| invalid(e.valid_up_to() as u64))?;
        if text.is_empty() {
            return Err(invalid(0).into());
        }
        text.parse::<f64>().map_err(|_| invalid(0).into())
    }

    /// A big number is an arbitrary-precision signed decimal; we validate the
    /// shape without bounding the magnitude.
    fn check_big_number(&self, value: &ByteChain) -> Result<()> {
        if self.skip_validation {
            return Ok(());
        }
        let invalid = |off| ProtocolError::new(ProtocolErrorKind::InvalidIntegerDigit, 1 + off);
        let mut digits = 0u64;
        let mut first_digit = 0u8;
        let mut off = 0u64;
        for b in value.bytes() {
            match b {
                b'-' if off == 0 => {}
                b'0'..=b'9' => {
                    if digits == 0 {
                        first_digit = b;
                    }
                    digits += 1;
                }
                _ => return Err(invalid(off).into()),
            }
            off += 1;
        }
        if digits == 0 {
            return Err(invalid(off).into());
        }
        if first_digit == b'0' && digits > 1 {
            return Err(invalid(off - digits).into());
        }
        Ok(())
    }
}

/// Parse a signed decimal out of a digit sub-sequence (sign and digits only;
/// no control byte, no terminator). Stops at the first non-digit byte and
/// reports `(value, bytes_consumed)`.
///
/// Leading zeros are rejected; the accumulated magnitude is range-checked
/// against `i64` digit by digit, so `9223372036854775808` fails on its final
/// digit rather than wrapping.
pub fn parse_signed_integer(
    seq: &ByteChain,
) -> std::result::Result<(i64, u64), (ProtocolErrorKind, u64)> {
    parse_decimal(seq, true)
}

/// Parse the length form used by `$`, `*`, `%`, `~`, `>` and `=` headers.
/// The only legal negative value is `-1`, the null marker.
pub fn parse_prefixed_length(
    seq: &ByteChain,
) -> std::result::Result<(i64, u64), (ProtocolErrorKind, u64)> {
    let mut it = seq.bytes();
    if it.next() == Some(b'-') {
        return match (it.next(), it.next()) {
            (Some(b'1'), next) if !next.is_some_and(|b| b.is_ascii_digit()) => Ok((-1, 2)),
            _ => Err((ProtocolErrorKind::InvalidIntegerDigit, 1)),
        };
    }
    parse_decimal(seq, false)
}

fn parse_decimal(
    seq: &ByteChain,
    allow_sign: bool,
) -> std::result::Result<(i64, u64), (ProtocolErrorKind, u64)> {
    let mut it = seq.bytes().peekable();
    let mut consumed = 0u64;
    let negative = allow_sign && it.peek() == Some(&b'-');
    if negative {
        it.next();
        consumed += 1;
    }

    // Accumulate negated so that i64::MIN round-trips.
    let mut acc: i64 = 0;
    let mut digits = 0u64;
    let mut first_digit = 0u8;
    while let Some(&b) = it.peek() {
        if !b.is_ascii_digit() {
            break;
        }
        it.next();
        if digits == 0 {
            first_digit = b;
        }
        acc = acc
            .checked_mul(10)
            .and_then(|a| a.checked_sub(i64::from(b - b'0')))
            .ok_or((ProtocolErrorKind::IntegerOverflow, consumed))?;
        digits += 1;
        consumed += 1;
    }

    if digits == 0 {
        return Err((ProtocolErrorKind::InvalidIntegerDigit, consumed));
    }
    if first_digit == b'0' && digits > 1 {
        return Err((
            ProtocolErrorKind::InvalidIntegerDigit,
            consumed - digits,
        ));
    }

    let value = if negative {
        acc
    } else {
        acc.checked_neg()
            .ok_or((ProtocolErrorKind::IntegerOverflow, consumed - 1))?
    };
    Ok((value, consumed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn chain_of(parts: &[&[u8]]) -> ByteChain {
        let mut chain = ByteChain::new();
        for p in parts {
            chain.append(Bytes::copy_from_slice(p));
        }
        chain
    }

    fn read_one(input: &[u8]) -> (TokenKind, Vec<u8>) {
        let chain = ByteChain::from_bytes(Bytes::copy_from_slice(input));
        let mut cur = ChainCursor::new(&chain);
        let mut reader = RespReader::new();
        assert!(reader.try_read(&mut cur).unwrap(), "expected a full token");
        let kind = reader.kind().unwrap();
        let value = reader.value().to_bytes().to_vec();
        (kind, value)
    }

    fn protocol_kind(err: Error) -> ProtocolErrorKind {
        match err {
            Error::Protocol(p) => p.kind,
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn empty_simple_string() {
        let (kind, value) = read_one(b"+\r\n");
        assert_eq!(kind, TokenKind::SimpleString);
        assert!(value.is_empty());
    }

    #[test]
    fn error_token_carries_full_message() {
        let (kind, value) = read_one(b"-ERR unknown command 'foobar'\r\n");
        assert_eq!(kind, TokenKind::Error);
        assert_eq!(&value[..], b"ERR unknown command 'foobar'");
    }

    #[test]
    fn simple_string_fed_one_byte_at_a_time() {
        let input = b"+OK\r\n";
        let mut reader = RespReader::new();
        let mut chain = ByteChain::new();
        for (i, b) in input.iter().enumerate() {
            chain.append(Bytes::copy_from_slice(&[*b]));
            let mut cur = ChainCursor::new(&chain);
            let got = reader.try_read(&mut cur).unwrap();
            if i < input.len() - 1 {
                assert!(!got, "byte {i} should not complete the token");
                assert_eq!(cur.position(), 0, "cursor must not move on partial input");
            } else {
                assert!(got);
                assert_eq!(reader.kind(), Some(TokenKind::SimpleString));
                assert_eq!(&reader.value().to_bytes()[..], b"OK");
                assert_eq!(reader.bytes_consumed(), 5);
                assert_eq!(cur.position(), 5);
            }
        }
    }

    #[test]
    fn same_bytes_any_fragmentation_same_token() {
        let input: &[u8] = b"$12\r\nhello\r\nwild\r\n";
        for split in 1..input.len() - 1 {
            let chain = chain_of(&[&input[..split], &input[split..]]);
            let mut cur = ChainCursor::new(&chain);
            let mut reader = RespReader::new();
            assert!(reader.try_read(&mut cur).unwrap(), "split at {split}");
            assert_eq!(reader.kind(), Some(TokenKind::BulkStringHeader(12)));
            assert!(reader.try_read_bulk_string(&mut cur, 12).unwrap());
            assert_eq!(&reader.value().to_bytes()[..], b"hello\r\nwild");
            assert_eq!(reader.token().len(), 14);
        }
    }

    #[test]
    fn null_bulk_and_null_array() {
        assert_eq!(read_one(b"$-1\r\n").0, TokenKind::Null);
        assert_eq!(read_one(b"*-1\r\n").0, TokenKind::Null);
        assert_eq!(read_one(b"*0\r\n").0, TokenKind::ArrayHeader(0));
    }

    #[test]
    fn integer_boundaries() {
        let (kind, _) = read_one(b":9223372036854775807\r\n");
        assert_eq!(kind, TokenKind::Integer(i64::MAX));
        let (kind, _) = read_one(b":-9223372036854775808\r\n");
        assert_eq!(kind, TokenKind::Integer(i64::MIN));

        let chain = chain_of(&[b":9223372036854775808\r\n"]);
        let mut cur = ChainCursor::new(&chain);
        let err = RespReader::new().try_read(&mut cur).unwrap_err();
        assert_eq!(protocol_kind(err), ProtocolErrorKind::IntegerOverflow);
    }

    #[test]
    fn leading_zeros_rejected() {
        for input in [b"$01\r\n".as_slice(), b":00\r\n", b"*007\r\n"] {
            let chain = chain_of(&[input]);
            let mut cur = ChainCursor::new(&chain);
            let err = RespReader::new().try_read(&mut cur).unwrap_err();
            assert_eq!(protocol_kind(err), ProtocolErrorKind::InvalidIntegerDigit);
        }
    }

    #[test]
    fn only_minus_one_is_a_legal_negative_length() {
        let minus_one = ByteChain::from_bytes(Bytes::from_static(b"-1"));
        assert_eq!(parse_prefixed_length(&minus_one), Ok((-1, 2)));
        let minus_two = ByteChain::from_bytes(Bytes::from_static(b"-2"));
        assert_eq!(
            parse_prefixed_length(&minus_two),
            Err((ProtocolErrorKind::InvalidIntegerDigit, 1))
        );
        let minus_twelve = ByteChain::from_bytes(Bytes::from_static(b"-12"));
        assert_eq!(
            parse_prefixed_length(&minus_twelve),
            Err((ProtocolErrorKind::InvalidIntegerDigit, 1))
        );
    }

    #[test]
    fn parser_stops_at_non_digit_bytes() {
        let seq = ByteChain::from_bytes(Bytes::from_static(b"123abc"));
        assert_eq!(parse_signed_integer(&seq), Ok((123, 3)));
    }

    #[test]
    fn unexpected_control_byte() {
        let chain = chain_of(&[b"!oops\r\n"]);
        let mut cur = ChainCursor::new(&chain);
        let err = RespReader::new().try_read(&mut cur).unwrap_err();
        assert_eq!(
            protocol_kind(err),
            ProtocolErrorKind::UnexpectedControlByte(b'!')
        );
    }

    #[test]
    fn bare_cr_in_line_is_a_framing_error() {
        let chain = chain_of(&[b"+ab\rcd\r\n"]);
        let mut cur = ChainCursor::new(&chain);
        let err = RespReader::new().try_read(&mut cur).unwrap_err();
        assert_eq!(protocol_kind(err), ProtocolErrorKind::UnterminatedLine);
    }

    #[test]
    fn lenient_mode_accepts_cr_only_terminator() {
        let chain = chain_of(&[b"+OK\rX"]);
        let mut cur = ChainCursor::new(&chain);
        let mut reader = RespReader::lenient();
        assert!(reader.try_read(&mut cur).unwrap());
        assert_eq!(reader.kind(), Some(TokenKind::SimpleString));
        assert_eq!(&reader.value().to_bytes()[..], b"OK");
        assert_eq!(cur.position(), 4);
    }

    #[test]
    fn bulk_payload_must_end_with_crlf() {
        let chain = chain_of(&[b"abcXY"]);
        let mut cur = ChainCursor::new(&chain);
        let err = RespReader::new()
            .try_read_bulk_string(&mut cur, 3)
            .unwrap_err();
        match err {
            Error::Protocol(p) => {
                assert_eq!(p.kind, ProtocolErrorKind::UnterminatedBulkString);
                assert_eq!(p.byte_offset, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bulk_length_bounds() {
        let chain = chain_of(&[b""]);
        let mut cur = ChainCursor::new(&chain);
        let mut reader = RespReader::new();
        assert!(matches!(
            reader.try_read_bulk_string(&mut cur, -1),
            Err(Error::ArgumentOutOfRange(_))
        ));
        assert!(matches!(
            reader.try_read_bulk_string(&mut cur, MAX_BULK_LEN + 1),
            Err(Error::ArgumentOutOfRange(_))
        ));
    }

    #[test]
    fn bulk_payload_waits_for_terminator_bytes() {
        // Payload present but CRLF not yet arrived: need more, cursor pinned.
        let chain = chain_of(&[b"abc"]);
        let mut cur = ChainCursor::new(&chain);
        let mut reader = RespReader::new();
        assert!(!reader.try_read_bulk_string(&mut cur, 3).unwrap());
        assert_eq!(cur.position(), 0);
    }

    #[test]
    fn resp3_tokens() {
        assert_eq!(read_one(b"%2\r\n").0, TokenKind::MapHeader(2));
        assert_eq!(read_one(b"~5\r\n").0, TokenKind::SetHeader(5));
        assert_eq!(read_one(b">3\r\n").0, TokenKind::PushHeader(3));
        assert_eq!(read_one(b"#t\r\n").0, TokenKind::Boolean(true));
        assert_eq!(read_one(b"#f\r\n").0, TokenKind::Boolean(false));
        assert_eq!(read_one(b",3.25\r\n").0, TokenKind::Double(3.25));
        assert_eq!(read_one(b",-inf\r\n").0, TokenKind::Double(f64::NEG_INFINITY));
        assert_eq!(read_one(b"=8\r\n").0, TokenKind::VerbatimStringHeader(8));

        let (kind, value) = read_one(b"(3492890328409238509324850943850943825024385\r\n");
        assert_eq!(kind, TokenKind::BigNumber);
        assert_eq!(&value[..], b"3492890328409238509324850943850943825024385");
    }

    #[test]
    fn null_map_header_is_rejected() {
        let chain = chain_of(&[b"%-1\r\n"]);
        let mut cur = ChainCursor::new(&chain);
        let err = RespReader::new().try_read(&mut cur).unwrap_err();
        assert_eq!(protocol_kind(err), ProtocolErrorKind::UnexpectedNull);
    }

    #[test]
    fn consumed_counter_spans_multiple_tokens() {
        let chain = chain_of(&[b"+OK\r\n:42\r\n$2\r\nhi\r\n"]);
        let mut cur = ChainCursor::new(&chain);
        let mut reader = RespReader::new();
        assert!(reader.try_read(&mut cur).unwrap());
        assert!(reader.try_read(&mut cur).unwrap());
        assert_eq!(reader.kind(), Some(TokenKind::Integer(42)));
        assert!(reader.try_read(&mut cur).unwrap());
        assert!(reader.try_read_bulk_string(&mut cur, 2).unwrap());
        assert_eq!(reader.bytes_consumed(), 18);

        reader.reset();
        assert_eq!(reader.bytes_consumed(), 0);
        assert_eq!(reader.kind(), None);
    }

    #[test]
    fn token_and_value_spans_line_up() {
        let chain = chain_of(&[b"$8\r\nabc\r", b"\n123\r\n"]);
        let mut cur = ChainCursor::new(&chain);
        let mut reader = RespReader::new();
        assert!(reader.try_read(&mut cur).unwrap());
        assert_eq!(reader.token().len(), 4);
        assert!(reader.try_read_bulk_string(&mut cur, 8).unwrap());
        assert_eq!(&reader.value().to_bytes()[..], b"abc\r\n123");
        assert_eq!(reader.value().len(), 8);
        assert_eq!(reader.token().len(), 10);
    }
}
