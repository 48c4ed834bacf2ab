use bytes::Bytes;

use crate::chain::ByteChain;
use crate::decode::TokenKind;
use crate::error::{ProtocolError, ProtocolErrorKind, Result};

/// One complete RESP value as surfaced to callers.
///
/// Payload-bearing variants hold `Bytes`, so a reply assembled from a
/// single-segment receive buffer shares storage with it instead of copying.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Simple(Bytes),
    Error(Bytes),
    Integer(i64),
    Bulk(Bytes),
    Null,
    Array(Vec<Reply>),
    Map(Vec<(Reply, Reply)>),
    Set(Vec<Reply>),
    Push(Vec<Reply>),
    Double(f64),
    Boolean(bool),
    BigNumber(Bytes),
    Verbatim { format: [u8; 3], text: Bytes },
}

impl Reply {
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// The textual payload of a string-ish reply.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::Simple(b) | Reply::Error(b) | Reply::Bulk(b) | Reply::BigNumber(b) => Some(b),
            Reply::Verbatim { text, .. } => Some(text),
            _ => None,
        }
    }

    /// Look up `key` in a map reply, or in the flattened key/value array
    /// shape RESP2 servers use where RESP3 would send a map (HELLO does
    /// this).
    pub fn lookup(&self, key: &[u8]) -> Option<&Reply> {
        match self {
            Reply::Map(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_bytes() == Some(key))
                .map(|(_, v)| v),
            Reply::Array(items) => items
                .chunks_exact(2)
                .find(|pair| pair[0].as_bytes() == Some(key))
                .map(|pair| &pair[1]),
            _ => None,
        }
    }
}

enum FrameKind {
    Array,
    Map,
    Set,
    Push,
}

struct Frame {
    kind: FrameKind,
    items: Vec<Reply>,
    remaining: u64,
}

impl Frame {
    fn finish(self) -> Reply {
        match self.kind {
            FrameKind::Array => Reply::Array(self.items),
            FrameKind::Set => Reply::Set(self.items),
            FrameKind::Push => Reply::Push(self.items),
            FrameKind::Map => {
                let mut pairs = Vec::with_capacity(self.items.len() / 2);
                let mut it = self.items.into_iter();
                while let (Some(k), Some(v)) = (it.next(), it.next()) {
                    pairs.push((k, v));
                }
                Reply::Map(pairs)
            }
        }
    }
}

/// What the assembler needs next.
#[derive(Debug, PartialEq)]
pub enum BuildStep {
    /// Feed the next decoded token.
    NeedToken,
    /// The last token announced a payload of this many bytes; read it with
    /// `try_read_bulk_string` and feed the resulting token.
    NeedBulkPayload(i64),
    /// A complete top-level value.
    Complete(Reply),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Awaiting {
    Bulk,
    Verbatim,
}

/// Folds a stream of decoder tokens into a [`Reply`] tree.
///
/// The builder tracks open containers by their remaining element count, so
/// the caller only loops `try_read` → `offer` until [`BuildStep::Complete`].
#[derive(Default)]
pub struct ReplyBuilder {
    stack: Vec<Frame>,
    awaiting: Option<Awaiting>,
}

impl ReplyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&mut self, kind: TokenKind, value: &ByteChain) -> Result<BuildStep> {
        if let Some(mode) = self.awaiting {
            debug_assert_eq!(kind, TokenKind::BulkString, "payload token expected");
            self.awaiting = None;
            let payload = value.to_bytes();
            let reply = match mode {
                Awaiting::Bulk => Reply::Bulk(payload),
                Awaiting::Verbatim => split_verbatim(payload),
            };
            return Ok(self.push_value(reply));
        }

        let step = match kind {
            TokenKind::SimpleString => self.push_value(Reply::Simple(value.to_bytes())),
            TokenKind::Error => self.push_value(Reply::Error(value.to_bytes())),
            TokenKind::Integer(i) => self.push_value(Reply::Integer(i)),
            TokenKind::Null => self.push_value(Reply::Null),
            TokenKind::Double(d) => self.push_value(Reply::Double(d)),
            TokenKind::Boolean(b) => self.push_value(Reply::Boolean(b)),
            TokenKind::BigNumber => self.push_value(Reply::BigNumber(value.to_bytes())),
            TokenKind::BulkStringHeader(n) => {
                self.awaiting = Some(Awaiting::Bulk);
                BuildStep::NeedBulkPayload(n)
            }
            TokenKind::VerbatimStringHeader(n) => {
                self.awaiting = Some(Awaiting::Verbatim);
                BuildStep::NeedBulkPayload(n)
            }
            TokenKind::ArrayHeader(n) => self.open_container(FrameKind::Array, n)?,
            TokenKind::SetHeader(n) => self.open_container(FrameKind::Set, n)?,
            TokenKind::PushHeader(n) => self.open_container(FrameKind::Push, n)?,
            TokenKind::MapHeader(n) => {
                // A map of n pairs holds 2n element tokens.
                self.open_container(FrameKind::Map, n.saturating_mul(2))?
            }
            TokenKind::BulkString => {
                // A payload token with no announcing header.
                return Err(ProtocolError::new(
                    ProtocolErrorKind::UnexpectedControlByte(b'$'),
                    0,
                )
                .into());
            }
        };
        Ok(step)
    }

    fn open_container(&mut self, kind: FrameKind, n: i64) -> Result<BuildStep> {
        if n < 0 {
            return Err(ProtocolError::new(ProtocolErrorKind::LengthOutOfRange, 1).into());
        }
        if n == 0 {
            let empty = Frame {
                kind,
                items: Vec::new(),
                remaining: 0,
            };
            return Ok(self.push_value(empty.finish()));
        }
        self.stack.push(Frame {
            kind,
            items: Vec::with_capacity(n.min(64) as usize),
            remaining: n as u64,
        });
        Ok(BuildStep::NeedToken)
    }

    fn push_value(&mut self, mut value: Reply) -> BuildStep {
        loop {
            match self.stack.last_mut() {
                None => return BuildStep::Complete(value),
                Some(frame) => {
                    frame.items.push(value);
                    frame.remaining -= 1;
                    if frame.remaining > 0 {
                        return BuildStep::NeedToken;
                    }
                    // Container closed; it becomes a value for its parent.
                    value = match self.stack.pop() {
                        Some(done) => done.finish(),
                        None => return BuildStep::NeedToken,
                    };
                }
            }
        }
    }
}

/// A verbatim payload is `xxx:<text>` with a 3-byte encoding tag. Payloads
/// that do not match the shape are kept whole under the default `txt` tag.
fn split_verbatim(payload: Bytes) -> Reply {
    if payload.len() >= 4 && payload[3] == b':' {
        let mut format = [0u8; 3];
        format.copy_from_slice(&payload[..3]);
        Reply::Verbatim {
            format,
            text: payload.slice(4..),
        }
    } else {
        Reply::Verbatim {
            format: *b"txt",
            text: payload,
        }
    }
}
