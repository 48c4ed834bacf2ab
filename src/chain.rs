use std::cmp::Ordering;
use std::io::IoSlice;

use bytes::{Bytes, BytesMut};

/// One link in a [`ByteChain`]: a reference-counted buffer plus the absolute
/// offset of its first byte within the logical stream.
#[derive(Debug, Clone)]
struct Segment {
    data: Bytes,
    run: u64,
}

/// An ordered run of buffer segments forming one logical byte sequence.
///
/// Segments are `Bytes` handles, so appending, slicing, and cloning never copy
/// payload bytes; the underlying storage stays alive for as long as any view
/// into it does. Offsets are absolute stream positions (`start()..end()`),
/// which keeps positions taken from one view comparable against any other view
/// of the same stream.
#[derive(Debug, Clone, Default)]
pub struct ByteChain {
    segments: Vec<Segment>,
    start: u64,
    end: u64,
}

impl ByteChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty chain whose first appended byte will sit at `origin`.
    pub fn with_origin(origin: u64) -> Self {
        Self {
            segments: Vec::new(),
            start: origin,
            end: origin,
        }
    }

    pub fn from_bytes(data: Bytes) -> Self {
        let mut chain = Self::new();
        chain.append(data);
        chain
    }

    /// Links `data` at the tail. Empty buffers are dropped rather than linked
    /// so every segment is guaranteed non-empty.
    pub fn append(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let run = self.end;
        self.end += data.len() as u64;
        self.segments.push(Segment { data, run });
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    fn locate(&self, abs: u64) -> Option<(usize, usize)> {
        if abs < self.start || abs >= self.end {
            return None;
        }
        let idx = self
            .segments
            .binary_search_by(|seg| {
                if abs < seg.run {
                    Ordering::Greater
                } else if abs >= seg.run + seg.data.len() as u64 {
                    Ordering::Less
                } else {
                    Ordering::Equal
                }
            })
            .ok()?;
        Some((idx, (abs - self.segments[idx].run) as usize))
    }

    /// The byte at absolute position `abs`, if it lies within the chain.
    pub fn byte_at(&self, abs: u64) -> Option<u8> {
        let (idx, off) = self.locate(abs)?;
        Some(self.segments[idx].data[off])
    }

    /// A sub-view covering `start..end`. O(number of spanned segments); the
    /// result shares storage with `self` and keeps absolute offsets.
    pub fn slice(&self, start: u64, end: u64) -> ByteChain {
        assert!(
            start >= self.start && end <= self.end && start <= end,
            "slice {start}..{end} out of bounds for chain {}..{}",
            self.start,
            self.end
        );
        let mut out = ByteChain::with_origin(start);
        if start == end {
            return out;
        }
        let Some((mut idx, mut off)) = self.locate(start) else {
            return out;
        };
        let mut remaining = end - start;
        while remaining > 0 {
            let seg = &self.segments[idx];
            let take = ((seg.data.len() - off) as u64).min(remaining) as usize;
            out.append(seg.data.slice(off..off + take));
            remaining -= take as u64;
            idx += 1;
            off = 0;
        }
        out
    }

    /// Absolute position of the first `needle` at or after `from`.
    pub fn find_byte(&self, needle: u8, from: u64) -> Option<u64> {
        let (mut idx, mut off) = self.locate(from)?;
        let mut abs = from;
        while idx < self.segments.len() {
            for &b in &self.segments[idx].data[off..] {
                if b == needle {
                    return Some(abs);
                }
                abs += 1;
            }
            idx += 1;
            off = 0;
        }
        None
    }

    /// Absolute position of the `\r` of the first CRLF pair at or after
    /// `from`. The pair may straddle a segment boundary.
    pub fn find_crlf(&self, from: u64) -> Option<u64> {
        let (mut idx, mut off) = self.locate(from)?;
        let mut abs = from;
        let mut prev_cr = false;
        while idx < self.segments.len() {
            for &b in &self.segments[idx].data[off..] {
                if prev_cr && b == b'\n' {
                    return Some(abs - 1);
                }
                prev_cr = b == b'\r';
                abs += 1;
            }
            idx += 1;
            off = 0;
        }
        None
    }

    /// Iterate the bytes of the chain in stream order.
    pub fn bytes(&self) -> impl Iterator<Item = u8> + '_ {
        self.segments
            .iter()
            .flat_map(|seg| seg.data.iter().copied())
    }

    /// Collapse the view into one contiguous buffer. A single-segment chain
    /// is returned as a handle clone without copying.
    pub fn to_bytes(&self) -> Bytes {
        match self.segments.len() {
            0 => Bytes::new(),
            1 => self.segments[0].data.clone(),
            _ => {
                let mut buf = BytesMut::with_capacity(self.len() as usize);
                for seg in &self.segments {
                    buf.extend_from_slice(&seg.data);
                }
                buf.freeze()
            }
        }
    }

    /// Borrow every segment as an `IoSlice`, ready for one vectored write.
    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        self.segments
            .iter()
            .map(|seg| IoSlice::new(&seg.data))
            .collect()
    }
}

/// A forward-only read position over a [`ByteChain`].
///
/// The cursor is advanced by the decoder only once a whole token has been
/// recognized, so a cursor position is always a token boundary.
#[derive(Debug, Clone)]
pub struct ChainCursor<'a> {
    chain: &'a ByteChain,
    pos: u64,
}

impl<'a> ChainCursor<'a> {
    pub fn new(chain: &'a ByteChain) -> Self {
        Self {
            chain,
            pos: chain.start(),
        }
    }

    /// A cursor starting at an arbitrary position within the chain.
    pub fn at(chain: &'a ByteChain, pos: u64) -> Self {
        assert!(
            pos >= chain.start() && pos <= chain.end(),
            "cursor position {pos} out of bounds for chain {}..{}",
            chain.start(),
            chain.end()
        );
        Self { chain, pos }
    }

    pub fn chain(&self) -> &'a ByteChain {
        self.chain
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn remaining(&self) -> u64 {
        self.chain.end() - self.pos
    }

    pub fn peek(&self) -> Option<u8> {
        self.chain.byte_at(self.pos)
    }

    pub fn advance(&mut self, n: u64) {
        assert!(
            self.pos + n <= self.chain.end(),
            "advance past end of chain"
        );
        self.pos += n;
    }

    /// Everything from the start of the chain up to the cursor.
    pub fn consumed_prefix(&self) -> ByteChain {
        self.chain.slice(self.chain.start(), self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_of(parts: &[&[u8]]) -> ByteChain {
        let mut chain = ByteChain::new();
        for p in parts {
            chain.append(Bytes::copy_from_slice(p));
        }
        chain
    }

    #[test]
    fn running_indices_accumulate() {
        let chain = chain_of(&[b"abc", b"", b"defg", b"h"]);
        assert_eq!(chain.len(), 8);
        assert_eq!(chain.byte_at(0), Some(b'a'));
        assert_eq!(chain.byte_at(3), Some(b'd'));
        assert_eq!(chain.byte_at(7), Some(b'h'));
        assert_eq!(chain.byte_at(8), None);
    }

    #[test]
    fn slice_spans_segment_boundaries() {
        let chain = chain_of(&[b"hel", b"lo wo", b"rld"]);
        let sub = chain.slice(2, 9);
        assert_eq!(sub.start(), 2);
        assert_eq!(sub.end(), 9);
        assert_eq!(&sub.to_bytes()[..], b"llo wor");
        // Offsets in the sub-view stay absolute.
        assert_eq!(sub.byte_at(2), Some(b'l'));
        assert_eq!(sub.byte_at(8), Some(b'r'));
    }

    #[test]
    fn empty_slice_is_allowed() {
        let chain = chain_of(&[b"xyz"]);
        let sub = chain.slice(1, 1);
        assert!(sub.is_empty());
        assert_eq!(sub.start(), 1);
    }

    #[test]
    fn crlf_found_across_boundary() {
        let chain = chain_of(&[b"+OK\r", b"\nrest"]);
        assert_eq!(chain.find_crlf(0), Some(3));
        // A lone CR does not match.
        let lone = chain_of(&[b"ab\rcd"]);
        assert_eq!(lone.find_crlf(0), None);
    }

    #[test]
    fn find_byte_starts_at_offset() {
        let chain = chain_of(&[b"a\rb", b"\rc"]);
        assert_eq!(chain.find_byte(b'\r', 0), Some(1));
        assert_eq!(chain.find_byte(b'\r', 2), Some(3));
        assert_eq!(chain.find_byte(b'\r', 4), None);
    }

    #[test]
    fn to_bytes_single_segment_shares_storage() {
        let data = Bytes::from_static(b"payload");
        let chain = ByteChain::from_bytes(data.clone());
        let out = chain.to_bytes();
        // Same allocation, not a copy.
        assert_eq!(out.as_ptr(), data.as_ptr());
    }

    #[test]
    fn cursor_tracks_consumed_prefix() {
        let chain = chain_of(&[b"12", b"345"]);
        let mut cur = ChainCursor::new(&chain);
        cur.advance(3);
        assert_eq!(cur.position(), 3);
        assert_eq!(cur.remaining(), 2);
        assert_eq!(&cur.consumed_prefix().to_bytes()[..], b"123");
        assert_eq!(cur.peek(), Some(b'4'));
    }

    #[test]
    fn origin_offsets_are_respected() {
        let mut chain = ByteChain::with_origin(100);
        chain.append(Bytes::from_static(b"ab"));
        chain.append(Bytes::from_static(b"cd"));
        assert_eq!(chain.start(), 100);
        assert_eq!(chain.end(), 104);
        assert_eq!(chain.byte_at(102), Some(b'c'));
        let sub = chain.slice(101, 103);
        assert_eq!(&sub.to_bytes()[..], b"bc");
    }
}
