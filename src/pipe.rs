use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::Notify;

use crate::chain::ByteChain;

/// Default capacity used by the connection runtime for both directions.
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

const MIN_MEMORY_HINT: usize = 512;

/// Result of a writer-side flush.
#[derive(Debug, Clone, Copy)]
pub struct FlushOutcome {
    pub is_completed: bool,
    pub is_canceled: bool,
}

/// Result of a reader-side read: a stable view over every currently readable
/// byte. Subsequent reads return the same bytes until the reader advances.
#[derive(Debug)]
pub struct ReadOutcome {
    pub buffer: ByteChain,
    pub is_completed: bool,
    pub is_canceled: bool,
}

#[derive(Debug, Default)]
struct PipeState {
    segments: VecDeque<Bytes>,
    /// Readable bytes across all segments.
    buffered: usize,
    /// Absolute stream offset of the first unread byte.
    read_base: u64,
    completed: bool,
    writer_canceled: bool,
    reader_canceled: bool,
}

impl PipeState {
    fn canceled(&self) -> bool {
        self.writer_canceled || self.reader_canceled
    }
}

#[derive(Debug)]
struct Shared {
    capacity: usize,
    state: Mutex<PipeState>,
    data_ready: Notify,
    space_ready: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A bounded single-producer/single-consumer byte pipe.
///
/// The writer stages bytes in a private scratch buffer (`get_memory` +
/// `advance`), then `flush` publishes them as one refcounted segment and
/// suspends while the pipe is over capacity. The reader sees all published
/// bytes as one [`ByteChain`] and releases them with `advance_to`, which is
/// what allows the writer to make progress again.
pub fn byte_pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Shared {
        capacity,
        state: Mutex::new(PipeState::default()),
        data_ready: Notify::new(),
        space_ready: Notify::new(),
    });
    (
        PipeWriter {
            shared: Arc::clone(&shared),
            scratch: BytesMut::new(),
            committed: 0,
        },
        PipeReader { shared },
    )
}

#[derive(Debug)]
pub struct PipeWriter {
    shared: Arc<Shared>,
    scratch: BytesMut,
    committed: usize,
}

impl PipeWriter {
    /// A writable region of at least `min_hint` bytes. The region stays owned
    /// by the pipe; commit written bytes with [`advance`](Self::advance).
    pub fn get_memory(&mut self, min_hint: usize) -> &mut [u8] {
        let hint = min_hint.max(MIN_MEMORY_HINT);
        let start = self.committed;
        // Drop any previously staged region that was never advanced.
        self.scratch.truncate(start);
        self.scratch.resize(start + hint, 0);
        &mut self.scratch[start..]
    }

    /// Mark `n` staged bytes as written and ready to flush.
    pub fn advance(&mut self, n: usize) {
        assert!(
            self.committed + n <= self.scratch.len(),
            "advance past the end of the staged region"
        );
        self.committed += n;
    }

    /// Publish staged bytes to the reader, then wait while the pipe is over
    /// capacity. Returns with `is_canceled` set if either side canceled.
    pub async fn flush(&mut self) -> FlushOutcome {
        let segment = if self.committed > 0 {
            let seg = self.scratch.split_to(self.committed).freeze();
            self.committed = 0;
            Some(seg)
        } else {
            None
        };

        {
            let mut st = self.shared.lock();
            if let Some(seg) = segment {
                if !st.reader_canceled {
                    st.buffered += seg.len();
                    st.segments.push_back(seg);
                }
            }
        }
        self.shared.data_ready.notify_one();

        loop {
            let space = self.shared.space_ready.notified();
            {
                let st = self.shared.lock();
                if st.buffered <= self.shared.capacity || st.canceled() {
                    return FlushOutcome {
                        is_completed: st.completed,
                        is_canceled: st.canceled(),
                    };
                }
            }
            space.await;
        }
    }

    /// Mark the write side closed. The reader drains remaining bytes and then
    /// observes `is_completed`.
    pub fn complete(&mut self) {
        let mut st = self.shared.lock();
        st.completed = true;
        drop(st);
        self.shared.data_ready.notify_one();
    }

    /// Unblock both sides with the canceled flag set.
    pub fn cancel(&mut self) {
        let mut st = self.shared.lock();
        st.writer_canceled = true;
        drop(st);
        self.shared.data_ready.notify_one();
        self.shared.space_ready.notify_one();
    }
}

/// The send pipe doubles as the encoder's sink: tokens append past the
/// committed prefix and become flushable only when the encoder commits, so a
/// pipe flush never ships half a token.
impl crate::encode::ByteSink for PipeWriter {
    fn scratch(&mut self, hint: usize) -> &mut BytesMut {
        self.scratch.reserve(hint);
        &mut self.scratch
    }

    fn commit(&mut self) {
        self.committed = self.scratch.len();
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Debug)]
pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    /// Wait until at least one byte is readable (or the pipe completed or
    /// canceled) and return a view over everything currently buffered.
    pub async fn read(&mut self) -> ReadOutcome {
        let base = self.shared.lock().read_base;
        self.read_past(base).await
    }

    /// Like [`read`](Self::read), but waits until bytes exist beyond stream
    /// position `position`. This is how a decoder stuck on a partial token
    /// asks for input it has not already seen.
    pub async fn read_past(&mut self, position: u64) -> ReadOutcome {
        loop {
            let data = self.shared.data_ready.notified();
            {
                let st = self.shared.lock();
                let end = st.read_base + st.buffered as u64;
                if end > position || st.completed || st.canceled() {
                    let mut chain = ByteChain::with_origin(st.read_base);
                    for seg in &st.segments {
                        chain.append(seg.clone());
                    }
                    return ReadOutcome {
                        buffer: chain,
                        is_completed: st.completed,
                        is_canceled: st.canceled(),
                    };
                }
            }
            data.await;
        }
    }

    /// Release every byte below stream position `position`, reclaiming pipe
    /// capacity. Views handed out earlier remain valid; they hold their own
    /// references to the released segments.
    pub fn advance_to(&mut self, position: u64) {
        let mut st = self.shared.lock();
        let end = st.read_base + st.buffered as u64;
        assert!(
            position >= st.read_base && position <= end,
            "advance_to {position} outside the readable range {}..{end}",
            st.read_base
        );
        let mut n = (position - st.read_base) as usize;
        st.read_base = position;
        st.buffered -= n;
        while n > 0 {
            let Some(front) = st.segments.front_mut() else {
                break;
            };
            if front.len() <= n {
                n -= front.len();
                st.segments.pop_front();
            } else {
                front.advance(n);
                n = 0;
            }
        }
        drop(st);
        self.shared.space_ready.notify_one();
    }

    /// Unblock both sides with the canceled flag set.
    pub fn cancel(&mut self) {
        let mut st = self.shared.lock();
        st.reader_canceled = true;
        drop(st);
        self.shared.data_ready.notify_one();
        self.shared.space_ready.notify_one();
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.cancel();
    }
}
