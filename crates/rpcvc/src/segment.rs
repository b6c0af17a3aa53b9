//! Segment chains for byte-stream reassembly.
//!
//! Bytes arrive from the stream in fixed-capacity segments. A [`SegmentChain`]
//! strings them together in arrival order and lets the framing engine move an
//! exact number of bytes from one chain to another without copying payload:
//! [`SegmentChain::split_to`] cuts at any offset, splitting the straddling
//! segment into two cursors over the same shared buffer.

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};

/// Capacity of a single receive segment.
pub const SEGMENT_CAPACITY: usize = 2048;

/// Allocate an empty, zero-filled receive segment.
pub fn receive_buffer() -> BytesMut {
    BytesMut::zeroed(SEGMENT_CAPACITY)
}

/// One buffer plus a `(offset, len)` cursor into it.
///
/// Cloning a segment is cheap: the underlying buffer is reference counted.
#[derive(Debug, Clone)]
pub struct Segment {
    buf: Bytes,
    off: usize,
    len: usize,
}

impl Segment {
    pub fn new(buf: Bytes) -> Self {
        let len = buf.len();
        Self { buf, off: 0, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.off..self.off + self.len]
    }

    /// Split at `at`, returning the first `at` bytes and leaving the rest in `self`.
    fn split_to(&mut self, at: usize) -> Segment {
        debug_assert!(at <= self.len);
        let head = Segment {
            buf: self.buf.clone(),
            off: self.off,
            len: at,
        };
        self.off += at;
        self.len -= at;
        head
    }

    fn advance(&mut self, cnt: usize) {
        debug_assert!(cnt <= self.len);
        self.off += cnt;
        self.len -= cnt;
    }

    fn into_bytes(self) -> Bytes {
        self.buf.slice(self.off..self.off + self.len)
    }
}

/// Ordered chain of segments owned by exactly one transport.
#[derive(Debug, Clone, Default)]
pub struct SegmentChain {
    segs: VecDeque<Segment>,
    len: usize,
}

impl SegmentChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of bytes across all segments.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn segment_count(&self) -> usize {
        self.segs.len()
    }

    /// Append a freshly received buffer. Empty buffers are dropped.
    pub fn push(&mut self, buf: Bytes) {
        if buf.is_empty() {
            return;
        }
        self.len += buf.len();
        self.segs.push_back(Segment::new(buf));
    }

    /// Move every segment of `other` onto the end of this chain.
    pub fn append(&mut self, mut other: SegmentChain) {
        self.len += other.len;
        other.len = 0;
        self.segs.append(&mut other.segs);
    }

    /// Detach the first `at` bytes into a new chain.
    ///
    /// # Panics
    ///
    /// Panics if `at > self.len()`, like [`Bytes::split_to`].
    pub fn split_to(&mut self, at: usize) -> SegmentChain {
        assert!(
            at <= self.len,
            "split_to out of bounds: {at} > {}",
            self.len
        );

        let mut head = SegmentChain::new();
        let mut want = at;
        while want > 0 {
            let Some(front) = self.segs.front_mut() else {
                break;
            };
            if front.len() <= want {
                want -= front.len();
                if let Some(seg) = self.segs.pop_front() {
                    head.len += seg.len();
                    head.segs.push_back(seg);
                }
            } else {
                let seg = front.split_to(want);
                head.len += seg.len();
                head.segs.push_back(seg);
                want = 0;
            }
        }
        self.len -= at;
        head
    }

    /// Read a big-endian `u32` from the front without consuming it.
    ///
    /// Returns `None` when fewer than four bytes are queued. The value may
    /// straddle any number of segment boundaries.
    pub fn peek_u32_be(&self) -> Option<u32> {
        if self.len < 4 {
            return None;
        }
        let mut word = [0u8; 4];
        let mut filled = 0;
        for seg in &self.segs {
            let take = (4 - filled).min(seg.len());
            word[filled..filled + take].copy_from_slice(&seg.as_slice()[..take]);
            filled += take;
            if filled == 4 {
                break;
            }
        }
        Some(u32::from_be_bytes(word))
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.segs.clear();
        self.len = 0;
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segs.iter()
    }

    /// Consume the chain into its segment slices, in order.
    pub fn into_slices(self) -> Vec<Bytes> {
        self.segs.into_iter().map(Segment::into_bytes).collect()
    }

    /// Flatten into one contiguous buffer. Free when the chain is a single segment.
    pub fn into_contiguous(mut self) -> Bytes {
        if self.segs.len() == 1
            && let Some(seg) = self.segs.pop_front()
        {
            return seg.into_bytes();
        }
        let len = self.len;
        self.copy_to_bytes(len)
    }
}

impl Buf for SegmentChain {
    fn remaining(&self) -> usize {
        self.len
    }

    fn chunk(&self) -> &[u8] {
        self.segs.front().map(Segment::as_slice).unwrap_or(&[])
    }

    fn advance(&mut self, mut cnt: usize) {
        assert!(cnt <= self.len, "advance out of bounds");
        self.len -= cnt;
        while cnt > 0 {
            let Some(front) = self.segs.front_mut() else {
                break;
            };
            if front.len() <= cnt {
                cnt -= front.len();
                self.segs.pop_front();
            } else {
                front.advance(cnt);
                cnt = 0;
            }
        }
    }
}

impl From<Bytes> for SegmentChain {
    fn from(buf: Bytes) -> Self {
        let mut chain = SegmentChain::new();
        chain.push(buf);
        chain
    }
}
