//! Bounded scrollback storage addressed by absolute byte sequence numbers.
//!
//! Every byte a PTY ever produced has a sequence number. The buffer retains
//! the most recent `capacity` bytes: `tail` is the sequence of the oldest
//! retained byte and `head` is one past the newest. Evicted bytes are gone
//! for good, and readers asking for them are told so.
//!
//! Output is kept as immutable shared segments. [`ScrollbackBuffer::snapshot`]
//! only clones segment handles, so a reader can take one under the writer's
//! lock and copy bytes after releasing it.

use std::collections::VecDeque;
use std::sync::Arc;

/// Default per-PTY capacity (512 KiB).
pub const DEFAULT_SCROLLBACK_BYTES: usize = 512 * 1024;

/// Small appends are merged into the newest segment up to this size.
const SEGMENT_BYTES: usize = 4096;

/// Result of reading a range out of the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRead {
    /// Sequence number of the first byte in `bytes`.
    pub start: u64,
    pub bytes: Vec<u8>,
    /// True when part of the requested range had already been evicted.
    pub truncated: bool,
}

impl RangeRead {
    /// Sequence one past the last byte returned.
    pub fn end(&self) -> u64 {
        self.start + self.bytes.len() as u64
    }
}

/// An immutable run of output starting at sequence `start`.
#[derive(Debug, Clone)]
struct Segment {
    start: u64,
    data: Arc<[u8]>,
}

impl Segment {
    fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }
}

/// Append-only segment ring with head/tail sequence cursors.
#[derive(Debug, Clone)]
pub struct ScrollbackBuffer {
    segments: VecDeque<Segment>,
    capacity: usize,
    tail: u64,
    head: u64,
}

impl ScrollbackBuffer {
    /// Create an empty buffer. A zero capacity is bumped to one byte.
    pub fn new(capacity: usize) -> Self {
        Self {
            segments: VecDeque::new(),
            capacity: capacity.max(1),
            tail: 0,
            head: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sequence of the oldest retained byte.
    pub fn tail(&self) -> u64 {
        self.tail
    }

    /// Sequence one past the most recent byte (total bytes ever appended).
    pub fn head(&self) -> u64 {
        self.head
    }

    /// Number of retained bytes.
    pub fn len(&self) -> usize {
        (self.head - self.tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Append a chunk, evicting from the tail once over capacity.
    ///
    /// Returns the sequence number assigned to the first byte of `data`.
    pub fn append(&mut self, data: &[u8]) -> u64 {
        let start = self.head;
        if data.is_empty() {
            return start;
        }
        self.head += data.len() as u64;

        if data.len() >= self.capacity {
            // Only the last `capacity` bytes of this chunk survive.
            let keep_from = data.len() - self.capacity;
            self.segments.clear();
            self.tail = start + keep_from as u64;
            self.segments.push_back(Segment {
                start: self.tail,
                data: Arc::from(&data[keep_from..]),
            });
            return start;
        }

        match self.segments.back_mut() {
            Some(last) if last.data.len() + data.len() <= SEGMENT_BYTES => {
                let mut merged = Vec::with_capacity(last.data.len() + data.len());
                merged.extend_from_slice(&last.data);
                merged.extend_from_slice(data);
                last.data = Arc::from(merged);
            }
            _ => self.segments.push_back(Segment {
                start,
                data: Arc::from(data),
            }),
        }

        self.tail = self.tail.max(self.head.saturating_sub(self.capacity as u64));
        while self
            .segments
            .front()
            .is_some_and(|segment| segment.end() <= self.tail)
        {
            self.segments.pop_front();
        }
        start
    }

    /// Cheap point-in-time view of the retained bytes.
    pub fn snapshot(&self) -> ScrollbackSnapshot {
        ScrollbackSnapshot {
            segments: self.segments.iter().cloned().collect(),
            tail: self.tail,
            head: self.head,
        }
    }

    /// Read every retained byte from `from` up to `head`.
    ///
    /// `truncated` is set when `from` predates the tail; the read then starts
    /// at the tail. Asking past the head yields an empty read at the head.
    pub fn read_range(&self, from: u64) -> RangeRead {
        collect(self.segments.iter(), self.tail, self.head, from, self.head)
    }
}

impl Default for ScrollbackBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_SCROLLBACK_BYTES)
    }
}

/// The retained bytes of a [`ScrollbackBuffer`] at one instant.
///
/// Later appends and evictions do not affect it.
#[derive(Debug, Clone)]
pub struct ScrollbackSnapshot {
    segments: Vec<Segment>,
    tail: u64,
    head: u64,
}

impl ScrollbackSnapshot {
    pub fn tail(&self) -> u64 {
        self.tail
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    /// Same as [`ScrollbackBuffer::read_range`] at the snapshot's instant.
    pub fn read_range(&self, from: u64) -> RangeRead {
        self.read_between(from, self.head)
    }

    /// Retained bytes of `[from, to)`. `truncated` is set if part of the
    /// range had been evicted.
    pub fn read_between(&self, from: u64, to: u64) -> RangeRead {
        collect(self.segments.iter(), self.tail, self.head, from, to)
    }
}

/// Copy the bytes of `[max(from, tail), min(to, head))` out of `segments`.
fn collect<'a>(
    segments: impl Iterator<Item = &'a Segment>,
    tail: u64,
    head: u64,
    from: u64,
    to: u64,
) -> RangeRead {
    let end = to.min(head);
    if from >= end {
        return RangeRead {
            start: from.min(head),
            bytes: Vec::new(),
            truncated: false,
        };
    }

    let truncated = from < tail;
    let start = from.max(tail);
    if start >= end {
        // The whole range was evicted.
        return RangeRead {
            start,
            bytes: Vec::new(),
            truncated,
        };
    }
    let mut bytes = Vec::with_capacity((end - start) as usize);
    for segment in segments {
        if segment.end() <= start {
            continue;
        }
        if segment.start >= end {
            break;
        }
        let lo = (start.max(segment.start) - segment.start) as usize;
        let hi = (end.min(segment.end()) - segment.start) as usize;
        bytes.extend_from_slice(&segment.data[lo..hi]);
    }

    RangeRead {
        start,
        bytes,
        truncated,
    }
}
