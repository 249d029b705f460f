//! Fragment-based byte queue used on both sides of a request.
//!
//! [`SegmentedBuffer`] is an append-only, consume-from-front byte queue built
//! from fixed-size fragments. Growing the buffer allocates another fragment
//! instead of reallocating and moving everything already written, so total
//! copy cost is O(bytes) over the buffer's life and each call does a bounded
//! amount of work. That bound matters: every operation here runs under the
//! request lock, on whatever context the transport delivers its events from.
//!
//! The buffer tracks two absolute offsets, `start` and `end`, counted in bytes
//! ever consumed and ever written. A fragment is released exactly when `start`
//! has advanced past its range.

use std::collections::VecDeque;
use std::fmt;

/// Capacity of a single fragment in bytes.
pub(crate) const FRAGMENT_SIZE: usize = 512;

type Fragment = Box<[u8; FRAGMENT_SIZE]>;

fn new_fragment() -> Fragment {
    Box::new([0; FRAGMENT_SIZE])
}

/// An append-only byte queue backed by a chain of fixed-size fragments.
///
/// Invariants:
/// - `start <= end`, and `end - start` is the number of buffered bytes
/// - the fragment chain is empty iff the buffer is empty
/// - fragments are freed as soon as every byte in them has been consumed
///
/// A buffer is exclusively owned by one request; it is never shared.
#[derive(Default)]
pub struct SegmentedBuffer {
    fragments: VecDeque<Fragment>,
    /// Absolute offset of the next unconsumed byte.
    start: usize,
    /// Absolute offset one past the last written byte.
    end: usize,
}

/// One line extracted by [`SegmentedBuffer::read_line`], terminator stripped.
///
/// A line longer than the caller's limit comes back with `truncated` set and
/// the excess discarded; callers decide whether that is tolerable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    text: String,
    truncated: bool,
}

impl Line {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

impl SegmentedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes currently buffered.
    pub fn available(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Appends `data`, allocating fragments on demand. Never fails; the
    /// caller is responsible for bounding total memory.
    pub fn write(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let offset = self.end % FRAGMENT_SIZE;
            if self.fragments.is_empty() || offset == 0 {
                self.fragments.push_back(new_fragment());
            }
            let take = (FRAGMENT_SIZE - offset).min(data.len());
            let tail = self.fragments.len() - 1;
            self.fragments[tail][offset..offset + take].copy_from_slice(&data[..take]);
            self.end += take;
            data = &data[take..];
        }
    }

    /// Consumes up to `dest.len()` bytes into `dest`, returning the number of
    /// bytes copied. Fully drained fragments are freed.
    pub fn read(&mut self, dest: &mut [u8]) -> usize {
        let length = dest.len();
        self.drain(Some(dest), length)
    }

    /// Discards up to `length` bytes, returning the number discarded.
    pub fn consume(&mut self, length: usize) -> usize {
        self.drain(None, length)
    }

    fn drain(&mut self, mut dest: Option<&mut [u8]>, length: usize) -> usize {
        let length = length.min(self.available());
        let mut read = 0;

        while read < length {
            let offset = self.start % FRAGMENT_SIZE;
            let take = (FRAGMENT_SIZE - offset).min(length - read);
            if let Some(dest) = dest.as_deref_mut() {
                dest[read..read + take].copy_from_slice(&self.fragments[0][offset..offset + take]);
            }
            self.start += take;
            read += take;
            if self.start % FRAGMENT_SIZE == 0 {
                self.fragments.pop_front();
            }
        }

        if self.start == self.end {
            // everything consumed, restart the offsets from zero
            self.fragments.clear();
            self.start = 0;
            self.end = 0;
        }

        read
    }

    /// Returns up to `length` contiguous bytes without consuming them, capped
    /// to what remains in the current fragment. Callers needing more must
    /// consume and peek again. `None` when the buffer is empty.
    pub fn peek(&self, length: usize) -> Option<&[u8]> {
        let offset = self.start % FRAGMENT_SIZE;
        let capped = length.min(self.available()).min(FRAGMENT_SIZE - offset);
        if capped == 0 {
            return None;
        }
        let front = self.fragments.front()?;
        Some(&front[offset..offset + capped])
    }

    /// Extracts one `\n`-terminated line, tolerating and stripping a
    /// preceding `\r`. Consumes through the terminator. A line longer than
    /// `max_length` is truncated to `max_length` with the excess discarded,
    /// and flagged as such on the returned [`Line`]. Returns `None` without
    /// consuming anything when no terminator is buffered yet.
    pub fn read_line(&mut self, max_length: usize) -> Option<Line> {
        let through_newline = self.scan_newline()?;

        let mut raw = vec![0; through_newline];
        self.read(&mut raw);
        raw.pop();
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }

        let truncated = raw.len() > max_length;
        if truncated {
            raw.truncate(max_length);
        }

        Some(Line { text: String::from_utf8_lossy(&raw).into_owned(), truncated })
    }

    /// Byte count through the first buffered `\n`, or `None` if absent.
    fn scan_newline(&self) -> Option<usize> {
        let mut scanned = 0;
        let mut offset = self.start % FRAGMENT_SIZE;
        let mut remaining = self.available();

        for fragment in &self.fragments {
            let upto = (FRAGMENT_SIZE - offset).min(remaining);
            if let Some(pos) = fragment[offset..offset + upto].iter().position(|&b| b == b'\n') {
                return Some(scanned + pos + 1);
            }
            scanned += upto;
            remaining -= upto;
            offset = 0;
        }

        None
    }

    /// Releases all fragments and resets both offsets to zero.
    pub fn clear(&mut self) {
        self.fragments.clear();
        self.start = 0;
        self.end = 0;
    }
}

impl fmt::Debug for SegmentedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentedBuffer")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("fragments", &self.fragments.len())
            .finish()
    }
}

/// Request serialization writes formatted header text straight into the
/// buffer; appending bytes cannot fail, so this is infallible in practice.
impl fmt::Write for SegmentedBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write(s.as_bytes());
        Ok(())
    }
}

impl From<&[u8]> for SegmentedBuffer {
    fn from(data: &[u8]) -> Self {
        let mut buffer = Self::new();
        buffer.write(data);
        buffer
    }
}

impl From<&str> for SegmentedBuffer {
    fn from(data: &str) -> Self {
        Self::from(data.as_bytes())
    }
}

impl From<bytes::Bytes> for SegmentedBuffer {
    fn from(data: bytes::Bytes) -> Self {
        Self::from(&data[..])
    }
}
