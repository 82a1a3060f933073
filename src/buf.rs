//! Session buffers
//!
//! [`WriteBuf`] is the two-stage send staging area: small chunks are copied
//! into an inline merge buffer so one syscall carries several frames, while
//! a chunk too large to merge is kept as a zero-copy tail span. A TLS write
//! that returns WANT_WRITE must be retried with the identical pointer and
//! length, so the tail keeps the original [`Bytes`] handle and only advances
//! its offset on confirmed partial progress.
//!
//! [`ReadBuf`] is the growable, compacting accumulator behind the HTTP/1.1
//! parser: consumed bytes are reclaimed by sliding the unread region to the
//! front, and a buffer grown past the default allocation is freed once fully
//! drained.

use bytes::Bytes;

/// Size of the inline merge area.
///
/// Sized to balance syscall count against MTU / TLS record size: big enough
/// to coalesce a burst of small frames, small enough not to delay flushes.
pub const WR_MERGE_SIZE: usize = 16 * 1024;

/// Default (and reclaim-threshold) allocation for the read accumulator.
pub const RD_ALLOC_DEFAULT: usize = 16 * 1024;

/// Two-stage write staging buffer.
#[derive(Debug)]
pub struct WriteBuf {
    merge: Vec<u8>,
    tail: Bytes,
    tail_off: usize,
}

impl WriteBuf {
    pub fn new() -> Self {
        WriteBuf {
            merge: Vec::with_capacity(WR_MERGE_SIZE),
            tail: Bytes::new(),
            tail_off: 0,
        }
    }

    /// Free space left in the merge area
    pub fn merge_room(&self) -> usize {
        WR_MERGE_SIZE - self.merge.len()
    }

    /// Copy a chunk into the merge area; the caller checks `merge_room` first
    pub fn push_merge(&mut self, chunk: &[u8]) {
        debug_assert!(chunk.len() <= self.merge_room());
        self.merge.extend_from_slice(chunk);
    }

    pub fn merge_pending(&self) -> &[u8] {
        &self.merge
    }

    /// Drop `n` sent bytes from the front of the merge area
    pub fn merge_consume(&mut self, n: usize) {
        self.merge.drain(..n);
    }

    /// Install a chunk too large to merge as the zero-copy tail span
    pub fn set_tail(&mut self, chunk: Bytes) {
        debug_assert!(self.tail_pending().is_empty());
        self.tail = chunk;
        self.tail_off = 0;
    }

    /// Unsent remainder of the tail span.
    ///
    /// Until fully written this yields the same address and length across
    /// calls (the WANT_WRITE retry contract); the offset only advances via
    /// `tail_consume`.
    pub fn tail_pending(&self) -> &[u8] {
        &self.tail[self.tail_off..]
    }

    pub fn tail_consume(&mut self, n: usize) {
        self.tail_off += n;
        if self.tail_off >= self.tail.len() {
            self.tail = Bytes::new();
            self.tail_off = 0;
        }
    }

    pub fn has_tail(&self) -> bool {
        !self.tail_pending().is_empty()
    }

    /// Total unsent bytes across both stages
    pub fn pending(&self) -> usize {
        self.merge.len() + self.tail_pending().len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }
}

impl Default for WriteBuf {
    fn default() -> Self {
        Self::new()
    }
}

/// Growable, compacting byte accumulator for incremental parsing.
#[derive(Debug, Default)]
pub struct ReadBuf {
    data: Vec<u8>,
    used: usize,
    /// Monotonic count of bytes ever consumed, for diagnostics
    offset: u64,
}

impl ReadBuf {
    pub fn new() -> Self {
        ReadBuf::default()
    }

    /// Append a received chunk, compacting or growing as needed.
    pub fn push(&mut self, chunk: &[u8]) {
        if self.data.capacity() == 0 {
            self.data
                .reserve_exact(chunk.len().max(RD_ALLOC_DEFAULT));
            self.data.extend_from_slice(chunk);
            self.used = 0;
            return;
        }
        if self.data.capacity() - self.data.len() >= chunk.len() {
            self.data.extend_from_slice(chunk);
            return;
        }
        // slide the unread region to the front, then grow if still short
        self.offset += self.used as u64;
        self.data.drain(..self.used);
        self.used = 0;
        let free = self.data.capacity() - self.data.len();
        if free < chunk.len() {
            self.data.reserve_exact(chunk.len() - free);
        }
        self.data.extend_from_slice(chunk);
    }

    /// Bytes received but not yet consumed
    pub fn unread(&self) -> &[u8] {
        &self.data[self.used..]
    }

    pub fn consume(&mut self, n: usize) {
        debug_assert!(self.used + n <= self.data.len());
        self.used += n;
    }

    pub fn is_drained(&self) -> bool {
        self.used == self.data.len()
    }

    /// Stream position of the next unread byte, for log messages
    pub fn position(&self) -> u64 {
        self.offset + self.used as u64
    }

    /// Release a fully-drained buffer that grew past the default allocation.
    pub fn reclaim(&mut self) {
        if self.is_drained() && self.data.capacity() > RD_ALLOC_DEFAULT {
            self.offset += self.used as u64;
            self.data = Vec::new();
            self.used = 0;
        }
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.data.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_buf_merge_then_tail() {
        let mut wb = WriteBuf::new();
        wb.push_merge(b"hello");
        assert_eq!(wb.merge_pending(), b"hello");
        assert_eq!(wb.merge_room(), WR_MERGE_SIZE - 5);

        let big = Bytes::from(vec![7u8; WR_MERGE_SIZE]);
        wb.set_tail(big);
        assert_eq!(wb.pending(), 5 + WR_MERGE_SIZE);
        assert!(wb.has_tail());
    }

    #[test]
    fn test_write_buf_partial_merge_send() {
        let mut wb = WriteBuf::new();
        wb.push_merge(b"abcdef");
        wb.merge_consume(4);
        assert_eq!(wb.merge_pending(), b"ef");
        wb.merge_consume(2);
        assert!(wb.is_idle());
    }

    #[test]
    fn test_write_buf_tail_retry_is_stable() {
        let mut wb = WriteBuf::new();
        wb.set_tail(Bytes::from_static(b"0123456789"));

        // an attempt that would-block re-presents the identical span
        let p1 = wb.tail_pending().as_ptr() as usize;
        let l1 = wb.tail_pending().len();
        let p2 = wb.tail_pending().as_ptr() as usize;
        assert_eq!((p1, l1), (p2, wb.tail_pending().len()));

        // partial progress advances, full progress clears
        wb.tail_consume(4);
        assert_eq!(wb.tail_pending(), b"456789");
        assert_eq!(wb.tail_pending().as_ptr() as usize, p1 + 4);
        wb.tail_consume(6);
        assert!(!wb.has_tail());
        assert!(wb.is_idle());
    }

    #[test]
    fn test_read_buf_append_within_capacity() {
        let mut rb = ReadBuf::new();
        rb.push(b"hello ");
        rb.push(b"world");
        assert_eq!(rb.unread(), b"hello world");
        assert_eq!(rb.capacity(), RD_ALLOC_DEFAULT);
    }

    #[test]
    fn test_read_buf_compacts_before_growing() {
        let mut rb = ReadBuf::new();
        let first = vec![1u8; RD_ALLOC_DEFAULT];
        rb.push(&first);
        rb.consume(RD_ALLOC_DEFAULT - 10);

        // free tail space is gone; the 10-byte carry is slid to the front
        rb.push(b"0123456789");
        assert_eq!(rb.unread().len(), 20);
        assert_eq!(&rb.unread()[10..], b"0123456789");
        assert_eq!(rb.position(), (RD_ALLOC_DEFAULT - 10) as u64);
        assert_eq!(rb.capacity(), RD_ALLOC_DEFAULT);
    }

    #[test]
    fn test_read_buf_grows_when_carry_exceeds_capacity() {
        let mut rb = ReadBuf::new();
        rb.push(&vec![1u8; RD_ALLOC_DEFAULT]);
        rb.push(&vec![2u8; RD_ALLOC_DEFAULT]);
        assert_eq!(rb.unread().len(), 2 * RD_ALLOC_DEFAULT);
        assert!(rb.capacity() >= 2 * RD_ALLOC_DEFAULT);
    }

    #[test]
    fn test_read_buf_reclaimed_after_drain() {
        let mut rb = ReadBuf::new();
        rb.push(&vec![1u8; 3 * RD_ALLOC_DEFAULT]);
        assert!(rb.capacity() > RD_ALLOC_DEFAULT);

        rb.consume(3 * RD_ALLOC_DEFAULT);
        rb.reclaim();
        assert_eq!(rb.capacity(), 0);
        assert!(rb.unread().is_empty());

        // reusable after reclaim
        rb.push(b"more");
        assert_eq!(rb.unread(), b"more");
        assert_eq!(rb.capacity(), RD_ALLOC_DEFAULT);
    }

    #[test]
    fn test_read_buf_not_reclaimed_at_default_capacity() {
        let mut rb = ReadBuf::new();
        rb.push(b"data");
        rb.consume(4);
        rb.reclaim();
        assert_eq!(rb.capacity(), RD_ALLOC_DEFAULT);
    }
}
