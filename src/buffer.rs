/// Fixed-capacity byte buffer with a read cursor, used for both directions
/// of a channel.
///
/// The transmit side appends with [`push`](Self::push) and drains everything
/// with [`take`](Self::take). The receive side is filled wholesale with
/// [`refill`](Self::refill) and drained incrementally with
/// [`read`](Self::read). Capacity is fixed at the channel's negotiated
/// buffer size; a `push` past capacity silently drops the excess, which is
/// long-standing protocol behavior the SIM compensates for by polling the
/// headroom reported in SEND_DATA responses.
#[derive(Debug)]
pub(crate) struct ChannelBuffer {
    data: Vec<u8>,
    /// Read cursor; bytes before it have been consumed.
    pos: usize,
    /// Unconsumed byte count starting at `pos`.
    len: usize,
}

impl ChannelBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            pos: 0,
            len: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Unconsumed bytes.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Free space behind the buffered bytes.
    pub(crate) fn headroom(&self) -> usize {
        self.capacity() - (self.pos + self.len)
    }

    /// Forget all buffered bytes and rewind the cursors.
    pub(crate) fn reset(&mut self) {
        self.pos = 0;
        self.len = 0;
    }

    /// Append as much of `bytes` as fits; returns how much was kept.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> usize {
        let start = self.pos + self.len;
        let n = bytes.len().min(self.capacity() - start);
        self.data[start..start + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        n
    }

    /// Drain every buffered byte and reset.
    pub(crate) fn take(&mut self) -> Vec<u8> {
        let out = self.data[self.pos..self.pos + self.len].to_vec();
        self.reset();
        out
    }

    /// Replace the contents with `bytes` (truncated to capacity) and rewind
    /// the read cursor.
    pub(crate) fn refill(&mut self, bytes: &[u8]) {
        self.reset();
        self.len = self.push(bytes);
    }

    /// Consume up to `n` bytes from the front.
    pub(crate) fn read(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.len);
        let out = self.data[self.pos..self.pos + n].to_vec();
        self.pos += n;
        self.len -= n;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_take() {
        let mut buf = ChannelBuffer::new(8);
        assert_eq!(buf.push(b"abc"), 3);
        assert_eq!(buf.push(b"de"), 2);
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.headroom(), 3);
        assert_eq!(buf.take(), b"abcde");
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.headroom(), 8);
    }

    #[test]
    fn push_truncates_at_capacity() {
        let mut buf = ChannelBuffer::new(4);
        assert_eq!(buf.push(b"abcdef"), 4);
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.push(b"x"), 0);
        assert_eq!(buf.take(), b"abcd");
    }

    #[test]
    fn refill_and_incremental_read() {
        let mut buf = ChannelBuffer::new(16);
        buf.refill(b"0123456789");
        assert_eq!(buf.read(4), b"0123");
        assert_eq!(buf.len(), 6);
        assert_eq!(buf.read(100), b"456789");
        assert_eq!(buf.len(), 0);
        assert!(buf.read(1).is_empty());
    }

    #[test]
    fn refill_discards_previous_contents() {
        let mut buf = ChannelBuffer::new(8);
        buf.refill(b"aaaa");
        buf.read(2);
        buf.refill(b"bb");
        assert_eq!(buf.read(8), b"bb");
    }

    #[test]
    fn zero_capacity_accepts_nothing() {
        let mut buf = ChannelBuffer::new(0);
        assert_eq!(buf.push(b"a"), 0);
        assert!(buf.take().is_empty());
    }
}
