use bytes::Bytes;

/// Options attached to a flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOptions {
    /// Set on the final flush of a file.
    pub done: bool,
}

/// Bytes emitted by a buffer flush. `data` is an owned copy, independent of
/// the buffer's backing storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flush {
    pub data: Bytes,
    pub options: FlushOptions,
}

/// Fixed-capacity accumulator that coalesces small network reads into
/// chunk-sized writes.
pub struct ChunkBuffer {
    storage: Box<[u8]>,
    pos: usize,
}

impl ChunkBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "chunk buffer capacity must be non-zero");
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            pos: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Bytes written since the last flush.
    pub fn len(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    /// Append `data`, flushing every time the buffer fills up. Returns the
    /// automatic flushes in emission order.
    pub fn add(&mut self, mut data: &[u8]) -> Vec<Flush> {
        let mut flushes = Vec::new();
        while !data.is_empty() {
            let room = self.capacity() - self.pos;
            let take = room.min(data.len());
            self.storage[self.pos..self.pos + take].copy_from_slice(&data[..take]);
            self.pos += take;
            data = &data[take..];

            if self.pos == self.capacity() {
                flushes.push(self.flush(FlushOptions::default()));
            }
        }
        flushes
    }

    /// Emit a copy of the bytes written so far (possibly none) and reset.
    pub fn flush(&mut self, options: FlushOptions) -> Flush {
        let data = Bytes::copy_from_slice(&self.storage[..self.pos]);
        self.pos = 0;
        Flush { data, options }
    }

    /// Drop unflushed bytes.
    pub fn reset(&mut self) {
        self.pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_flushes_reproduce_input() {
        let input = pattern(10_007);
        for capacity in [1, 7, 64, 1000, 10_007, 20_000] {
            for piece in [1, 3, 100, 4096] {
                let mut buf = ChunkBuffer::new(capacity);
                let mut out = Vec::new();
                for part in input.chunks(piece) {
                    for f in buf.add(part) {
                        assert_eq!(f.data.len(), capacity);
                        assert!(!f.options.done);
                        out.extend_from_slice(&f.data);
                    }
                }
                let last = buf.flush(FlushOptions { done: true });
                assert!(last.options.done);
                out.extend_from_slice(&last.data);
                assert_eq!(out, input, "capacity {capacity} piece {piece}");
            }
        }
    }

    #[test]
    fn test_five_megabytes_in_two_megabyte_units() {
        let mut buf = ChunkBuffer::new(2_000_000);
        let input = vec![7u8; 5_000_000];
        let mut sizes: Vec<usize> = Vec::new();
        for part in input.chunks(65_536) {
            sizes.extend(buf.add(part).iter().map(|f| f.data.len()));
        }
        let last = buf.flush(FlushOptions { done: true });
        sizes.push(last.data.len());
        assert_eq!(sizes, vec![2_000_000, 2_000_000, 1_000_000]);
        assert!(last.options.done);
    }

    #[test]
    fn test_flush_is_a_copy() {
        let mut buf = ChunkBuffer::new(4);
        buf.add(b"ab");
        let first = buf.flush(FlushOptions::default());
        buf.add(b"zz");
        assert_eq!(&first.data[..], b"ab");
    }

    #[test]
    fn test_empty_flush_and_reset() {
        let mut buf = ChunkBuffer::new(4);
        assert!(buf.flush(FlushOptions { done: true }).data.is_empty());
        buf.add(b"xyz");
        assert_eq!(buf.len(), 3);
        buf.reset();
        assert!(buf.is_empty());
    }

    #[test]
    #[should_panic]
    fn test_zero_capacity_panics() {
        let _ = ChunkBuffer::new(0);
    }
}
