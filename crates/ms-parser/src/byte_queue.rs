//! Growable, self-compacting byte accumulator.

/// Initial capacity allocated on the first push.
const DEFAULT_QUEUE_SIZE: usize = 1024;

/// FIFO of bytes awaiting parsing.
///
/// Data is appended at the back with [`push`](ByteQueue::push) and consumed
/// from the front with [`pop`](ByteQueue::pop). The backing storage doubles
/// when it is too small and unread bytes are slid back to offset 0 only when
/// the trailing free space cannot take a push, which keeps copies rare.
#[derive(Debug, Default)]
pub struct ByteQueue {
    buffer: Box<[u8]>,
    offset: usize,
    used: usize,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard all buffered bytes. Capacity is retained.
    pub fn reset(&mut self) {
        self.offset = 0;
        self.used = 0;
    }

    /// Append `data` to the back of the queue.
    ///
    /// # Panics
    ///
    /// If `data` is empty.
    pub fn push(&mut self, data: &[u8]) {
        assert!(!data.is_empty(), "ByteQueue::push with empty data");

        let size_needed = self.used + data.len();

        if size_needed > self.buffer.len() {
            let mut new_size = self.buffer.len().max(DEFAULT_QUEUE_SIZE);
            while new_size < size_needed {
                new_size *= 2;
            }
            let mut new_buffer = vec![0u8; new_size].into_boxed_slice();
            new_buffer[..self.used].copy_from_slice(self.unread());
            self.buffer = new_buffer;
            self.offset = 0;
        } else if self.offset + size_needed > self.buffer.len() {
            self.buffer.copy_within(self.offset..self.offset + self.used, 0);
            self.offset = 0;
        }

        let start = self.offset + self.used;
        self.buffer[start..start + data.len()].copy_from_slice(data);
        self.used += data.len();
    }

    /// The unread bytes. Valid until the next `push`, `pop` or `reset`.
    pub fn peek(&self) -> &[u8] {
        self.unread()
    }

    /// Remove `count` bytes from the front of the queue.
    ///
    /// # Panics
    ///
    /// If `count` exceeds the number of unread bytes.
    pub fn pop(&mut self, count: usize) {
        assert!(
            count <= self.used,
            "ByteQueue::pop of {count} bytes with only {} buffered",
            self.used
        );
        self.offset += count;
        self.used -= count;
        if self.used == 0 {
            self.offset = 0;
        }
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    fn unread(&self) -> &[u8] {
        &self.buffer[self.offset..self.offset + self.used]
    }
}
