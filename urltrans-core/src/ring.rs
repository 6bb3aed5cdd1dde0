//! Fixed-capacity byte ring. Decouples network arrival from consumer drain.

use std::collections::TryReserveError;

/// Byte FIFO with a capacity fixed at construction. Never grows, never blocks.
pub struct ByteRing {
    buf: Box<[u8]>,
    head: usize,
    len: usize,
}

impl ByteRing {
    /// Allocate a ring of `capacity` bytes. Allocation failure is reported, not aborted on.
    pub fn try_with_capacity(capacity: usize) -> Result<Self, TryReserveError> {
        let mut v = Vec::new();
        v.try_reserve_exact(capacity)?;
        v.resize(capacity, 0);
        Ok(Self {
            buf: v.into_boxed_slice(),
            head: 0,
            len: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes currently stored.
    pub fn available(&self) -> usize {
        self.len
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append as much of `bytes` as fits. Returns the number accepted.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.free());
        if n == 0 {
            return 0;
        }
        let cap = self.capacity();
        let tail = (self.head + self.len) % cap;
        let first = n.min(cap - tail);
        self.buf[tail..tail + first].copy_from_slice(&bytes[..first]);
        if first < n {
            self.buf[..n - first].copy_from_slice(&bytes[first..n]);
        }
        self.len += n;
        n
    }

    /// Longest contiguous run of stored bytes starting at the read position.
    pub fn peek_contiguous(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        let end = (self.head + self.len).min(self.capacity());
        &self.buf[self.head..end]
    }

    /// Drop up to `n` bytes from the front. Returns the number dropped.
    pub fn advance(&mut self, n: usize) -> usize {
        let n = n.min(self.len);
        if n == 0 {
            return 0;
        }
        self.head = (self.head + n) % self.capacity();
        self.len -= n;
        if self.len == 0 {
            self.head = 0;
        }
        n
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}

impl std::fmt::Debug for ByteRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteRing")
            .field("capacity", &self.capacity())
            .field("available", &self.len)
            .finish()
    }
}
