//! Callbacks into the owning component: the buffer-exchange side and the
//! stream-info side.

use crate::watcher::{IoWatcherFactory, TimerWatcherFactory};

/// Destination buffer handed out by the consumer. Fixed capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl OutputBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Room left before the buffer is full.
    pub fn spare(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// Copy as much of `src` as fits; returns the count copied.
    pub fn fill_from(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.spare());
        self.data.extend_from_slice(&src[..n]);
        n
    }

    pub fn filled(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// Buffer-exchange protocol with the downstream consumer.
pub trait BufferCallbacks {
    /// Next empty buffer, or `None` when the consumer has none to give.
    fn buffer_emptied(&mut self) -> Option<OutputBuffer>;
    /// Return a buffer holding data.
    fn buffer_filled(&mut self, buffer: OutputBuffer);
}

/// Stream information callbacks.
pub trait InfoCallbacks {
    /// One raw response header line, CRLF included.
    fn on_header(&mut self, line: &[u8]);
    /// Peek at arriving data. Returning `true` pauses the transfer.
    fn on_data(&mut self, chunk: &[u8]) -> bool;
    /// The transfer ended. Returning `true` requests automatic reconnection.
    fn on_connection_lost(&mut self) -> bool;
}

/// Everything a session needs from its host.
pub trait SessionHost: BufferCallbacks + InfoCallbacks + IoWatcherFactory + TimerWatcherFactory {}

impl<T> SessionHost for T where T: BufferCallbacks + InfoCallbacks + IoWatcherFactory + TimerWatcherFactory {}
