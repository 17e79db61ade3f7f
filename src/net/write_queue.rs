// src/net/write_queue.rs - Per-connection outbound queue
//
// Core features:
// - Strict FIFO, packets are never reordered or dropped
// - Partial write support (offset per entry)
// - Optional "sent" callback fired once a packet is fully written
// - Pending-bytes ceiling; callers close the connection when it is exceeded

use bytes::Bytes;
use std::collections::VecDeque;
use std::io::{self, Write};

/// Callback fired on the loop thread once a packet has been fully written.
pub type SentCallback = Box<dyn FnOnce() + Send>;

/// Default ceiling on bytes waiting to be written for one connection
pub const DEFAULT_MAX_PENDING_BYTES: usize = 4 * 1024 * 1024; // 4MB

/// Queue entry
struct WriteEntry {
    data: Bytes,
    offset: usize,
    on_sent: Option<SentCallback>,
}

impl WriteEntry {
    fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    fn advance(&mut self, n: usize) {
        self.offset += n;
    }

    fn is_complete(&self) -> bool {
        self.offset >= self.data.len()
    }

    fn remaining_bytes(&self) -> usize {
        self.data.len().saturating_sub(self.offset)
    }
}

/// Flush result
#[derive(Debug, PartialEq, Eq)]
pub enum FlushResult {
    /// Queue fully flushed
    Complete { bytes_written: usize },
    /// WouldBlock encountered, partial write
    WouldBlock { bytes_written: usize },
    /// Peer closed (write returned 0)
    Closed,
}

/// Write queue
///
/// FIFO of outbound packets with partial write support
pub struct WriteQueue {
    queue: VecDeque<WriteEntry>,
    total_bytes: usize,
    max_bytes: usize,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_PENDING_BYTES)
    }

    pub fn with_limit(max_bytes: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(16),
            total_bytes: 0,
            max_bytes,
        }
    }

    /// Enqueue a packet
    ///
    /// # Returns
    /// * `true` - Enqueued
    /// * `false` - Ceiling exceeded, nothing was queued; the connection should close
    pub fn enqueue(&mut self, data: Bytes, on_sent: Option<SentCallback>) -> bool {
        // Check the ceiling BEFORE adding to prevent overshoot
        if self.total_bytes.saturating_add(data.len()) > self.max_bytes {
            return false;
        }

        let len = data.len();
        self.queue.push_back(WriteEntry {
            data,
            offset: 0,
            on_sent,
        });
        self.total_bytes += len;
        true
    }

    /// Try to flush to writer
    ///
    /// Supports partial write, tracks write offset for each entry. Sent
    /// callbacks of completed entries fire in queue order.
    pub fn try_flush<W: Write>(&mut self, writer: &mut W) -> io::Result<FlushResult> {
        let mut bytes_written = 0;

        while let Some(entry) = self.queue.front_mut() {
            if entry.is_complete() {
                self.pop_complete();
                continue;
            }

            match writer.write(entry.remaining()) {
                Ok(0) => return Ok(FlushResult::Closed),
                Ok(n) => {
                    bytes_written += n;
                    self.total_bytes = self.total_bytes.saturating_sub(n);
                    entry.advance(n);
                    if entry.is_complete() {
                        self.pop_complete();
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FlushResult::WouldBlock { bytes_written });
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(FlushResult::Complete { bytes_written })
    }

    fn pop_complete(&mut self) {
        if let Some(entry) = self.queue.pop_front() {
            self.total_bytes = self.total_bytes.saturating_sub(entry.remaining_bytes());
            if let Some(on_sent) = entry.on_sent {
                on_sent();
            }
        }
    }

    /// Is queue empty
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Bytes pending to send
    pub fn pending_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Entry count in queue (test only)
    #[cfg(test)]
    pub fn pending_entries(&self) -> usize {
        self.queue.len()
    }
}

impl Default for WriteQueue {
    fn default() -> Self {
        Self::new()
    }
}
