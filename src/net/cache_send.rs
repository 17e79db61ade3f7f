// src/net/cache_send.rs - Producer-side send batching
//
// A producer that sends many small packets to many sessions can buffer them
// here and flush once: every loop then receives a single task (and a single
// wakeup) carrying all of its packets, applied in insertion order.

use crate::net::dispatcher::Dispatcher;
use crate::net::session_id::SessionId;
use crate::net::write_queue::SentCallback;
use bytes::Bytes;

/// A packet waiting for the next flush
pub struct CachedPacket {
    pub session_id: SessionId,
    pub packet: Bytes,
    pub on_sent: Option<SentCallback>,
}

/// Packets grouped by owning loop. Not shared: each producer keeps its own.
#[derive(Default)]
pub struct CacheSendBuffer {
    /// Indexed by loop index
    groups: Vec<Vec<CachedPacket>>,
    len: usize,
}

impl CacheSendBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer `packet` for `id`. Nothing is posted until [`flush`](Self::flush).
    pub fn cache_send(&mut self, id: SessionId, packet: impl Into<Bytes>, on_sent: Option<SentCallback>) {
        let index = id.loop_index() as usize;
        if self.groups.len() <= index {
            self.groups.resize_with(index + 1, Vec::new);
        }
        self.groups[index].push(CachedPacket {
            session_id: id,
            packet: packet.into(),
            on_sent,
        });
        self.len += 1;
    }

    /// Number of buffered packets
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Post one task per loop with buffered packets and clear the buffer.
    ///
    /// Returns the number of tasks posted.
    pub fn flush(&mut self, dispatcher: &Dispatcher) -> usize {
        let mut posted = 0;
        for (index, group) in self.groups.iter_mut().enumerate() {
            if group.is_empty() {
                continue;
            }
            dispatcher.post_batch(index, std::mem::take(group));
            posted += 1;
        }
        self.len = 0;
        posted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::net::connection::{SessionCallbacks, Transport};
    use crate::net::event_loop::EventLoop;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn connect(listener: &TcpListener) -> (TcpStream, TcpStream) {
        let client = TcpStream::connect(listener.local_addr().unwrap()).expect("Failed to connect");
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("Failed to set timeout");
        let (server, _) = listener.accept().expect("Failed to accept");
        server.set_nonblocking(true).expect("Failed to set nonblocking");
        (client, server)
    }

    #[test]
    fn test_cache_send_posts_nothing_until_flush() {
        let config = ServiceConfig::new();
        let (_el, handle) = EventLoop::new(0, &config).unwrap();
        let dispatcher = Dispatcher::new(vec![handle]);

        let mut cache = CacheSendBuffer::new();
        cache.cache_send(SessionId::new(0, 0, 1), &b"a"[..], None);
        cache.cache_send(SessionId::new(0, 1, 1), &b"b"[..], None);
        assert_eq!(cache.len(), 2);
        assert_eq!(dispatcher.loops()[0].pending_tasks(), 0);

        assert_eq!(cache.flush(&dispatcher), 1);
        assert!(cache.is_empty());
        assert_eq!(dispatcher.loops()[0].pending_tasks(), 1);

        // Nothing left to post
        assert_eq!(cache.flush(&dispatcher), 0);
    }

    #[test]
    fn test_one_task_per_loop() {
        let config = ServiceConfig::new();
        let (_el0, h0) = EventLoop::new(0, &config).unwrap();
        let (_el1, h1) = EventLoop::new(1, &config).unwrap();
        let (_el2, h2) = EventLoop::new(2, &config).unwrap();
        let dispatcher = Dispatcher::new(vec![h0, h1, h2]);

        let mut cache = CacheSendBuffer::new();
        for slot in 0..4 {
            cache.cache_send(SessionId::new(0, slot, 1), vec![slot as u8], None);
            cache.cache_send(SessionId::new(2, slot, 1), vec![slot as u8], None);
        }

        assert_eq!(cache.flush(&dispatcher), 2);
        let pending: Vec<usize> = dispatcher.loops().iter().map(|h| h.pending_tasks()).collect();
        assert_eq!(pending, vec![1, 0, 1]);
    }

    #[test]
    fn test_flush_preserves_order_per_session() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        let config = ServiceConfig::new().with_poll_timeout(Duration::from_millis(10));
        let (mut el, handle) = EventLoop::new(0, &config).unwrap();
        let dispatcher = Dispatcher::new(vec![handle]);

        let (mut client_a, server_a) = connect(&listener);
        let (mut client_b, server_b) = connect(&listener);
        let a = el
            .admit(Transport::Plain(server_a), "127.0.0.1".into(), SessionCallbacks::new(), 1024)
            .unwrap();
        let b = el
            .admit(Transport::Plain(server_b), "127.0.0.1".into(), SessionCallbacks::new(), 1024)
            .unwrap();

        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut cache = CacheSendBuffer::new();
        for (id, packet) in [(a, "1"), (b, "x"), (a, "2"), (b, "y"), (a, "3")] {
            let sent = sent.clone();
            cache.cache_send(
                id,
                packet.as_bytes().to_vec(),
                Some(Box::new(move || sent.lock().unwrap().push(packet))),
            );
        }
        cache.flush(&dispatcher);
        el.run_once(None);

        let mut buf = [0u8; 3];
        client_a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"123");
        let mut buf = [0u8; 2];
        client_b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"xy");

        let sent = sent.lock().unwrap();
        let for_a: Vec<&str> = sent.iter().copied().filter(|p| ["1", "2", "3"].contains(p)).collect();
        assert_eq!(for_a, vec!["1", "2", "3"]);
    }
}
