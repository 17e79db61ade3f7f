// src/net/dispatcher.rs - Session-addressed cross-thread operations
//
// Any thread may name a session by id. The dispatcher decodes the loop index,
// posts a task to that loop and the task re-resolves the id against the
// loop's directory before touching the connection. A stale id (session
// closed, slot reused) resolves to nothing and the operation is dropped.

use crate::error::{Error, Result};
use crate::net::cache_send::CachedPacket;
use crate::net::connection::{Connection, SessionCallbacks, Transport};
use crate::net::event_loop::LoopHandle;
use crate::net::listener::{prepare_socket, Acceptor};
use crate::net::session_id::SessionId;
use bytes::Bytes;
use log::{debug, error};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Cheap, cloneable entry point for session operations.
#[derive(Clone)]
pub struct Dispatcher {
    loops: Arc<[LoopHandle]>,
    /// Round-robin admission cursor
    next: Arc<AtomicUsize>,
    /// Callbacks for sessions admitted without their own
    defaults: Arc<RwLock<SessionCallbacks>>,
    /// Builds `use_ssl` transports from the listener's certificate
    acceptor: Arc<RwLock<Acceptor>>,
}

impl Dispatcher {
    pub(crate) fn new(loops: Vec<LoopHandle>) -> Self {
        Self {
            loops: loops.into(),
            next: Arc::new(AtomicUsize::new(0)),
            defaults: Arc::new(RwLock::new(SessionCallbacks::default())),
            acceptor: Arc::new(RwLock::new(Acceptor::default())),
        }
    }

    /// Read default callbacks and TLS material from the owner's shared cells.
    pub(crate) fn share_admission(
        &mut self,
        defaults: Arc<RwLock<SessionCallbacks>>,
        acceptor: Arc<RwLock<Acceptor>>,
    ) {
        self.defaults = defaults;
        self.acceptor = acceptor;
    }

    /// Snapshot of the callbacks unset per-session callbacks fall back to
    pub fn default_callbacks(&self) -> SessionCallbacks {
        self.defaults
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn loop_count(&self) -> usize {
        self.loops.len()
    }

    pub fn loops(&self) -> &[LoopHandle] {
        &self.loops
    }

    /// Loop owning `id`, or `None` if its loop index is out of range
    pub fn loop_for(&self, id: SessionId) -> Option<&LoopHandle> {
        self.loops.get(id.loop_index() as usize)
    }

    /// Loop whose thread is the caller, if any
    pub fn current_loop(&self) -> Option<&LoopHandle> {
        self.loops.iter().find(|handle| handle.is_in_loop_thread())
    }

    /// Next loop in round-robin order
    pub fn next_loop(&self) -> Option<&LoopHandle> {
        if self.loops.is_empty() {
            return None;
        }
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        self.loops.get(n % self.loops.len())
    }

    /// Run `op` on the session's loop thread if the session is still live.
    /// Unknown or stale sessions are ignored.
    pub fn post<F>(&self, id: SessionId, op: F)
    where
        F: FnOnce(&mut Connection) + Send + 'static,
    {
        let Some(handle) = self.loop_for(id) else {
            debug!("Session {} names unknown loop, dropping task", id);
            return;
        };

        let result = handle.run_in_loop(move |el| match el.session_mut(id) {
            Some(conn) => {
                op(conn);
                el.mark_dirty(id);
            }
            None => debug!("Dropping task for stale session {}", id),
        });
        if let Err(e) = result {
            debug!("Dropping task for session {}: {}", id, e);
        }
    }

    pub fn send(&self, id: SessionId, packet: impl Into<Bytes>) {
        let packet = packet.into();
        self.post(id, move |conn| conn.send(packet, None));
    }

    /// Send and run `on_sent` on the loop thread once the packet is written.
    /// `on_sent` never runs if the session is gone.
    pub fn send_with<F>(&self, id: SessionId, packet: impl Into<Bytes>, on_sent: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let packet = packet.into();
        self.post(id, move |conn| conn.send(packet, Some(Box::new(on_sent))));
    }

    /// Half-close once the queued packets are written.
    pub fn shutdown(&self, id: SessionId) {
        self.post(id, |conn| conn.shutdown());
    }

    pub fn disconnect(&self, id: SessionId) {
        self.post(id, |conn| conn.force_close());
    }

    /// Close the session when it receives nothing for `check_time`; `None`
    /// disables the check.
    pub fn set_ping_check_time(&self, id: SessionId, check_time: Option<Duration>) {
        self.post(id, move |conn| conn.set_check_time(check_time));
    }

    /// Wake the loop owning `id` without posting work.
    pub fn wakeup(&self, id: SessionId) {
        if let Some(handle) = self.loop_for(id) {
            handle.wakeup();
        }
    }

    pub fn wakeup_all(&self) {
        for handle in self.loops.iter() {
            handle.wakeup();
        }
    }

    /// Post one task applying every packet of `batch` (all owned by loop
    /// `loop_index`) in order.
    pub(crate) fn post_batch(&self, loop_index: usize, batch: Vec<CachedPacket>) {
        let Some(handle) = self.loops.get(loop_index) else {
            debug!("Dropping {} cached packets for unknown loop {}", batch.len(), loop_index);
            return;
        };

        let result = handle.run_in_loop(move |el| {
            for packet in batch {
                let id = packet.session_id;
                match el.session_mut(id) {
                    Some(conn) => {
                        conn.send(packet.packet, packet.on_sent);
                        el.mark_dirty(id);
                    }
                    None => debug!("Dropping cached packet for stale session {}", id),
                }
            }
        });
        if let Err(e) = result {
            debug!("Dropping cached packets: {}", e);
        }
    }

    /// Admit an already connected socket.
    ///
    /// # Parameters
    /// - `callbacks`: per-session callbacks; unset ones fall back to
    ///   [`default_callbacks`](Self::default_callbacks)
    /// - `use_ssl`: serve TLS with the listener's certificate
    /// - `max_recv_buffer_size`: cap on unconsumed inbound bytes
    /// - `force_same_thread_loop`: admit into the loop running the calling
    ///   thread; only valid inside a loop task or callback
    ///
    /// The session id is issued asynchronously on the chosen loop and
    /// delivered to the enter callback. `Ok` means the socket was handed to
    /// a loop, not that it was admitted: a loop whose directory is full
    /// closes the socket and logs an error, and no callback fires.
    ///
    /// # Errors
    /// `NotInLoopThread` (forced same-loop admission off a loop thread),
    /// `WorkerNotStarted` (loops stopped), `Io` (socket setup),
    /// `TlsNotConfigured` / `TlsUnavailable` (`use_ssl` without a certificate
    /// or without the `tls` feature).
    pub fn add_data_socket(
        &self,
        stream: TcpStream,
        callbacks: SessionCallbacks,
        use_ssl: bool,
        max_recv_buffer_size: usize,
        force_same_thread_loop: bool,
    ) -> Result<()> {
        let target = self.admission_loop(force_same_thread_loop)?;

        let peer = prepare_socket(&stream)?;
        let transport = self
            .acceptor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .transport_for(stream, use_ssl)?;
        let callbacks = callbacks.or_defaults(&self.default_callbacks());

        self.admit(target, transport, peer.ip().to_string(), callbacks, max_recv_buffer_size)
    }

    /// Hand a prepared transport to a loop for admission. The session id
    /// is issued on the loop thread; a full directory closes the socket.
    pub(crate) fn admit(
        &self,
        target: &LoopHandle,
        transport: Transport,
        peer_ip: String,
        callbacks: SessionCallbacks,
        max_recv_buffer_size: usize,
    ) -> Result<()> {
        target.run_in_loop(move |el| {
            let ip = peer_ip.clone();
            if let Err(e) = el.admit(transport, peer_ip, callbacks, max_recv_buffer_size) {
                error!("Worker loop {} rejected session from {}: {}", el.index(), ip, e);
            }
        })
    }

    /// Admission target: the caller's own loop or the next round-robin loop.
    /// Stopped loops admit nothing.
    pub(crate) fn admission_loop(&self, force_same_thread_loop: bool) -> Result<&LoopHandle> {
        if force_same_thread_loop {
            return self.current_loop().ok_or(Error::NotInLoopThread);
        }
        self.next_loop()
            .filter(|handle| handle.is_running())
            .ok_or(Error::WorkerNotStarted)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("loops", &self.loops.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::net::event_loop::EventLoop;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::sync::Mutex;

    fn loops(n: u16) -> (Vec<EventLoop>, Dispatcher) {
        let config = ServiceConfig::new().with_poll_timeout(Duration::from_millis(10));
        let mut event_loops = Vec::new();
        let mut handles = Vec::new();
        for index in 0..n {
            let (el, handle) = EventLoop::new(index, &config).expect("Failed to create loop");
            event_loops.push(el);
            handles.push(handle);
        }
        (event_loops, Dispatcher::new(handles))
    }

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
    fn test_round_robin_admission() {
        let (_loops, dispatcher) = loops(3);
        let picked: Vec<u16> = (0..6)
            .map(|_| dispatcher.admission_loop(false).unwrap().index())
            .collect();
        assert_eq!(picked, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_force_same_thread_outside_loop() {
        let (_loops, dispatcher) = loops(2);
        let err = dispatcher.admission_loop(true).unwrap_err();
        assert!(matches!(err, Error::NotInLoopThread));
    }

    #[test]
    fn test_admit_then_send() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        let (mut event_loops, dispatcher) = loops(2);
        let (tx, rx) = crossbeam_channel::unbounded();
        let callbacks = SessionCallbacks::new().with_enter(move |id, ip| {
            tx.send((id, ip.to_string())).unwrap();
        });

        let (mut client, server) = connect(&listener);
        let target = dispatcher.loops()[1].clone();
        dispatcher
            .admit(&target, Transport::Plain(server), "127.0.0.1".into(), callbacks, 1024)
            .unwrap();
        event_loops[1].run_once(None);

        let (id, ip) = rx.try_recv().expect("enter callback fired");
        assert_eq!(id.loop_index(), 1);
        assert_eq!(ip, "127.0.0.1");

        dispatcher.send(id, &b"abc"[..]);
        event_loops[1].run_once(None);

        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn test_posts_to_closed_session_are_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        let (mut event_loops, dispatcher) = loops(1);
        let el = &mut event_loops[0];

        let (_old_client, s1) = connect(&listener);
        let old = el
            .admit(Transport::Plain(s1), "127.0.0.1".into(), SessionCallbacks::new(), 1024)
            .unwrap();
        dispatcher.disconnect(old);
        el.run_once(None);
        assert_eq!(el.session_count(), 0);

        // Slot reused by a new session
        let (mut new_client, s2) = connect(&listener);
        let new = el
            .admit(Transport::Plain(s2), "127.0.0.1".into(), SessionCallbacks::new(), 1024)
            .unwrap();
        assert_eq!(new.slot(), old.slot());

        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        dispatcher.post(old, move |_| *flag.lock().unwrap() = true);
        dispatcher.send(old, &b"stale"[..]);
        dispatcher.disconnect(old);
        el.run_once(None);

        assert!(!*ran.lock().unwrap());
        assert!(el.session(new).is_some());

        // The new session received nothing
        new_client.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 8];
        let err = new_client.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_unknown_loop_index_is_ignored() {
        let (_loops, dispatcher) = loops(1);
        let id = SessionId::new(5, 0, 1);
        assert!(dispatcher.loop_for(id).is_none());
        // No panic, nothing posted
        dispatcher.send(id, &b"x"[..]);
        dispatcher.wakeup(id);
        assert_eq!(dispatcher.loops()[0].pending_tasks(), 0);
    }

    #[test]
    fn test_send_with_runs_callback_after_write() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        let (mut event_loops, dispatcher) = loops(1);
        let el = &mut event_loops[0];
        let (mut client, server) = connect(&listener);
        let id = el
            .admit(Transport::Plain(server), "127.0.0.1".into(), SessionCallbacks::new(), 1024)
            .unwrap();

        let (tx, rx) = crossbeam_channel::bounded(1);
        dispatcher.send_with(id, vec![1u8, 2, 3], move || tx.send(()).unwrap());
        el.run_once(None);

        rx.try_recv().expect("sent callback fired");
        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn test_disconnect_fires_callback() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        let (mut event_loops, dispatcher) = loops(1);
        let el = &mut event_loops[0];
        let (_client, server) = connect(&listener);
        let (tx, rx) = crossbeam_channel::unbounded();
        let callbacks = SessionCallbacks::new().with_disconnect(move |id| tx.send(id).unwrap());
        let id = el
            .admit(Transport::Plain(server), "127.0.0.1".into(), callbacks, 1024)
            .unwrap();

        dispatcher.disconnect(id);
        dispatcher.disconnect(id);
        el.run_once(None);

        assert_eq!(rx.try_recv().unwrap(), id);
        assert!(rx.try_recv().is_err());
    }
}
