// src/net/connection.rs - Session connection owned by a worker loop
//
// Core features:
// - Plain or TLS (rustls) transport behind one Read/Write surface
// - Strict drain until WouldBlock on read (edge-triggered poller)
// - Bounded receive buffer, the data callback reports how much it consumed
// - FIFO write queue with per-packet sent callbacks
// - Half-close after the queue drains, forced close, read-idle timeout

use crate::net::poller::{Interest, RawHandle};
use crate::net::session_id::SessionId;
use crate::net::write_queue::{FlushResult, SentCallback, WriteQueue};
use bytes::{Buf, Bytes, BytesMut};
use log::{debug, warn};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

const READ_BUFFER_SIZE: usize = 8192;

/// Default cap on unconsumed inbound bytes per session
pub const DEFAULT_MAX_RECV_BUFFER_SIZE: usize = 64 * 1024;

// ============================================================================
// Callbacks
// ============================================================================

/// Fired on the loop thread once a session is admitted, with its peer ip.
pub type EnterCallback = Arc<dyn Fn(SessionId, &str) + Send + Sync>;
/// Fired on the loop thread after a session is removed.
pub type DisconnectCallback = Arc<dyn Fn(SessionId) + Send + Sync>;
/// Receives all buffered inbound bytes, returns how many were consumed.
pub type DataCallback = Arc<dyn Fn(SessionId, &[u8]) -> usize + Send + Sync>;

/// Callbacks attached to a session at admission.
#[derive(Clone, Default)]
pub struct SessionCallbacks {
    pub on_enter: Option<EnterCallback>,
    pub on_disconnect: Option<DisconnectCallback>,
    pub on_data: Option<DataCallback>,
}

impl SessionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enter<F>(mut self, f: F) -> Self
    where
        F: Fn(SessionId, &str) + Send + Sync + 'static,
    {
        self.on_enter = Some(Arc::new(f));
        self
    }

    pub fn with_disconnect<F>(mut self, f: F) -> Self
    where
        F: Fn(SessionId) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    pub fn with_data<F>(mut self, f: F) -> Self
    where
        F: Fn(SessionId, &[u8]) -> usize + Send + Sync + 'static,
    {
        self.on_data = Some(Arc::new(f));
        self
    }

    /// Fill the unset callbacks from `defaults`.
    pub fn or_defaults(self, defaults: &SessionCallbacks) -> Self {
        SessionCallbacks {
            on_enter: self.on_enter.or_else(|| defaults.on_enter.clone()),
            on_disconnect: self.on_disconnect.or_else(|| defaults.on_disconnect.clone()),
            on_data: self.on_data.or_else(|| defaults.on_data.clone()),
        }
    }
}

impl std::fmt::Debug for SessionCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCallbacks")
            .field("on_enter", &self.on_enter.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_data", &self.on_data.is_some())
            .finish()
    }
}

/// Object-style alternative to closures. All methods run on the loop thread
/// owning the session.
pub trait SessionHandler: Send + Sync + 'static {
    fn on_enter(&self, _id: SessionId, _peer_ip: &str) {}

    fn on_disconnect(&self, _id: SessionId) {}

    /// Returns the number of bytes consumed; the rest is offered again with
    /// the next bytes that arrive.
    fn on_data(&self, _id: SessionId, data: &[u8]) -> usize {
        data.len()
    }
}

impl<H: SessionHandler> From<Arc<H>> for SessionCallbacks {
    fn from(handler: Arc<H>) -> Self {
        let enter = handler.clone();
        let disconnect = handler.clone();
        SessionCallbacks::new()
            .with_enter(move |id, ip| enter.on_enter(id, ip))
            .with_disconnect(move |id| disconnect.on_disconnect(id))
            .with_data(move |id, data| handler.on_data(id, data))
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Byte stream under a session
pub enum Transport {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls {
        session: Box<rustls::ServerConnection>,
        socket: TcpStream,
    },
}

impl Transport {
    #[cfg(feature = "tls")]
    pub fn tls(config: Arc<rustls::ServerConfig>, socket: TcpStream) -> crate::error::Result<Self> {
        let session = rustls::ServerConnection::new(config)?;
        Ok(Transport::Tls {
            session: Box::new(session),
            socket,
        })
    }

    pub fn socket(&self) -> &TcpStream {
        match self {
            Transport::Plain(socket) => socket,
            #[cfg(feature = "tls")]
            Transport::Tls { socket, .. } => socket,
        }
    }

    pub fn is_tls(&self) -> bool {
        !matches!(self, Transport::Plain(_))
    }

    /// Encrypted bytes are waiting for the socket
    fn wants_write(&self) -> bool {
        match self {
            Transport::Plain(_) => false,
            #[cfg(feature = "tls")]
            Transport::Tls { session, .. } => session.wants_write(),
        }
    }

    /// Push buffered TLS records out; WouldBlock leaves them buffered.
    fn flush_pending(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(_) => Ok(()),
            #[cfg(feature = "tls")]
            Transport::Tls { session, socket } => flush_tls(session, socket),
        }
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        #[cfg(feature = "tls")]
        if let Transport::Tls { session, socket } = self {
            session.send_close_notify();
            flush_tls(session, socket)?;
        }
        self.socket().shutdown(Shutdown::Write)
    }

    fn close(&mut self) {
        #[cfg(feature = "tls")]
        if let Transport::Tls { session, socket } = self {
            session.send_close_notify();
            let _ = flush_tls(session, socket);
        }
        if let Err(e) = self.socket().shutdown(Shutdown::Both) {
            debug!("Socket shutdown error (expected if already closed): {:?}", e);
        }
    }
}

#[cfg(feature = "tls")]
fn flush_tls(session: &mut rustls::ServerConnection, socket: &mut TcpStream) -> io::Result<()> {
    while session.wants_write() {
        match session.write_tls(socket) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(socket) => socket.read(buf),
            #[cfg(feature = "tls")]
            Transport::Tls { session, socket } => loop {
                match session.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }

                // No plaintext buffered; pull more records off the socket
                if session.read_tls(socket)? == 0 {
                    return Ok(0);
                }
                if let Err(e) = session.process_new_packets() {
                    // Best effort: deliver the alert before failing
                    let _ = flush_tls(session, socket);
                    return Err(io::Error::new(io::ErrorKind::InvalidData, e));
                }
                // Handshake messages produced by the records just processed
                flush_tls(session, socket)?;
            },
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(socket) => socket.write(buf),
            #[cfg(feature = "tls")]
            Transport::Tls { session, socket } => {
                let mut n = session.writer().write(buf)?;
                flush_tls(session, socket)?;
                if n == 0 && !buf.is_empty() {
                    // The flush may have emptied the send buffer
                    n = session.writer().write(buf)?;
                    flush_tls(session, socket)?;
                }
                if n == 0 && !buf.is_empty() {
                    // rustls send buffer is full until the socket drains
                    return Err(io::ErrorKind::WouldBlock.into());
                }
                Ok(n)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(socket) => socket.flush(),
            #[cfg(feature = "tls")]
            Transport::Tls { session, socket } => flush_tls(session, socket),
        }
    }
}

// ============================================================================
// Connection State Machine
// ============================================================================

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Reading and writing
    Active,
    /// Will be closed at the end of the current loop iteration
    Closing,
    /// Socket closed, waiting for removal
    Closed,
}

impl ConnectionState {
    pub fn can_read(&self) -> bool {
        matches!(self, ConnectionState::Active)
    }

    pub fn can_write(&self) -> bool {
        matches!(self, ConnectionState::Active)
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A live session, reachable from other threads only through its SessionId.
pub struct Connection {
    id: SessionId,
    transport: Transport,
    raw_handle: RawHandle,
    peer_ip: String,
    state: ConnectionState,
    write_queue: WriteQueue,
    /// Bytes received but not yet consumed by the data callback
    recv_buffer: BytesMut,
    max_recv_buffer_size: usize,
    read_chunk: Vec<u8>,
    callbacks: SessionCallbacks,
    /// Read-idle timeout (ping check)
    check_time: Option<Duration>,
    last_recv: Instant,
    /// Half-close requested, applied once the write queue drains
    shutdown_pending: bool,
    write_closed: bool,
    /// Interest currently registered with the poller
    registered_interest: Interest,
}

impl Connection {
    pub fn new(
        id: SessionId,
        transport: Transport,
        peer_ip: String,
        callbacks: SessionCallbacks,
        max_recv_buffer_size: usize,
        max_pending_write_bytes: usize,
    ) -> Self {
        let raw_handle = transport.socket().as_raw_fd();
        let max_recv_buffer_size = max_recv_buffer_size.max(1);

        Self {
            id,
            transport,
            raw_handle,
            peer_ip,
            state: ConnectionState::Active,
            write_queue: WriteQueue::with_limit(max_pending_write_bytes),
            recv_buffer: BytesMut::with_capacity(max_recv_buffer_size.min(READ_BUFFER_SIZE)),
            max_recv_buffer_size,
            read_chunk: vec![0u8; READ_BUFFER_SIZE],
            callbacks,
            check_time: None,
            last_recv: Instant::now(),
            shutdown_pending: false,
            write_closed: false,
            registered_interest: Interest::READABLE,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer_ip(&self) -> &str {
        &self.peer_ip
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_tls(&self) -> bool {
        self.transport.is_tls()
    }

    pub fn raw_handle(&self) -> RawHandle {
        self.raw_handle
    }

    pub fn callbacks(&self) -> &SessionCallbacks {
        &self.callbacks
    }

    /// Bytes queued but not yet written to the socket
    pub fn pending_write_bytes(&self) -> usize {
        self.write_queue.pending_bytes()
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.write_queue.is_empty() || self.transport.wants_write()
    }

    /// Queue a packet. `on_sent` fires on this loop thread once the whole
    /// packet reached the socket.
    pub fn send(&mut self, data: Bytes, on_sent: Option<SentCallback>) {
        if !self.state.can_write() || self.shutdown_pending || self.write_closed {
            debug!("Session {} is not writable, dropping {} bytes", self.id, data.len());
            return;
        }
        if !self.write_queue.enqueue(data, on_sent) {
            warn!(
                "Session {} has {} bytes pending, closing slow peer",
                self.id,
                self.write_queue.pending_bytes()
            );
            self.force_close();
        }
    }

    /// Half-close: stop writing once every queued packet is sent.
    pub fn shutdown(&mut self) {
        if self.state.can_write() && !self.write_closed {
            self.shutdown_pending = true;
        }
    }

    /// Close at the end of the current loop iteration, discarding pending writes.
    pub fn force_close(&mut self) {
        if self.state == ConnectionState::Active {
            self.state = ConnectionState::Closing;
        }
    }

    /// Close the session if nothing is received for `check_time`.
    /// `None` disables the check.
    pub fn set_check_time(&mut self, check_time: Option<Duration>) {
        self.check_time = check_time.filter(|d| !d.is_zero());
        self.last_recv = Instant::now();
    }

    pub fn check_time(&self) -> Option<Duration> {
        self.check_time
    }

    pub fn is_idle_timed_out(&self, now: Instant) -> bool {
        match self.check_time {
            Some(limit) => now.saturating_duration_since(self.last_recv) >= limit,
            None => false,
        }
    }

    /// Read everything available (drain until WouldBlock) and hand it to the
    /// data callback. Failures move the connection to Closing.
    pub fn handle_readable(&mut self) {
        let mut eof = false;

        while self.state.can_read() {
            let space = self.max_recv_buffer_size.saturating_sub(self.recv_buffer.len());
            if space == 0 {
                self.deliver();
                if self.recv_buffer.len() >= self.max_recv_buffer_size {
                    warn!(
                        "Session {} receive buffer full ({} bytes unconsumed), closing",
                        self.id,
                        self.recv_buffer.len()
                    );
                    self.force_close();
                    return;
                }
                continue;
            }

            let want = space.min(self.read_chunk.len());
            match self.transport.read(&mut self.read_chunk[..want]) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => {
                    self.last_recv = Instant::now();
                    self.recv_buffer.extend_from_slice(&self.read_chunk[..n]);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("Session {} read error: {:?}", self.id, e);
                    self.force_close();
                    return;
                }
            }
        }

        self.deliver();
        if eof {
            debug!("Session {} closed by peer", self.id);
            self.force_close();
        }
    }

    fn deliver(&mut self) {
        if self.recv_buffer.is_empty() {
            return;
        }
        let len = self.recv_buffer.len();
        let consumed = match &self.callbacks.on_data {
            Some(on_data) => on_data(self.id, &self.recv_buffer[..]).min(len),
            None => len,
        };
        self.recv_buffer.advance(consumed);
    }

    /// Try to flush write queue (drain until WouldBlock)
    ///
    /// Returns whether connection should be closed
    pub fn try_flush(&mut self) -> bool {
        if !self.write_queue.is_empty() {
            match self.write_queue.try_flush(&mut self.transport) {
                Ok(FlushResult::Complete { .. }) | Ok(FlushResult::WouldBlock { .. }) => {}
                Ok(FlushResult::Closed) => return true,
                Err(e) => {
                    debug!("Session {} write error: {:?}", self.id, e);
                    return true;
                }
            }
        }

        if let Err(e) = self.transport.flush_pending() {
            debug!("Session {} write error: {:?}", self.id, e);
            return true;
        }

        if self.shutdown_pending && !self.has_pending_writes() {
            self.shutdown_pending = false;
            self.write_closed = true;
            if let Err(e) = self.transport.shutdown_write() {
                debug!("Session {} half-close failed: {:?}", self.id, e);
                return true;
            }
        }
        false
    }

    /// Get desired Interest
    pub fn desired_interest(&self) -> Interest {
        let mut interest = if self.state.can_read() {
            Interest::READABLE
        } else {
            Interest::NONE
        };
        if self.has_pending_writes() {
            interest = interest.add_writable();
        }
        interest
    }

    pub(crate) fn registered_interest(&self) -> Interest {
        self.registered_interest
    }

    pub(crate) fn set_registered_interest(&mut self, interest: Interest) {
        self.registered_interest = interest;
    }

    /// Close the socket
    pub fn close(&mut self) {
        if self.state != ConnectionState::Closed {
            self.transport.close();
            self.state = ConnectionState::Closed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::Mutex;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get address");
        let client = TcpStream::connect(addr).expect("Failed to connect");
        let (server, _) = listener.accept().expect("Failed to accept");
        server.set_nonblocking(true).expect("Failed to set nonblocking");
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("Failed to set timeout");
        (client, server)
    }

    fn connection(server: TcpStream, callbacks: SessionCallbacks, max_recv: usize) -> Connection {
        Connection::new(
            SessionId::new(0, 0, 1),
            Transport::Plain(server),
            "127.0.0.1".to_string(),
            callbacks,
            max_recv,
            1024 * 1024,
        )
    }

    /// Poll the connection until `done` holds or a second passes.
    fn read_until(conn: &mut Connection, done: impl Fn(&Connection) -> bool) {
        for _ in 0..100 {
            conn.handle_readable();
            if done(conn) {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_data_callback_partial_consumption() {
        let (mut client, server) = tcp_pair();
        let seen = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
        let sink = seen.clone();
        // Consume whole 4-byte frames only
        let callbacks = SessionCallbacks::new().with_data(move |_, data| {
            sink.lock().unwrap().push(data.to_vec());
            data.len() / 4 * 4
        });
        let mut conn = connection(server, callbacks, 1024);

        client.write_all(b"abcdef").unwrap();
        read_until(&mut conn, |c| c.recv_buffer.len() == 2);
        assert_eq!(seen.lock().unwrap().last().unwrap(), b"abcdef");

        client.write_all(b"gh").unwrap();
        read_until(&mut conn, |c| c.recv_buffer.is_empty());
        assert_eq!(seen.lock().unwrap().last().unwrap(), b"efgh");
        assert_eq!(conn.state(), ConnectionState::Active);
    }

    #[test]
    fn test_full_recv_buffer_closes() {
        let (mut client, server) = tcp_pair();
        let callbacks = SessionCallbacks::new().with_data(|_, _| 0);
        let mut conn = connection(server, callbacks, 16);

        client.write_all(&[7u8; 64]).unwrap();
        read_until(&mut conn, |c| c.state() != ConnectionState::Active);
        assert_eq!(conn.state(), ConnectionState::Closing);
    }

    #[test]
    fn test_eof_marks_closing() {
        let (client, server) = tcp_pair();
        let mut conn = connection(server, SessionCallbacks::new(), 1024);
        drop(client);

        read_until(&mut conn, |c| c.state() != ConnectionState::Active);
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert_eq!(conn.desired_interest(), Interest::NONE);
    }

    #[test]
    fn test_send_and_flush_fires_sent_callback() {
        let (mut client, server) = tcp_pair();
        let mut conn = connection(server, SessionCallbacks::new(), 1024);
        let sent = Arc::new(Mutex::new(false));
        let flag = sent.clone();

        conn.send(
            Bytes::from_static(b"ping"),
            Some(Box::new(move || *flag.lock().unwrap() = true)),
        );
        assert!(conn.desired_interest().writable);
        assert!(!conn.try_flush());
        assert!(*sent.lock().unwrap());
        assert!(!conn.has_pending_writes());

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_shutdown_after_queue_drains() {
        let (mut client, server) = tcp_pair();
        let mut conn = connection(server, SessionCallbacks::new(), 1024);

        conn.send(Bytes::from_static(b"bye"), None);
        conn.shutdown();
        // Sends after shutdown are dropped
        conn.send(Bytes::from_static(b"late"), None);
        assert!(!conn.try_flush());

        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"bye");
        assert_eq!(conn.state(), ConnectionState::Active);
    }

    #[test]
    fn test_write_queue_overflow_closes() {
        let (_client, server) = tcp_pair();
        let mut conn = Connection::new(
            SessionId::new(0, 0, 1),
            Transport::Plain(server),
            "127.0.0.1".to_string(),
            SessionCallbacks::new(),
            1024,
            8,
        );
        conn.send(Bytes::from_static(b"12345678"), None);
        assert_eq!(conn.state(), ConnectionState::Active);
        conn.send(Bytes::from_static(b"9"), None);
        assert_eq!(conn.state(), ConnectionState::Closing);
    }

    #[test]
    fn test_idle_timeout() {
        let (_client, server) = tcp_pair();
        let mut conn = connection(server, SessionCallbacks::new(), 1024);
        let now = Instant::now();
        assert!(!conn.is_idle_timed_out(now + Duration::from_secs(3600)));

        conn.set_check_time(Some(Duration::from_millis(50)));
        assert!(!conn.is_idle_timed_out(Instant::now()));
        assert!(conn.is_idle_timed_out(Instant::now() + Duration::from_millis(60)));

        conn.set_check_time(Some(Duration::ZERO));
        assert_eq!(conn.check_time(), None);
    }

    struct Counter(Mutex<usize>);

    impl SessionHandler for Counter {
        fn on_data(&self, _id: SessionId, data: &[u8]) -> usize {
            *self.0.lock().unwrap() += data.len();
            data.len()
        }
    }

    #[test]
    fn test_handler_into_callbacks() {
        let handler = Arc::new(Counter(Mutex::new(0)));
        let callbacks: SessionCallbacks = handler.clone().into();
        assert!(callbacks.on_enter.is_some());

        let on_data = callbacks.on_data.unwrap();
        assert_eq!(on_data(SessionId::new(0, 0, 1), b"abc"), 3);
        assert_eq!(*handler.0.lock().unwrap(), 3);
    }

    #[test]
    fn test_unset_callbacks_fall_back_to_defaults() {
        let defaults = SessionCallbacks::new()
            .with_data(|_, _| 7)
            .with_disconnect(|_| {});
        let own = SessionCallbacks::new().with_data(|_, data| data.len());

        let merged = own.or_defaults(&defaults);
        assert!(merged.on_enter.is_none());
        assert!(merged.on_disconnect.is_some());
        let on_data = merged.on_data.unwrap();
        assert_eq!(on_data(SessionId::new(0, 0, 1), b"abc"), 3);
    }
}
