// src/net/listener.rs - Accept thread
//
// Binds the listen address, loads TLS material (both reported synchronously
// to the caller), then accepts on a dedicated thread. Every accepted socket is
// prepared (non-blocking, TCP_NODELAY), wrapped in a Transport (TLS when
// configured) and handed to the accept callback.

use crate::config::ListenConfig;
use crate::error::{Error, Result};
use crate::net::connection::Transport;
use log::{debug, error, info, warn};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const STATUS_INIT: usize = 0;
const STATUS_RUN: usize = 1;
const STATUS_END: usize = 2;

const ACCEPT_IDLE_SLEEP: Duration = Duration::from_millis(20);

/// Make an accepted socket ready for a worker loop. Returns the peer address.
pub(crate) fn prepare_socket(stream: &TcpStream) -> io::Result<SocketAddr> {
    let peer = stream.peer_addr()?;
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)?;
    Ok(peer)
}

/// Turns accepted sockets into transports.
#[derive(Clone, Default)]
pub(crate) struct Acceptor {
    #[cfg(feature = "tls")]
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl Acceptor {
    fn new(config: &ListenConfig) -> Result<Self> {
        #[cfg(feature = "tls")]
        {
            let tls = match (config.certificate(), config.private_key()) {
                (Some(certificate), Some(private_key)) => {
                    Some(crate::net::tls::load_server_config(certificate, private_key)?)
                }
                _ => None,
            };
            Ok(Acceptor { tls })
        }
        #[cfg(not(feature = "tls"))]
        {
            if config.use_tls() {
                return Err(Error::TlsUnavailable);
            }
            Ok(Acceptor {})
        }
    }

    fn has_tls(&self) -> bool {
        #[cfg(feature = "tls")]
        {
            self.tls.is_some()
        }
        #[cfg(not(feature = "tls"))]
        {
            false
        }
    }

    /// Transport for a listener-accepted socket: TLS whenever a certificate
    /// is loaded.
    fn transport(&self, stream: TcpStream) -> Result<Transport> {
        self.transport_for(stream, self.has_tls())
    }

    /// Transport for an externally connected socket. `use_ssl` needs a
    /// loaded certificate.
    pub(crate) fn transport_for(&self, stream: TcpStream, use_ssl: bool) -> Result<Transport> {
        if !use_ssl {
            return Ok(Transport::Plain(stream));
        }
        #[cfg(feature = "tls")]
        {
            let tls = self.tls.as_ref().ok_or(Error::TlsNotConfigured)?;
            Transport::tls(tls.clone(), stream)
        }
        #[cfg(not(feature = "tls"))]
        {
            drop(stream);
            Err(Error::TlsUnavailable)
        }
    }
}

/// Listener running on its own thread.
pub struct ListenThread {
    status: Arc<AtomicUsize>,
    thread: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    acceptor: Acceptor,
}

impl ListenThread {
    pub fn new() -> Self {
        Self {
            status: Arc::new(AtomicUsize::new(STATUS_INIT)),
            thread: None,
            local_addr: None,
            acceptor: Acceptor::default(),
        }
    }

    /// Bind `config.address()` and start accepting.
    ///
    /// # Parameters
    /// - `config`: address, optional certificate / private key
    /// - `on_accept`: called on the listener thread with each prepared
    ///   transport and its peer address
    ///
    /// # Returns
    /// The bound address (useful when binding port 0). Bind failures and bad
    /// TLS material are returned here, before any thread is spawned.
    pub fn start_listen<F>(&mut self, config: &ListenConfig, mut on_accept: F) -> Result<SocketAddr>
    where
        F: FnMut(Transport, SocketAddr) + Send + 'static,
    {
        if let (Some(addr), true) = (self.local_addr, self.is_running()) {
            return Err(Error::ListenerAlreadyRunning(addr));
        }
        config.validate()?;

        let acceptor = Acceptor::new(config)?;

        let listener = TcpListener::bind(config.address())?;
        // Get actual bound address (important for port 0)
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let status = Arc::new(AtomicUsize::new(STATUS_RUN));
        let thread_status = status.clone();
        let thread_acceptor = acceptor.clone();
        let name = "ez-tcp-listener".to_string();
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || accept_loop(listener, thread_acceptor, thread_status, &mut on_accept))
            .map_err(|source| Error::ThreadSpawn { name, source })?;

        self.status = status;
        self.thread = Some(thread);
        self.local_addr = Some(local_addr);
        self.acceptor = acceptor;

        info!(
            "Listening for connections on {} (actual: {}, tls: {})",
            config.address(),
            local_addr,
            config.use_tls()
        );
        Ok(local_addr)
    }

    /// Stop accepting and join the listener thread.
    pub fn close_listen_thread(&mut self) {
        self.status.store(STATUS_END, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Listener thread panicked");
            }
        }
        self.local_addr = None;
    }

    pub fn is_running(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_RUN
            && self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Returns the actual bound address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub(crate) fn acceptor(&self) -> &Acceptor {
        &self.acceptor
    }

    /// Server config loaded from the listener's certificate, if any
    #[cfg(feature = "tls")]
    pub fn tls_config(&self) -> Option<&Arc<rustls::ServerConfig>> {
        self.acceptor.tls.as_ref()
    }
}

impl Default for ListenThread {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ListenThread {
    fn drop(&mut self) {
        self.close_listen_thread();
    }
}

fn accept_loop<F>(listener: TcpListener, acceptor: Acceptor, status: Arc<AtomicUsize>, on_accept: &mut F)
where
    F: FnMut(Transport, SocketAddr),
{
    while status.load(Ordering::Acquire) == STATUS_RUN {
        match listener.accept() {
            Ok((stream, peer)) => {
                let transport = prepare_socket(&stream)
                    .map_err(Error::from)
                    .and_then(|_| acceptor.transport(stream));
                match transport {
                    Ok(transport) => {
                        debug!("Accepted connection from {}", peer);
                        on_accept(transport, peer);
                    }
                    Err(e) => debug!("Dropping connection from {}: {}", peer, e),
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_IDLE_SLEEP);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                // e.g. EMFILE; back off instead of spinning
                warn!("Accept error: {:?}", e);
                std::thread::sleep(ACCEPT_IDLE_SLEEP);
            }
        }
    }
    info!("Listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_accepts_and_prepares_sockets() {
        let mut listener = ListenThread::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        let addr = listener
            .start_listen(&ListenConfig::new("127.0.0.1:0"), move |transport, peer| {
                tx.send((transport, peer)).unwrap();
            })
            .expect("Failed to listen");
        assert_ne!(addr.port(), 0);
        assert_eq!(listener.local_addr(), Some(addr));
        assert!(listener.is_running());

        let mut client = TcpStream::connect(addr).expect("Failed to connect");
        let (transport, peer) = rx.recv_timeout(Duration::from_secs(2)).expect("accepted");
        assert_eq!(peer, client.local_addr().unwrap());
        assert!(!transport.is_tls());

        // Non-blocking: nothing to read yet
        let mut transport = transport;
        let mut buf = [0u8; 4];
        let err = transport.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(transport.socket().nodelay().unwrap());

        client.write_all(b"ping").unwrap();
        transport.write_all(b"pong").unwrap();
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");

        listener.close_listen_thread();
        assert!(!listener.is_running());
        assert_eq!(listener.local_addr(), None);
    }

    #[test]
    fn test_bind_failure_is_synchronous() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let mut listener = ListenThread::new();
        let err = listener
            .start_listen(&ListenConfig::new(addr.to_string()), |_, _| {})
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(!listener.is_running());
    }

    #[test]
    fn test_second_start_rejected() {
        let mut listener = ListenThread::new();
        let addr = listener
            .start_listen(&ListenConfig::new("127.0.0.1:0"), |_, _| {})
            .unwrap();
        let err = listener
            .start_listen(&ListenConfig::new("127.0.0.1:0"), |_, _| {})
            .unwrap_err();
        assert!(matches!(err, Error::ListenerAlreadyRunning(a) if a == addr));

        // Restart after close
        listener.close_listen_thread();
        assert!(listener.start_listen(&ListenConfig::new("127.0.0.1:0"), |_, _| {}).is_ok());
    }

    #[cfg(not(feature = "tls"))]
    #[test]
    fn test_tls_without_feature() {
        let mut listener = ListenThread::new();
        let config = ListenConfig::new("127.0.0.1:0").with_tls("cert.pem", "key.pem");
        let err = listener.start_listen(&config, |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::TlsUnavailable));
    }

    #[cfg(feature = "tls")]
    #[test]
    fn test_bad_tls_material_is_synchronous() {
        let mut listener = ListenThread::new();
        let config = ListenConfig::new("127.0.0.1:0")
            .with_tls("/nonexistent/cert.pem", "/nonexistent/key.pem");
        let err = listener.start_listen(&config, |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::TlsMaterial { .. }));
        assert!(listener.tls_config().is_none());
    }
}
