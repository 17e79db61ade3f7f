use crate::error::{Error, Result};
use crate::net::connection::DEFAULT_MAX_RECV_BUFFER_SIZE;
use crate::net::session_id::MAX_SESSIONS_PER_LOOP;
use crate::net::write_queue::DEFAULT_MAX_PENDING_BYTES;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;
const DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Get the process file descriptor soft limit
///
/// Returns None if unavailable.
fn get_fd_limit() -> Option<usize> {
    use std::mem::MaybeUninit;
    let mut rlim = MaybeUninit::<libc::rlimit>::uninit();
    // SAFETY: rlim is a valid pointer to uninitialized memory,
    // getrlimit will initialize it if successful
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, rlim.as_mut_ptr()) } == 0 {
        // SAFETY: getrlimit returned 0, so rlim is now initialized
        let rlim = unsafe { rlim.assume_init() };
        return Some(usize::try_from(rlim.rlim_cur).unwrap_or(usize::MAX));
    }
    None
}

/// Sessions one loop may hold: the configured value capped at 80% of the
/// file descriptor limit, never below 1.
pub fn effective_max_sessions(configured: usize) -> usize {
    let result = match get_fd_limit() {
        // Reserve 20% of FD limit for other operations (files, listeners, wakers)
        Some(fd_limit) => configured.min((fd_limit as f64 * 0.8) as usize),
        None => configured,
    };
    result.clamp(1, MAX_SESSIONS_PER_LOOP)
}

/// Settings shared by every worker loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    max_sessions_per_loop: usize,
    max_pending_write_bytes: usize,
    poll_timeout: Duration,
    graceful_shutdown_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_loop: MAX_SESSIONS_PER_LOOP,
            max_pending_write_bytes: DEFAULT_MAX_PENDING_BYTES,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            graceful_shutdown_timeout: Duration::from_secs(DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT_SECS),
        }
    }
}

impl ServiceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upper bound on concurrent sessions per loop (at most 65536; further
    /// capped by the file descriptor limit).
    pub fn with_max_sessions_per_loop(mut self, max: usize) -> Self {
        self.max_sessions_per_loop = max;
        self
    }

    /// A session whose unsent bytes exceed this is closed.
    pub fn with_max_pending_write_bytes(mut self, max: usize) -> Self {
        self.max_pending_write_bytes = max;
        self
    }

    /// Longest a loop blocks in the poller; bounds frame callback and ping
    /// check latency on idle loops.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Time pending writes get to drain when the worker pool is closed.
    pub fn with_graceful_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_shutdown_timeout = timeout;
        self
    }

    pub fn max_sessions_per_loop(&self) -> usize {
        self.max_sessions_per_loop
    }

    pub fn effective_max_sessions(&self) -> usize {
        effective_max_sessions(self.max_sessions_per_loop)
    }

    pub fn max_pending_write_bytes(&self) -> usize {
        self.max_pending_write_bytes
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        self.graceful_shutdown_timeout
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_sessions_per_loop == 0 || self.max_sessions_per_loop > MAX_SESSIONS_PER_LOOP {
            return Err(Error::InvalidConfig(format!(
                "max_sessions_per_loop must be in 1..={}, got {}",
                MAX_SESSIONS_PER_LOOP, self.max_sessions_per_loop
            )));
        }
        if self.max_pending_write_bytes == 0 {
            return Err(Error::InvalidConfig(
                "max_pending_write_bytes must be greater than 0".into(),
            ));
        }
        if self.poll_timeout.is_zero() {
            return Err(Error::InvalidConfig("poll_timeout must be greater than 0".into()));
        }
        Ok(())
    }
}

/// Listener settings: address, optional TLS material, per-session receive cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenConfig {
    address: String,
    certificate: Option<PathBuf>,
    private_key: Option<PathBuf>,
    max_session_recv_buffer_size: usize,
}

impl ListenConfig {
    /// `address` is `host:port`; IPv4 and IPv6 (`[::1]:8080`) are both accepted.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            certificate: None,
            private_key: None,
            max_session_recv_buffer_size: DEFAULT_MAX_RECV_BUFFER_SIZE,
        }
    }

    /// Serve TLS with a PEM certificate chain and private key.
    pub fn with_tls(mut self, certificate: impl Into<PathBuf>, private_key: impl Into<PathBuf>) -> Self {
        self.certificate = Some(certificate.into());
        self.private_key = Some(private_key.into());
        self
    }

    pub fn with_max_session_recv_buffer_size(mut self, size: usize) -> Self {
        self.max_session_recv_buffer_size = size;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn certificate(&self) -> Option<&Path> {
        self.certificate.as_deref()
    }

    pub fn private_key(&self) -> Option<&Path> {
        self.private_key.as_deref()
    }

    pub fn use_tls(&self) -> bool {
        self.certificate.is_some()
    }

    pub fn max_session_recv_buffer_size(&self) -> usize {
        self.max_session_recv_buffer_size
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(Error::InvalidConfig("listen address must not be empty".into()));
        }
        if self.max_session_recv_buffer_size == 0 {
            return Err(Error::InvalidConfig(
                "max_session_recv_buffer_size must be greater than 0".into(),
            ));
        }
        if self.certificate.is_some() != self.private_key.is_some() {
            return Err(Error::InvalidConfig(
                "certificate and private key must be configured together".into(),
            ));
        }
        Ok(())
    }
}
