use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid worker loop count {0}: expected 1..={max}", max = crate::net::session_id::MAX_LOOPS)]
    InvalidLoopCount(usize),

    #[error("Worker loops are already started")]
    WorkerAlreadyStarted,

    #[error("Worker loops are not started")]
    WorkerNotStarted,

    #[error("Failed to spawn thread {name}: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Session directory is full ({capacity} sessions)")]
    DirectoryFull { capacity: usize },

    #[error("Worker loop {0} no longer accepts tasks")]
    LoopClosed(u16),

    #[error("Current thread does not run a worker loop")]
    NotInLoopThread,

    #[error("Listener is already running on {0}")]
    ListenerAlreadyRunning(SocketAddr),

    #[error("TLS requested but no certificate/private key is configured")]
    TlsNotConfigured,

    #[error("TLS support is not compiled in (enable the `tls` feature)")]
    TlsUnavailable,

    #[error("Invalid TLS material in {path}: {reason}")]
    TlsMaterial { path: PathBuf, reason: String },

    #[cfg(feature = "tls")]
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = Error::DirectoryFull { capacity: 16 };
        assert_eq!(err.to_string(), "Session directory is full (16 sessions)");

        let err = Error::InvalidLoopCount(0);
        assert_eq!(err.to_string(), "Invalid worker loop count 0: expected 1..=65536");

        let err: Error = std::io::Error::new(std::io::ErrorKind::AddrInUse, "busy").into();
        assert!(matches!(err, Error::Io(_)));
    }
}
