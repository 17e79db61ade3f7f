//! # ez-tcp
//!
//! A multi-threaded TCP reactor. A fixed pool of worker loops owns the connections; the rest
//! of the application refers to them through a `SessionId`, a copyable `u64` that encodes the
//! owning loop, the slot in that loop's directory and the slot's generation. IDs of closed
//! sessions never reach a newer session that reuses the slot: every operation is re-checked
//! on the owning loop and silently dropped when stale.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ez_tcp::{ListenConfig, TcpService};
//!
//! let mut service = TcpService::new();
//! service.set_enter_callback(|id, ip| println!("session {id} from {ip}"));
//! service.set_disconnect_callback(|id| println!("session {id} closed"));
//! service.set_data_callback(|_id, data| data.len());
//!
//! service.start_worker_thread(4, None)?;
//! service.start_listen(ListenConfig::new("0.0.0.0:9000"))?;
//!
//! // Any thread: clone the dispatcher and send by id
//! let dispatcher = service.dispatcher().unwrap();
//! std::thread::spawn(move || dispatcher.send(id, &b"hello"[..]));
//! ```
//!
//! ## Features
//!
//! - **`tls`**: serve TLS through rustls (ring provider) with a PEM certificate and key
//!   given in [`ListenConfig::with_tls`].
//!
//! ## Logging
//!
//! All diagnostics go through the [`log`] facade; install any logger (e.g. `env_logger`)
//! to see them.

pub mod config;
pub mod error;
pub mod net;

pub use config::{ListenConfig, ServiceConfig};
pub use error::{Error, Result};
pub use net::{
    CacheSendBuffer, Dispatcher, EventLoop, FrameCallback, LoopHandle, SessionCallbacks,
    SessionHandler, SessionId, TcpService,
};
