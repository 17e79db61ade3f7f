//! The **net** module is a multi-threaded TCP reactor. Connections are owned by worker
//! loops and addressed everywhere else by a `SessionId`, a plain `u64` that can be copied
//! into any thread and used long after the connection is gone without ever reaching the
//! wrong socket.
//!
//! # Architecture
//!
//! Each worker loop is a single thread running a **Reactor** over an IO multiplexer:
//! - **Linux**: epoll (edge-triggered)
//! - **macOS/BSD**: kqueue (EV_CLEAR edge-triggered)
//!
//! Every operation addressed to a session from outside its loop is posted as a task to that
//! loop and re-resolved there. A session that has closed in the meantime (or whose slot
//! now holds a newer session) makes the operation a silent no-op.
//!
//! ## Key Components
//!
//! - `TcpService`: facade owning the worker pool, the listener and the default callbacks
//! - `EventLoop`: one worker loop; owns its `SessionDirectory` and poller
//! - `Dispatcher`: cloneable, thread-safe handle posting session operations to the owning loop
//! - `CacheSendBuffer`: batches packets per loop, one task per loop on flush
//! - `ListenThread`: accept thread, optional TLS (feature `tls`)
//!
//! ## Session ID Layout
//!
//! | Bits | Field | Meaning |
//! |------|-------|---------|
//! | 0-15 | loop index | owning worker loop |
//! | 16-31 | slot | index in the loop's directory |
//! | 32-63 | generation | bumped every time the slot is freed; never 0 |
//!
//! ## Loop Iteration
//!
//! | Step | Work |
//! |------|------|
//! | 1 | Poll (bounded by the configured poll timeout) |
//! | 2 | Read readable sessions, deliver data to the data callback |
//! | 3 | Run tasks posted before this step started |
//! | 4 | Frame callback |
//! | 5 | Flush sessions touched this iteration |
//! | 6 | Idle (ping) checks |
//! | 7 | Close sessions marked for closing, fire disconnect callbacks |
//!
//! # Example
//!
//! ```rust,ignore
//! let mut service = TcpService::new();
//! service.start_worker_thread(4, None)?;
//!
//! let dispatcher: Arc<Mutex<Option<Dispatcher>>> = Default::default();
//! let echo = dispatcher.clone();
//! service.set_data_callback(move |id, data| {
//!     if let Some(d) = echo.lock().unwrap().as_ref() {
//!         d.send(id, data.to_vec());
//!     }
//!     data.len()
//! });
//! *dispatcher.lock().unwrap() = service.dispatcher();
//!
//! let addr = service.start_listen(ListenConfig::new("0.0.0.0:9000"))?;
//! println!("echo server on {addr}");
//! ```

pub mod cache_send;
pub mod connection;
pub mod directory;
pub mod dispatcher;
pub mod event_loop;
pub mod listener;
pub mod loop_pool;
mod poller;
pub mod service;
pub mod session_id;
#[cfg(feature = "tls")]
pub mod tls;
pub(crate) mod write_queue;

pub use cache_send::CacheSendBuffer;
pub use connection::{
    ConnectionState, DataCallback, DisconnectCallback, EnterCallback, SessionCallbacks,
    SessionHandler, Transport,
};
pub use dispatcher::Dispatcher;
pub use event_loop::{EventLoop, FrameCallback, LoopHandle};
pub use service::TcpService;
pub use session_id::SessionId;
pub use write_queue::SentCallback;
