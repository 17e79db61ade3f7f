// src/net/service.rs - TcpService facade
//
// Composes the worker pool, the listener, default session callbacks and a
// service-owned cache-send buffer. Lifecycle methods take `&mut self`;
// per-session operations take `&self` and only ever post tasks. Threads
// other than the controlling one use a cloned `Dispatcher`.

use crate::config::{ListenConfig, ServiceConfig};
use crate::error::{Error, Result};
use crate::net::cache_send::CacheSendBuffer;
use crate::net::connection::{
    DataCallback, DisconnectCallback, EnterCallback, SessionCallbacks, SessionHandler,
};
use crate::net::dispatcher::Dispatcher;
use crate::net::event_loop::{FrameCallback, LoopHandle};
use crate::net::listener::{Acceptor, ListenThread};
use crate::net::loop_pool::LoopPool;
use crate::net::session_id::SessionId;
use bytes::Bytes;
use log::{debug, warn};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

pub struct TcpService {
    config: ServiceConfig,
    /// Defaults for sessions admitted without their own callbacks
    callbacks: Arc<RwLock<SessionCallbacks>>,
    /// TLS material of the last started listener, for `use_ssl` admissions
    acceptor: Arc<RwLock<Acceptor>>,
    cache: Mutex<CacheSendBuffer>,
    pool: Option<LoopPool>,
    listener: ListenThread,
}

impl TcpService {
    pub fn new() -> Self {
        Self::build(ServiceConfig::default())
    }

    pub fn with_config(config: ServiceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: ServiceConfig) -> Self {
        Self {
            config,
            callbacks: Arc::new(RwLock::new(SessionCallbacks::default())),
            acceptor: Arc::new(RwLock::new(Acceptor::default())),
            cache: Mutex::new(CacheSendBuffer::new()),
            pool: None,
            listener: ListenThread::new(),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Default callbacks
    // ------------------------------------------------------------------

    fn update_callbacks(&self, update: impl FnOnce(&mut SessionCallbacks)) {
        let mut callbacks = self.callbacks.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut callbacks);
    }

    /// Snapshot of the default callbacks
    pub fn session_callbacks(&self) -> SessionCallbacks {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_enter_callback<F>(&self, f: F)
    where
        F: Fn(SessionId, &str) + Send + Sync + 'static,
    {
        self.update_callbacks(|callbacks| callbacks.on_enter = Some(Arc::new(f)));
    }

    pub fn set_disconnect_callback<F>(&self, f: F)
    where
        F: Fn(SessionId) + Send + Sync + 'static,
    {
        self.update_callbacks(|callbacks| callbacks.on_disconnect = Some(Arc::new(f)));
    }

    /// `f` receives every buffered inbound byte and returns how many it consumed.
    pub fn set_data_callback<F>(&self, f: F)
    where
        F: Fn(SessionId, &[u8]) -> usize + Send + Sync + 'static,
    {
        self.update_callbacks(|callbacks| callbacks.on_data = Some(Arc::new(f)));
    }

    /// Replace all three default callbacks with `handler`'s methods.
    pub fn set_session_handler<H: SessionHandler>(&self, handler: Arc<H>) {
        let handler_callbacks = SessionCallbacks::from(handler);
        self.update_callbacks(|callbacks| *callbacks = handler_callbacks);
    }

    pub fn enter_callback(&self) -> Option<EnterCallback> {
        self.session_callbacks().on_enter
    }

    pub fn disconnect_callback(&self) -> Option<DisconnectCallback> {
        self.session_callbacks().on_disconnect
    }

    pub fn data_callback(&self) -> Option<DataCallback> {
        self.session_callbacks().on_data
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start `thread_num` worker loops. `frame_callback` runs once per loop
    /// iteration on every loop thread.
    pub fn start_worker_thread(
        &mut self,
        thread_num: usize,
        frame_callback: Option<FrameCallback>,
    ) -> Result<()> {
        if self.pool.is_some() {
            return Err(Error::WorkerAlreadyStarted);
        }
        let mut pool = LoopPool::start(thread_num, &self.config, frame_callback)?;
        pool.dispatcher_mut()
            .share_admission(self.callbacks.clone(), self.acceptor.clone());
        self.pool = Some(pool);
        Ok(())
    }

    /// Signal every loop to exit and join the threads. Sessions are kept
    /// (not closed, no callbacks) until [`close_worker_thread`](Self::close_worker_thread).
    /// Connections accepted by the listener meanwhile are closed right away.
    pub fn stop_worker_thread(&mut self) {
        if let Some(pool) = self.pool.as_mut() {
            pool.stop();
        }
    }

    /// Stop the loops, give pending writes the configured grace period, close
    /// every session and free the loops.
    pub fn close_worker_thread(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.close(self.config.graceful_shutdown_timeout());
        }
    }

    /// Listen on `config.address()`; accepted connections are admitted
    /// round-robin with the default callbacks current at accept time.
    ///
    /// # Returns
    /// The bound address. Bind failures and unusable TLS material are
    /// reported here.
    pub fn start_listen(&mut self, config: ListenConfig) -> Result<SocketAddr> {
        let dispatcher = self.running_dispatcher()?.clone();
        let max_recv_buffer_size = config.max_session_recv_buffer_size();

        let addr = self.listener.start_listen(&config, move |transport, peer| {
            // An Err drops the transport, closing the socket
            let result = dispatcher.admission_loop(false).and_then(|target| {
                dispatcher.admit(
                    target,
                    transport,
                    peer.ip().to_string(),
                    dispatcher.default_callbacks(),
                    max_recv_buffer_size,
                )
            });
            if let Err(e) = result {
                warn!("Failed to admit connection from {}: {}", peer, e);
            }
        })?;

        *self.acceptor.write().unwrap_or_else(PoisonError::into_inner) =
            self.listener.acceptor().clone();
        Ok(addr)
    }

    pub fn close_listen_thread(&mut self) {
        self.listener.close_listen_thread();
    }

    /// Bound listen address, while listening
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Close the listener, then the worker pool. Also run on drop.
    pub fn close_service(&mut self) {
        self.close_listen_thread();
        self.close_worker_thread();
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Admit an already connected socket.
    ///
    /// # Parameters
    /// - `callbacks`: per-session callbacks; unset ones fall back to the
    ///   service defaults
    /// - `use_ssl`: serve TLS with the listener's certificate
    /// - `max_recv_buffer_size`: cap on unconsumed inbound bytes
    /// - `force_same_thread_loop`: admit into the loop running the calling
    ///   thread. Loop tasks and callbacks reach this through
    ///   [`Dispatcher::add_data_socket`].
    ///
    /// The session id is issued asynchronously on the chosen loop and
    /// delivered to the enter callback. `Ok` only means the socket was handed
    /// to a loop: when that loop's directory is full the socket is closed,
    /// an error is logged and no callback fires.
    pub fn add_data_socket(
        &self,
        stream: TcpStream,
        callbacks: SessionCallbacks,
        use_ssl: bool,
        max_recv_buffer_size: usize,
        force_same_thread_loop: bool,
    ) -> Result<()> {
        self.running_dispatcher()?.add_data_socket(
            stream,
            callbacks,
            use_ssl,
            max_recv_buffer_size,
            force_same_thread_loop,
        )
    }

    fn running_dispatcher(&self) -> Result<&Dispatcher> {
        match &self.pool {
            Some(pool) if pool.is_running() => Ok(pool.dispatcher()),
            _ => Err(Error::WorkerNotStarted),
        }
    }

    // ------------------------------------------------------------------
    // Session operations
    // ------------------------------------------------------------------

    /// Session-addressed operations, cloneable into other threads.
    pub fn dispatcher(&self) -> Option<Dispatcher> {
        self.pool.as_ref().map(|pool| pool.dispatcher().clone())
    }

    fn with_dispatcher(&self, id: SessionId, op: impl FnOnce(&Dispatcher)) {
        match &self.pool {
            Some(pool) => op(pool.dispatcher()),
            None => debug!("No worker loops, dropping operation for session {}", id),
        }
    }

    pub fn send(&self, id: SessionId, packet: impl Into<Bytes>) {
        self.with_dispatcher(id, |d| d.send(id, packet));
    }

    /// Send and run `on_sent` on the owning loop once the packet is written.
    pub fn send_with<F>(&self, id: SessionId, packet: impl Into<Bytes>, on_sent: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.with_dispatcher(id, |d| d.send_with(id, packet, on_sent));
    }

    /// Buffer a packet in the service cache until [`flush_cache_packet_list`](Self::flush_cache_packet_list).
    pub fn cache_send(&self, id: SessionId, packet: impl Into<Bytes>) {
        self.lock_cache().cache_send(id, packet, None);
    }

    pub fn cache_send_with<F>(&self, id: SessionId, packet: impl Into<Bytes>, on_sent: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.lock_cache().cache_send(id, packet, Some(Box::new(on_sent)));
    }

    /// Post the cached packets, one task per loop.
    pub fn flush_cache_packet_list(&self) {
        let mut cache = self.lock_cache();
        match &self.pool {
            Some(pool) => {
                cache.flush(pool.dispatcher());
            }
            None => {
                if !cache.is_empty() {
                    debug!("No worker loops, dropping {} cached packets", cache.len());
                }
                *cache = CacheSendBuffer::new();
            }
        }
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, CacheSendBuffer> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Half-close after the queued packets are written.
    pub fn shutdown(&self, id: SessionId) {
        self.with_dispatcher(id, |d| d.shutdown(id));
    }

    pub fn disconnect(&self, id: SessionId) {
        self.with_dispatcher(id, |d| d.disconnect(id));
    }

    /// Close the session if it receives nothing for `check_time`;
    /// `Duration::ZERO` disables the check.
    pub fn set_ping_check_time(&self, id: SessionId, check_time: Duration) {
        let check_time = Some(check_time).filter(|d| !d.is_zero());
        self.with_dispatcher(id, |d| d.set_ping_check_time(id, check_time));
    }

    pub fn wakeup(&self, id: SessionId) {
        self.with_dispatcher(id, |d| d.wakeup(id));
    }

    pub fn wakeup_all(&self) {
        if let Some(pool) = &self.pool {
            pool.dispatcher().wakeup_all();
        }
    }

    // ------------------------------------------------------------------
    // Pool introspection (controlling thread)
    // ------------------------------------------------------------------

    pub fn random_event_loop(&self) -> Option<&LoopHandle> {
        self.pool.as_ref().map(|pool| pool.random_loop())
    }

    pub fn event_loop_by_session(&self, id: SessionId) -> Option<&LoopHandle> {
        self.pool.as_ref()?.loop_at(id.loop_index())
    }

    pub fn loop_count(&self) -> usize {
        self.pool.as_ref().map_or(0, |pool| pool.loop_count())
    }
}

impl Default for TcpService {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TcpService {
    fn drop(&mut self) {
        self.close_service();
    }
}

impl std::fmt::Debug for TcpService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpService")
            .field("config", &self.config)
            .field("loops", &self.loop_count())
            .field("listen_addr", &self.listen_addr())
            .finish()
    }
}
