// src/net/event_loop.rs - Single-threaded worker loop
//
// Core features:
// - Event-driven IO using Poller (epoll/kqueue)
// - Owns a SessionDirectory; connections never leave this thread
// - Cross-thread task queue woken through a socketpair waker
// - Session ids are re-validated (generation check) on every event and task
// - Read-idle (ping check) timeouts
// - Graceful flush before teardown

use crate::config::ServiceConfig;
use crate::error::Result;
use crate::net::connection::{Connection, ConnectionState, SessionCallbacks, Transport};
use crate::net::directory::{SessionDirectory, Slot};
use crate::net::poller::{Event, Interest, Poller};
use crate::net::session_id::SessionId;
use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Poller token of the waker; generations start at 1 so no session id is 0.
const WAKER_TOKEN: u64 = 0;
const PING_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Work posted to a loop from any thread.
pub type Task = Box<dyn FnOnce(&mut EventLoop) + Send>;

/// Hook run once per loop iteration on the loop thread.
pub type FrameCallback = Arc<dyn Fn(&mut EventLoop) + Send + Sync>;

// ============================================================================
// Waker
// ============================================================================

/// Write end of the loop's socketpair. `notified` collapses a burst of
/// wakeups into a single byte.
struct Waker {
    writer: UnixStream,
    notified: AtomicBool,
}

impl Waker {
    fn wake(&self) {
        if self.notified.swap(true, Ordering::AcqRel) {
            return;
        }
        match (&self.writer).write(&[1]) {
            Ok(_) => {}
            // Pipe already full: the loop will wake anyway
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("Failed to wake worker loop: {:?}", e),
        }
    }

    fn reset(&self) {
        self.notified.store(false, Ordering::Release);
    }
}

// ============================================================================
// Loop Handle
// ============================================================================

/// Cloneable, thread-safe handle to one worker loop.
#[derive(Clone)]
pub struct LoopHandle {
    index: u16,
    tasks: Sender<Task>,
    waker: Arc<Waker>,
    running: Arc<AtomicBool>,
    thread_id: Arc<OnceLock<ThreadId>>,
}

impl LoopHandle {
    /// Position of the loop in the worker pool (the loop index of its session ids)
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Queue `task` to run on the loop thread and wake the loop.
    ///
    /// Fails with [`Error::LoopClosed`](crate::error::Error::LoopClosed)
    /// once the loop has been torn down.
    pub fn run_in_loop<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&mut EventLoop) + Send + 'static,
    {
        self.tasks
            .send(Box::new(task))
            .map_err(|_| crate::error::Error::LoopClosed(self.index))?;
        self.waker.wake();
        Ok(())
    }

    /// Break the loop out of a blocking poll.
    pub fn wakeup(&self) {
        self.waker.wake();
    }

    /// Tasks queued but not yet run
    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the calling thread is the one running this loop
    pub fn is_in_loop_thread(&self) -> bool {
        self.thread_id.get() == Some(&thread::current().id())
    }

    /// False once the pool has been asked to stop
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn request_stop(&self) {
        self.running.store(false, Ordering::Release);
        self.waker.wake();
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("index", &self.index)
            .field("pending_tasks", &self.tasks.len())
            .finish()
    }
}

// ============================================================================
// Event Loop
// ============================================================================

pub struct EventLoop {
    index: u16,
    /// Event poller
    poller: Poller,
    waker: Arc<Waker>,
    waker_reader: UnixStream,
    tasks: Receiver<Task>,
    /// Live sessions of this loop
    sessions: SessionDirectory<Connection>,
    /// Sessions that need a flush / interest update this iteration
    dirty: HashSet<SessionId>,
    /// Sessions to remove at the end of this iteration
    pending_close: Vec<SessionId>,
    running: Arc<AtomicBool>,
    thread_id: Arc<OnceLock<ThreadId>>,
    poll_timeout: Duration,
    max_pending_write_bytes: usize,
    last_ping_check: Instant,
}

impl EventLoop {
    /// Create a loop and the handle other threads use to reach it.
    pub fn new(index: u16, config: &ServiceConfig) -> Result<(EventLoop, LoopHandle)> {
        let mut poller = Poller::new()?;

        let (waker_reader, writer) = UnixStream::pair()?;
        waker_reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        poller.register(waker_reader.as_raw_fd(), WAKER_TOKEN, Interest::READABLE)?;

        let (sender, receiver) = crossbeam_channel::unbounded();
        let waker = Arc::new(Waker {
            writer,
            notified: AtomicBool::new(false),
        });
        let running = Arc::new(AtomicBool::new(true));
        let thread_id = Arc::new(OnceLock::new());

        let handle = LoopHandle {
            index,
            tasks: sender,
            waker: waker.clone(),
            running: running.clone(),
            thread_id: thread_id.clone(),
        };

        let event_loop = EventLoop {
            index,
            poller,
            waker,
            waker_reader,
            tasks: receiver,
            sessions: SessionDirectory::with_capacity(config.effective_max_sessions()),
            dirty: HashSet::with_capacity(256),
            pending_close: Vec::with_capacity(16),
            running,
            thread_id,
            poll_timeout: config.poll_timeout(),
            max_pending_write_bytes: config.max_pending_write_bytes(),
            last_ping_check: Instant::now(),
        };

        Ok((event_loop, handle))
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, id: SessionId) -> Option<&Connection> {
        self.sessions.resolve(self.slot_of(id)?)
    }

    /// Resolve a session id owned by this loop; stale ids yield `None`.
    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut Connection> {
        let slot = self.slot_of(id)?;
        self.sessions.resolve_mut(slot)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Connection> + '_ {
        self.sessions.iter().map(|(_, conn)| conn)
    }

    /// Schedule a flush and interest update for the session at the end of
    /// this iteration.
    pub fn mark_dirty(&mut self, id: SessionId) {
        self.dirty.insert(id);
    }

    /// Close the session at the end of this iteration.
    pub fn close_session(&mut self, id: SessionId) {
        if let Some(conn) = self.session_mut(id) {
            conn.force_close();
            self.dirty.insert(id);
        }
    }

    fn slot_of(&self, id: SessionId) -> Option<Slot> {
        if id.loop_index() != self.index {
            return None;
        }
        Some(Slot {
            index: id.slot(),
            generation: id.generation(),
        })
    }

    /// Insert a connection, register it with the poller and fire the enter
    /// callback. When the directory is full the transport is dropped, which
    /// closes the socket.
    pub fn admit(
        &mut self,
        transport: Transport,
        peer_ip: String,
        callbacks: SessionCallbacks,
        max_recv_buffer_size: usize,
    ) -> Result<SessionId> {
        let index = self.index;
        let max_pending = self.max_pending_write_bytes;
        let on_enter = callbacks.on_enter.clone();
        let ip = peer_ip.clone();

        let slot = self.sessions.insert_with(|slot| {
            let id = SessionId::new(index, slot.index, slot.generation);
            Connection::new(id, transport, peer_ip, callbacks, max_recv_buffer_size, max_pending)
        })?;
        let id = SessionId::new(index, slot.index, slot.generation);

        let registered = match self.sessions.resolve(slot) {
            Some(conn) => self
                .poller
                .register(conn.raw_handle(), id.as_raw(), Interest::READABLE),
            None => Ok(()),
        };
        if let Err(e) = registered {
            if let Some(mut conn) = self.sessions.remove(slot.index) {
                conn.close();
            }
            return Err(e.into());
        }

        debug!("Session {} admitted from {}", id, ip);
        if let Some(on_enter) = on_enter {
            on_enter(id, &ip);
        }
        Ok(id)
    }

    /// Run until [`LoopHandle::request_stop`] is called.
    pub fn run(&mut self, frame_callback: Option<&FrameCallback>) {
        let _ = self.thread_id.set(thread::current().id());
        info!("Worker loop {} started", self.index);

        while self.running.load(Ordering::Acquire) {
            self.run_once(frame_callback);
        }

        info!("Worker loop {} stopped ({} sessions parked)", self.index, self.sessions.len());
    }

    /// One iteration: IO events, posted tasks, frame callback, flushes,
    /// ping checks, closes.
    pub fn run_once(&mut self, frame_callback: Option<&FrameCallback>) {
        // 1. Poll IO events
        let events = match self.poller.poll(Some(self.poll_timeout)) {
            Ok(events) => events,
            Err(e) => {
                error!("Worker loop {} poller error: {:?}", self.index, e);
                Vec::new()
            }
        };

        // 2. Process IO events
        for event in events {
            if event.token == WAKER_TOKEN {
                continue;
            }
            self.handle_event(event);
        }

        // 3. Tasks posted from other threads
        self.run_pending_tasks();

        // 4. Per-iteration hook
        if let Some(frame) = frame_callback {
            frame(self);
        }

        // 5. Flush dirty sessions and update poller interests
        self.flush_dirty();

        // 6. Read-idle timeouts
        self.check_ping_timeouts();

        // 7. Remove closed sessions
        self.close_pending();
    }

    fn handle_event(&mut self, event: Event) {
        let id = SessionId::from_raw(event.token);
        let Some(conn) = self.session_mut(id) else {
            debug!("Stale event for session {}", id);
            return;
        };

        if event.is_error() {
            debug!("Session {} socket error", id);
            conn.force_close();
        } else if event.is_readable() || event.is_hangup() {
            // Drain until WouldBlock
            conn.handle_readable();
        }
        // Writable and everything else is handled by the flush pass
        self.dirty.insert(id);
    }

    fn run_pending_tasks(&mut self) {
        // Drain the pipe and clear the flag BEFORE taking the snapshot, so a
        // post racing with this pass either runs now or writes a new byte.
        let mut buf = [0u8; 64];
        loop {
            match self.waker_reader.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        self.waker.reset();

        // Tasks posted while running wait for the next iteration
        let pending = self.tasks.len();
        for _ in 0..pending {
            match self.tasks.try_recv() {
                Ok(task) => task(self),
                Err(_) => break,
            }
        }
    }

    fn flush_dirty(&mut self) {
        if self.dirty.is_empty() {
            return;
        }
        let dirty: Vec<SessionId> = self.dirty.drain().collect();

        for id in dirty {
            let Some(slot) = self.slot_of(id) else {
                continue;
            };
            let Some(conn) = self.sessions.resolve_mut(slot) else {
                continue;
            };

            if conn.state() != ConnectionState::Active {
                self.pending_close.push(id);
                continue;
            }
            if conn.try_flush() {
                conn.force_close();
                self.pending_close.push(id);
                continue;
            }

            let desired = conn.desired_interest();
            if desired != conn.registered_interest() {
                match self.poller.modify(conn.raw_handle(), id.as_raw(), desired) {
                    Ok(()) => conn.set_registered_interest(desired),
                    Err(e) => {
                        warn!("Failed to update interest for session {}: {:?}", id, e);
                        conn.force_close();
                        self.pending_close.push(id);
                    }
                }
            }
        }
    }

    fn check_ping_timeouts(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_ping_check) < PING_CHECK_INTERVAL {
            return;
        }
        self.last_ping_check = now;

        for (slot, conn) in self.sessions.iter_mut() {
            if conn.state() == ConnectionState::Active && conn.is_idle_timed_out(now) {
                debug!("Session {} ping check timed out", conn.id());
                conn.force_close();
                self.pending_close.push(SessionId::new(self.index, slot.index, slot.generation));
            }
        }
    }

    fn close_pending(&mut self) {
        if self.pending_close.is_empty() {
            return;
        }
        let mut ids = std::mem::take(&mut self.pending_close);
        ids.sort_unstable();
        ids.dedup();

        for &id in &ids {
            self.remove_session(id);
        }

        // Keep the allocation
        ids.clear();
        self.pending_close = ids;
    }

    /// Remove the session, close its socket, then fire the disconnect callback.
    fn remove_session(&mut self, id: SessionId) {
        let Some(slot) = self.slot_of(id) else {
            return;
        };
        if self.sessions.resolve(slot).is_none() {
            return;
        }
        let Some(mut conn) = self.sessions.remove(slot.index) else {
            return;
        };

        if let Err(e) = self.poller.deregister(conn.raw_handle()) {
            debug!("Failed to deregister session {} from poller: {:?}", id, e);
        }
        conn.close();
        self.dirty.remove(&id);
        debug!("Session {} removed", id);

        if let Some(on_disconnect) = &conn.callbacks().on_disconnect {
            on_disconnect(id);
        }
    }

    /// Flush pending writes for up to `timeout`, then close every session.
    ///
    /// Used when the worker pool is torn down; runs on the calling thread
    /// after the loop thread has exited.
    pub(crate) fn graceful_shutdown(&mut self, timeout: Duration) {
        debug!("Worker loop {} starting graceful shutdown...", self.index);

        // Tasks posted before the stop still deliver their sends
        self.run_pending_tasks();

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let mut all_flushed = true;

            for (_, conn) in self.sessions.iter_mut() {
                if conn.state() == ConnectionState::Active && conn.has_pending_writes() {
                    if conn.try_flush() {
                        conn.force_close();
                    } else if conn.has_pending_writes() {
                        all_flushed = false;
                    }
                }
            }

            if all_flushed {
                break;
            }

            thread::sleep(Duration::from_millis(10));
        }

        let ids: Vec<SessionId> = self
            .sessions
            .iter()
            .map(|(slot, _)| SessionId::new(self.index, slot.index, slot.generation))
            .collect();
        for id in ids {
            self.remove_session(id);
        }

        debug!("Worker loop {} graceful shutdown complete", self.index);
    }
}
