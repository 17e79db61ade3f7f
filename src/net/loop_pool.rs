// src/net/loop_pool.rs - Worker loop threads and their lifecycle
//
// start: create every loop first (poller / waker errors surface before any
//        thread exists), then spawn one named thread per loop
// stop:  signal and join; the EventLoops (and their sessions) come back from
//        the threads and stay parked
// close: stop, flush pending writes within a deadline, close every session

use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::net::dispatcher::Dispatcher;
use crate::net::event_loop::{EventLoop, FrameCallback, LoopHandle};
use crate::net::session_id::MAX_LOOPS;
use log::{error, info};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub struct LoopPool {
    dispatcher: Dispatcher,
    threads: Vec<JoinHandle<EventLoop>>,
    /// Loops returned by stopped threads
    parked: Vec<EventLoop>,
}

impl LoopPool {
    /// Start `count` worker loops.
    ///
    /// # Parameters
    /// - `count`: number of loops, `1..=65536`
    /// - `config`: per-loop limits and timings
    /// - `frame_callback`: run once per iteration on every loop thread
    pub fn start(
        count: usize,
        config: &ServiceConfig,
        frame_callback: Option<FrameCallback>,
    ) -> Result<Self> {
        if count == 0 || count > MAX_LOOPS {
            return Err(Error::InvalidLoopCount(count));
        }

        let mut loops = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let (event_loop, handle) = EventLoop::new(index as u16, config)?;
            loops.push(event_loop);
            handles.push(handle);
        }

        let mut pool = LoopPool {
            dispatcher: Dispatcher::new(handles),
            threads: Vec::with_capacity(count),
            parked: Vec::new(),
        };

        for mut event_loop in loops {
            let name = format!("ez-tcp-loop-{}", event_loop.index());
            let frame = frame_callback.clone();
            let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
                event_loop.run(frame.as_ref());
                event_loop
            });

            match spawned {
                Ok(handle) => pool.threads.push(handle),
                Err(source) => {
                    error!("Failed to spawn worker loop thread {}: {}", name, source);
                    // Dropping the pool stops the threads already running
                    return Err(Error::ThreadSpawn { name, source });
                }
            }
        }

        info!("Started {} worker loops", count);
        Ok(pool)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub(crate) fn dispatcher_mut(&mut self) -> &mut Dispatcher {
        &mut self.dispatcher
    }

    pub fn loop_count(&self) -> usize {
        self.dispatcher.loop_count()
    }

    /// Whether the loop threads are running (false once stopped)
    pub fn is_running(&self) -> bool {
        !self.threads.is_empty()
    }

    pub fn random_loop(&self) -> &LoopHandle {
        let loops = self.dispatcher.loops();
        &loops[rand::random::<usize>() % loops.len()]
    }

    pub fn loop_at(&self, index: u16) -> Option<&LoopHandle> {
        self.dispatcher.loops().get(index as usize)
    }

    /// Signal every loop to exit and join the threads. Sessions stay open
    /// until [`close`](Self::close).
    pub fn stop(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        for handle in self.dispatcher.loops() {
            handle.request_stop();
        }
        for thread in self.threads.drain(..) {
            match thread.join() {
                Ok(event_loop) => self.parked.push(event_loop),
                Err(_) => error!("Worker loop thread panicked"),
            }
        }
        info!("Stopped {} worker loops", self.dispatcher.loop_count());
    }

    /// Stop, give pending writes up to `grace` to drain, then close every
    /// session (disconnect callbacks fire on the calling thread).
    pub fn close(mut self, grace: Duration) {
        self.stop();
        let deadline = Instant::now() + grace;
        for event_loop in self.parked.iter_mut() {
            event_loop.graceful_shutdown(deadline.saturating_duration_since(Instant::now()));
        }
        self.parked.clear();
        info!("Closed {} worker loops", self.dispatcher.loop_count());
    }
}

impl Drop for LoopPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn config() -> ServiceConfig {
        ServiceConfig::new().with_poll_timeout(Duration::from_millis(10))
    }

    #[test]
    fn test_invalid_loop_count() {
        assert!(matches!(
            LoopPool::start(0, &config(), None),
            Err(Error::InvalidLoopCount(0))
        ));
        assert!(matches!(
            LoopPool::start(MAX_LOOPS + 1, &config(), None),
            Err(Error::InvalidLoopCount(_))
        ));
    }

    #[test]
    fn test_tasks_run_on_named_loop_threads() {
        let pool = LoopPool::start(2, &config(), None).expect("Failed to start pool");
        assert!(pool.is_running());
        assert_eq!(pool.loop_count(), 2);

        let (tx, rx) = crossbeam_channel::unbounded();
        for handle in pool.dispatcher().loops() {
            let tx = tx.clone();
            let check = handle.clone();
            handle
                .run_in_loop(move |el| {
                    let name = thread::current().name().map(str::to_string);
                    tx.send((el.index(), name, check.is_in_loop_thread())).unwrap();
                })
                .unwrap();
        }

        let mut results: Vec<_> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).expect("task ran"))
            .collect();
        results.sort();
        assert_eq!(
            results,
            vec![
                (0, Some("ez-tcp-loop-0".to_string()), true),
                (1, Some("ez-tcp-loop-1".to_string()), true),
            ]
        );
        pool.close(Duration::from_millis(100));
    }

    #[test]
    fn test_frame_callback_runs_on_every_loop() {
        let frames = Arc::new(AtomicUsize::new(0));
        let counter = frames.clone();
        let frame: FrameCallback = Arc::new(move |_el: &mut EventLoop| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        let pool = LoopPool::start(2, &config(), Some(frame)).unwrap();
        thread::sleep(Duration::from_millis(100));
        pool.close(Duration::ZERO);
        assert!(frames.load(Ordering::Relaxed) >= 2);
    }

    #[test]
    fn test_stop_parks_loops() {
        let mut pool = LoopPool::start(3, &config(), None).unwrap();
        pool.stop();
        assert!(!pool.is_running());
        assert_eq!(pool.parked.len(), 3);

        // Stopping twice is harmless
        pool.stop();
        assert_eq!(pool.parked.len(), 3);

        // A stopped loop still queues tasks; close runs them before teardown
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let handle = pool.random_loop().clone();
        handle
            .run_in_loop(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(handle.pending_tasks(), 1);
        assert_eq!(ran.load(Ordering::Relaxed), 0);

        pool.close(Duration::ZERO);
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_posts_fail_after_close() {
        let pool = LoopPool::start(1, &config(), None).unwrap();
        let handle = pool.loop_at(0).unwrap().clone();
        assert!(pool.loop_at(1).is_none());
        pool.close(Duration::ZERO);

        let err = handle.run_in_loop(|_| {}).unwrap_err();
        assert!(matches!(err, Error::LoopClosed(0)));
    }
}
