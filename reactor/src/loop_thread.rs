//! Worker threads that each own one event loop, and the round-robin pool.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::callbacks::ThreadInitCallback;
use crate::event_loop::EventLoop;

enum StartState {
    Pending,
    Ready(Arc<EventLoop>),
    Failed,
}

struct Handshake {
    state: Mutex<StartState>,
    cond: Condvar,
}

/// A thread running one event loop.
///
/// Construction is synchronous: [`EventLoopThread::start_loop`] blocks until
/// the spawned thread has built its loop and published it, so the returned
/// handle is immediately safe to target from other threads.
pub struct EventLoopThread {
    name: String,
    init: Option<ThreadInitCallback>,
    handshake: Arc<Handshake>,
    event_loop: Option<Arc<EventLoop>>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn new(name: impl Into<String>, init: Option<ThreadInitCallback>) -> Self {
        Self {
            name: name.into(),
            init,
            handshake: Arc::new(Handshake {
                state: Mutex::new(StartState::Pending),
                cond: Condvar::new(),
            }),
            event_loop: None,
            thread: None,
        }
    }

    /// Spawn the worker and wait for its loop to become observable.
    pub fn start_loop(&mut self) -> io::Result<Arc<EventLoop>> {
        let handshake = self.handshake.clone();
        let init = self.init.clone();
        let name = self.name.clone();

        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let event_loop = match EventLoop::new() {
                    Ok(event_loop) => event_loop,
                    Err(e) => {
                        tracing::error!(worker = %name, "event loop setup failed: {e}");
                        *handshake.state.lock() = StartState::Failed;
                        handshake.cond.notify_one();
                        return;
                    }
                };
                if let Some(init) = init {
                    init(&event_loop);
                }
                {
                    let mut state = handshake.state.lock();
                    *state = StartState::Ready(event_loop.clone());
                    handshake.cond.notify_one();
                }
                event_loop.run();
            })
            .expect("failed to spawn loop thread");
        self.thread = Some(thread);

        let mut state = self.handshake.state.lock();
        while matches!(*state, StartState::Pending) {
            self.handshake.cond.wait(&mut state);
        }
        match &*state {
            StartState::Ready(event_loop) => {
                self.event_loop = Some(event_loop.clone());
                Ok(event_loop.clone())
            }
            _ => Err(io::Error::other("worker event loop failed to start")),
        }
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(event_loop) = self.event_loop.take() {
            event_loop.quit();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The base loop plus N worker loop threads, dispatched round-robin.
pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    name: String,
    started: bool,
    num_threads: usize,
    next: usize,
    threads: Vec<EventLoopThread>,
    loops: Vec<Arc<EventLoop>>,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: Arc<EventLoop>, name: impl Into<String>) -> Self {
        Self {
            base_loop,
            name: name.into(),
            started: false,
            num_threads: 0,
            next: 0,
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    /// Spawn the workers, running `init` on each loop before it polls.
    pub fn start(&mut self, init: Option<ThreadInitCallback>) -> io::Result<()> {
        assert!(!self.started, "pool already started");
        self.base_loop.assert_in_loop_thread();
        self.started = true;

        for i in 0..self.num_threads {
            let mut thread =
                EventLoopThread::new(format!("{}-{}", self.name, i), init.clone());
            self.loops.push(thread.start_loop()?);
            self.threads.push(thread);
        }
        if self.num_threads == 0
            && let Some(init) = init
        {
            init(&self.base_loop);
        }
        Ok(())
    }

    /// Next loop by round-robin; the base loop when no workers exist. Only
    /// called from the base loop's thread, so the cursor needs no
    /// synchronization.
    pub fn get_next_loop(&mut self) -> Arc<EventLoop> {
        self.base_loop.assert_in_loop_thread();
        if self.loops.is_empty() {
            return self.base_loop.clone();
        }
        let picked = self.loops[self.next].clone();
        self.next = (self.next + 1) % self.loops.len();
        picked
    }

    pub fn all_loops(&self) -> &[Arc<EventLoop>] {
        &self.loops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[test]
    fn start_loop_is_synchronous() {
        let mut thread = EventLoopThread::new("worker-sync", None);
        let event_loop = thread.start_loop().unwrap();
        assert!(!event_loop.is_in_loop_thread());
    }

    #[test]
    fn cross_thread_tasks_run_fifo() {
        let mut thread = EventLoopThread::new("worker-fifo", None);
        let event_loop = thread.start_loop().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let seen = seen.clone();
            event_loop.queue_in_loop(move || seen.lock().push(i));
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.lock().len() < 100 {
            assert!(Instant::now() < deadline, "tasks did not drain in time");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn wakeup_makes_posted_task_prompt() {
        let mut thread = EventLoopThread::new("worker-wake", None);
        let event_loop = thread.start_loop().unwrap();

        // Let the loop settle into its poll first.
        thread::sleep(Duration::from_millis(50));

        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        let posted = Instant::now();
        event_loop.run_in_loop(move || {
            flag.store(1, Ordering::SeqCst);
        });

        while ran.load(Ordering::SeqCst) == 0 {
            assert!(
                posted.elapsed() < Duration::from_secs(2),
                "posted task was not woken promptly"
            );
            thread::sleep(Duration::from_millis(1));
        }
        // Well under the 10 s poll timeout.
        assert!(posted.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn task_queued_during_drain_still_runs() {
        let mut thread = EventLoopThread::new("worker-requeue", None);
        let event_loop = thread.start_loop().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let outer_hits = hits.clone();
        let chained_loop = event_loop.clone();
        event_loop.queue_in_loop(move || {
            let inner_hits = outer_hits.clone();
            chained_loop.queue_in_loop(move || {
                inner_hits.fetch_add(1, Ordering::SeqCst);
            });
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "chained task never ran");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn drop_quits_and_joins() {
        let mut thread = EventLoopThread::new("worker-drop", None);
        let _ = thread.start_loop().unwrap();
        drop(thread);
    }
}
