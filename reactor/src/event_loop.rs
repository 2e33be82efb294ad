//! One reactor: poll, dispatch, drain pending tasks, repeat.
//!
//! A loop is pinned to the thread that constructed it. Other threads hand it
//! work through [`EventLoop::run_in_loop`] / [`EventLoop::queue_in_loop`];
//! an eventfd-backed waker makes the poll return promptly whenever work
//! arrives from outside.

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

use mio::Waker;
use parking_lot::Mutex;

use crate::channel::Channel;
use crate::metrics::LOOP_WAKEUPS;
use crate::poller::{Poller, WAKER_TOKEN};

const POLL_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    // One loop per thread, enforced at construction.
    static LOOP_BOUND_TO_THREAD: Cell<bool> = const { Cell::new(false) };
}

pub struct EventLoop {
    thread_id: ThreadId,
    looping: AtomicBool,
    quit: AtomicBool,
    calling_pending_tasks: AtomicBool,
    poller: Mutex<Poller>,
    waker: Waker,
    pending_tasks: Mutex<Vec<Task>>,
}

impl EventLoop {
    /// Build a loop bound to the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if another loop was already constructed on this thread.
    pub fn new() -> std::io::Result<Arc<EventLoop>> {
        let poller = Poller::new()?;
        let waker = Waker::new(poller.registry(), WAKER_TOKEN)?;
        let thread_id = thread::current().id();

        LOOP_BOUND_TO_THREAD.with(|bound| {
            if bound.get() {
                tracing::error!(?thread_id, "another event loop exists on this thread");
                panic!("another EventLoop exists on thread {thread_id:?}");
            }
            bound.set(true);
        });
        tracing::debug!(?thread_id, "event loop created");

        Ok(Arc::new(EventLoop {
            thread_id,
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            calling_pending_tasks: AtomicBool::new(false),
            poller: Mutex::new(poller),
            waker,
            pending_tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Run the poll/dispatch/pending cycle until [`EventLoop::quit`].
    /// Must be called on the owner thread.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        assert!(
            !self.looping.load(Ordering::Acquire),
            "loop is already running"
        );
        // The quit flag is intentionally not reset here: a quit() that
        // arrives between construction and run() must still take effect.
        self.looping.store(true, Ordering::Release);
        tracing::info!(thread_id = ?self.thread_id, "event loop start");

        let mut active: Vec<Arc<Channel>> = Vec::new();
        while !self.quit.load(Ordering::Acquire) {
            active.clear();
            // The poller lock is released before dispatch so handlers can
            // re-enter update_channel.
            let receive_time = self.poller.lock().poll(POLL_TIMEOUT, &mut active);
            for channel in &active {
                channel.handle_event(receive_time);
            }
            self.do_pending_tasks();
        }

        tracing::info!(thread_id = ?self.thread_id, "event loop stop");
        self.looping.store(false, Ordering::Release);
    }

    /// Make the loop exit after the current iteration. Callable from any
    /// thread; in-flight callbacks run to completion.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Execute `task` on the loop thread: inline when the caller already is
    /// the loop thread, queued plus wakeup otherwise.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queue `task` unconditionally. Wakes the loop when the caller is
    /// off-thread, and also while the pending drain is running so a task
    /// scheduled by another task does not wait out a full poll.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.pending_tasks.lock().push(Box::new(task));

        if !self.is_in_loop_thread() || self.calling_pending_tasks.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub(crate) fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "loop owned by thread {:?} was accessed from thread {:?}",
                self.thread_id,
                thread::current().id()
            );
        }
    }

    fn wakeup(&self) {
        match self.waker.wake() {
            Ok(()) => {
                LOOP_WAKEUPS.increment();
            }
            Err(e) => tracing::error!("loop wakeup failed: {e}"),
        }
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.lock().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.lock().remove_channel(channel);
    }

    /// Swap the queue out under the lock, then run the tasks lock-free so
    /// they may queue further work without deadlocking.
    fn do_pending_tasks(&self) {
        self.calling_pending_tasks.store(true, Ordering::Release);
        let tasks = std::mem::take(&mut *self.pending_tasks.lock());
        for task in tasks {
            task();
        }
        self.calling_pending_tasks.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Free the thread slot only when dropped on the owner thread; a
        // handle dropped elsewhere must not clobber that thread's binding.
        if thread::current().id() == self.thread_id {
            LOOP_BOUND_TO_THREAD.with(|bound| bound.set(false));
        }
    }
}
