//! Per-fd record binding interest, realized events, and callbacks.
//!
//! A channel never owns its fd; the acceptor or connection that created it
//! does. It is the sole path by which interest changes reach the poller:
//! every enable/disable mutates the interest mask and forwards the channel
//! to its owning loop.

use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::event_loop::EventLoop;
use crate::timestamp::Timestamp;

/// Realized-event and interest bits.
pub(crate) const EVENT_NONE: u8 = 0;
pub(crate) const EVENT_READ: u8 = 0b0001;
pub(crate) const EVENT_WRITE: u8 = 0b0010;
pub(crate) const EVENT_ERROR: u8 = 0b0100;
pub(crate) const EVENT_HUP: u8 = 0b1000;

/// Registration state the poller keeps on each channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollerState {
    /// Never registered, or removed from the poller's map.
    New = 0,
    /// Registered with the kernel and present in the map.
    Added = 1,
    /// Present in the map but deregistered from the kernel.
    Deleted = 2,
}

impl PollerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => PollerState::Added,
            2 => PollerState::Deleted,
            _ => PollerState::New,
        }
    }
}

pub(crate) type ReadEventCallback = Box<dyn FnMut(Timestamp) + Send>;
pub(crate) type EventCallback = Box<dyn FnMut() + Send>;

pub(crate) struct Channel {
    event_loop: Weak<EventLoop>,
    self_weak: Weak<Channel>,
    fd: RawFd,
    interest: AtomicU8,
    revents: AtomicU8,
    poller_state: AtomicU8,
    /// Weak back-reference to the owning object, upgraded for the duration
    /// of each dispatch so the owner cannot be destroyed mid-callback.
    tether: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    read_callback: Mutex<Option<ReadEventCallback>>,
    write_callback: Mutex<Option<EventCallback>>,
    close_callback: Mutex<Option<EventCallback>>,
    error_callback: Mutex<Option<EventCallback>>,
}

impl Channel {
    pub(crate) fn new(event_loop: &Arc<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|self_weak| Channel {
            event_loop: Arc::downgrade(event_loop),
            self_weak: self_weak.clone(),
            fd,
            interest: AtomicU8::new(EVENT_NONE),
            revents: AtomicU8::new(EVENT_NONE),
            poller_state: AtomicU8::new(PollerState::New as u8),
            tether: Mutex::new(None),
            read_callback: Mutex::new(None),
            write_callback: Mutex::new(None),
            close_callback: Mutex::new(None),
            error_callback: Mutex::new(None),
        })
    }

    #[inline]
    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub(crate) fn interest(&self) -> u8 {
        self.interest.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_revents(&self, revents: u8) {
        self.revents.store(revents, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn is_none_interest(&self) -> bool {
        self.interest() == EVENT_NONE
    }

    #[inline]
    pub(crate) fn is_writing(&self) -> bool {
        self.interest() & EVENT_WRITE != 0
    }

    #[allow(dead_code)]
    #[inline]
    pub(crate) fn is_reading(&self) -> bool {
        self.interest() & EVENT_READ != 0
    }

    pub(crate) fn poller_state(&self) -> PollerState {
        PollerState::from_u8(self.poller_state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_poller_state(&self, state: PollerState) {
        self.poller_state.store(state as u8, Ordering::Relaxed);
    }

    pub(crate) fn set_read_callback(&self, cb: ReadEventCallback) {
        *self.read_callback.lock() = Some(cb);
    }

    pub(crate) fn set_write_callback(&self, cb: EventCallback) {
        *self.write_callback.lock() = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: EventCallback) {
        *self.close_callback.lock() = Some(cb);
    }

    pub(crate) fn set_error_callback(&self, cb: EventCallback) {
        *self.error_callback.lock() = Some(cb);
    }

    /// Tie the channel to its owning object; dispatch upgrades the weak
    /// reference and is skipped once the owner is gone.
    pub(crate) fn tie(&self, owner: &Arc<dyn Any + Send + Sync>) {
        *self.tether.lock() = Some(Arc::downgrade(owner));
    }

    pub(crate) fn enable_reading(&self) {
        self.interest.fetch_or(EVENT_READ, Ordering::Relaxed);
        self.update();
    }

    #[allow(dead_code)]
    pub(crate) fn disable_reading(&self) {
        self.interest.fetch_and(!EVENT_READ, Ordering::Relaxed);
        self.update();
    }

    pub(crate) fn enable_writing(&self) {
        self.interest.fetch_or(EVENT_WRITE, Ordering::Relaxed);
        self.update();
    }

    pub(crate) fn disable_writing(&self) {
        self.interest.fetch_and(!EVENT_WRITE, Ordering::Relaxed);
        self.update();
    }

    pub(crate) fn disable_all(&self) {
        self.interest.store(EVENT_NONE, Ordering::Relaxed);
        self.update();
    }

    fn update(&self) {
        let Some(this) = self.self_weak.upgrade() else {
            return;
        };
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.update_channel(&this);
        }
    }

    /// Unregister from the owning loop's poller.
    pub(crate) fn remove(&self) {
        let Some(this) = self.self_weak.upgrade() else {
            return;
        };
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.remove_channel(&this);
        }
    }

    /// Dispatch the realized events to the registered callbacks.
    pub(crate) fn handle_event(&self, receive_time: Timestamp) {
        let tether = self.tether.lock().clone();
        match tether {
            Some(weak) => {
                // Hold the owner alive across the whole callback fan-out.
                let Some(_guard) = weak.upgrade() else {
                    return;
                };
                self.handle_event_with_guard(receive_time);
            }
            None => self.handle_event_with_guard(receive_time),
        }
    }

    /// Order matters: a hang-up with pending payload must be delivered as a
    /// read so the close is derived from read returning zero.
    fn handle_event_with_guard(&self, receive_time: Timestamp) {
        let revents = self.revents.load(Ordering::Relaxed);
        tracing::trace!(fd = self.fd, revents, "channel dispatch");

        if revents & EVENT_HUP != 0 && revents & EVENT_READ == 0 {
            self.invoke(&self.close_callback);
        }
        if revents & EVENT_ERROR != 0 {
            self.invoke(&self.error_callback);
        }
        if revents & EVENT_READ != 0 {
            let cb = self.read_callback.lock().take();
            if let Some(mut cb) = cb {
                cb(receive_time);
                let mut slot = self.read_callback.lock();
                if slot.is_none() {
                    *slot = Some(cb);
                }
            }
        }
        if revents & EVENT_WRITE != 0 {
            self.invoke(&self.write_callback);
        }
    }

    fn invoke(&self, slot: &Mutex<Option<EventCallback>>) {
        // Take the callback out of its slot so it runs without the lock held
        // and may re-enter the channel.
        let cb = slot.lock().take();
        if let Some(mut cb) = cb {
            cb();
            let mut slot = slot.lock();
            if slot.is_none() {
                *slot = Some(cb);
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        debug_assert!(
            self.poller_state() != PollerState::Added,
            "channel for fd {} dropped while still registered",
            self.fd
        );
    }
}
