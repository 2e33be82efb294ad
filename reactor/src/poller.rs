//! Readiness demultiplexer over mio's epoll/kqueue abstraction.
//!
//! Owned by exactly one event loop and only ever touched from that loop's
//! thread. Registration state (new / added / deleted) lives on the channel
//! itself; the poller keeps the fd-to-channel map.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::channel::{
    Channel, EVENT_ERROR, EVENT_HUP, EVENT_NONE, EVENT_READ, EVENT_WRITE, PollerState,
};
use crate::timestamp::Timestamp;

/// Reserved token for the loop's cross-thread waker.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

/// The readiness event list starts here and doubles whenever a poll fills
/// it completely.
const INITIAL_EVENT_LIST_SIZE: usize = 16;

pub(crate) struct Poller {
    poll: Poll,
    events: Events,
    events_capacity: usize,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(INITIAL_EVENT_LIST_SIZE),
            events_capacity: INITIAL_EVENT_LIST_SIZE,
            channels: HashMap::new(),
        })
    }

    pub(crate) fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    /// Block up to `timeout` and collect the channels with readiness into
    /// `active`. Interrupted waits are swallowed; other errors are logged
    /// and yield an empty set.
    pub(crate) fn poll(
        &mut self,
        timeout: Duration,
        active: &mut Vec<Arc<Channel>>,
    ) -> Timestamp {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::error!("poll failed: {e}");
                return Timestamp::now();
            }
        }
        let now = Timestamp::now();

        let mut count = 0;
        for event in self.events.iter() {
            count += 1;
            if event.token() == WAKER_TOKEN {
                continue;
            }
            let fd = event.token().0 as RawFd;
            if let Some(channel) = self.channels.get(&fd) {
                channel.set_revents(map_event(event));
                active.push(channel.clone());
            }
        }
        if count == self.events_capacity {
            self.events_capacity *= 2;
            self.events = Events::with_capacity(self.events_capacity);
        }
        now
    }

    /// Idempotent registration driven by the channel's interest and state.
    pub(crate) fn update_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        let state = channel.poller_state();
        tracing::trace!(fd, interest = channel.interest(), ?state, "update channel");

        match state {
            PollerState::New | PollerState::Deleted => {
                if channel.is_none_interest() {
                    // Nothing to watch yet; the map entry (if any) stays
                    // parked until interest shows up.
                    return;
                }
                if state == PollerState::New {
                    self.channels.insert(fd, channel.clone());
                }
                channel.set_poller_state(PollerState::Added);
                self.register(fd, channel.interest());
            }
            PollerState::Added => {
                if channel.is_none_interest() {
                    self.deregister(fd);
                    channel.set_poller_state(PollerState::Deleted);
                } else {
                    self.reregister(fd, channel.interest());
                }
            }
        }
    }

    /// Erase the channel from the map, deregistering first if it is still
    /// registered with the kernel.
    pub(crate) fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        if self.channels.remove(&fd).is_none() {
            return;
        }
        if channel.poller_state() == PollerState::Added {
            self.deregister(fd);
        }
        channel.set_poller_state(PollerState::New);
    }

    fn register(&mut self, fd: RawFd, interest: u8) {
        if let Err(e) =
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), Token(fd as usize), mio_interest(interest))
        {
            tracing::error!(fd, "poller register failed: {e}");
            panic!("poller register failed for fd {fd}: {e}");
        }
    }

    fn reregister(&mut self, fd: RawFd, interest: u8) {
        if let Err(e) = self.poll.registry().reregister(
            &mut SourceFd(&fd),
            Token(fd as usize),
            mio_interest(interest),
        ) {
            tracing::error!(fd, "poller reregister failed: {e}");
            panic!("poller reregister failed for fd {fd}: {e}");
        }
    }

    fn deregister(&mut self, fd: RawFd) {
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            tracing::error!(fd, "poller deregister failed: {e}");
        }
    }
}

fn mio_interest(mask: u8) -> Interest {
    debug_assert!(mask != EVENT_NONE);
    match (mask & EVENT_READ != 0, mask & EVENT_WRITE != 0) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (false, true) => Interest::WRITABLE,
        _ => Interest::READABLE,
    }
}

fn map_event(event: &mio::event::Event) -> u8 {
    let mut revents = EVENT_NONE;
    if event.is_readable() || event.is_priority() {
        revents |= EVENT_READ;
    }
    if event.is_writable() {
        revents |= EVENT_WRITE;
    }
    if event.is_error() {
        revents |= EVENT_ERROR;
    }
    if event.is_read_closed() && event.is_write_closed() {
        revents |= EVENT_HUP;
    } else if event.is_read_closed() {
        // Peer half-close without pending payload: surface as a read so the
        // zero-byte read drives the close path.
        revents |= EVENT_READ;
    }
    revents
}
