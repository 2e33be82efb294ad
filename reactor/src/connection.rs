//! Per-connection state machine: buffers, callbacks, half-close.
//!
//! A connection is created on the base loop, pinned to one worker loop, and
//! from then on every read, write, and state change happens on that worker.
//! Cross-thread calls (`send`, `shutdown`) detect the mismatch and hop via
//! `run_in_loop`.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::addr::InetAddress;
use crate::buffer::Buffer;
use crate::callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    TcpConnectionPtr, WriteCompleteCallback,
};
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::metrics::{BYTES_RECEIVED, BYTES_SENT, CONNECTIONS_ACTIVE};
use crate::socket::{self, Socket};
use crate::timestamp::Timestamp;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => State::Connected,
            2 => State::Disconnecting,
            3 => State::Disconnected,
            _ => State::Connecting,
        }
    }
}

/// One established TCP connection, owner of its socket and channel.
pub struct TcpConnection {
    event_loop: Arc<EventLoop>,
    self_weak: std::sync::Weak<TcpConnection>,
    name: String,
    state: AtomicU8,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: InetAddress,
    peer_addr: InetAddress,
    high_water_mark: AtomicUsize,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    connection_callback: Mutex<Option<ConnectionCallback>>,
    message_callback: Mutex<Option<MessageCallback>>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_callback: Mutex<Option<HighWaterMarkCallback>>,
    close_callback: Mutex<Option<CloseCallback>>,
}

impl TcpConnection {
    pub(crate) fn new(
        event_loop: Arc<EventLoop>,
        name: String,
        socket: Socket,
        local_addr: InetAddress,
        peer_addr: InetAddress,
    ) -> TcpConnectionPtr {
        if let Err(e) = socket.set_keepalive(true) {
            tracing::warn!(name = %name, "failed to enable keepalive: {e}");
        }
        let channel = Channel::new(&event_loop, socket.fd());
        tracing::debug!(name = %name, fd = socket.fd(), "connection created");

        let conn = Arc::new_cyclic(|self_weak| TcpConnection {
            event_loop,
            self_weak: self_weak.clone(),
            name,
            state: AtomicU8::new(State::Connecting as u8),
            socket,
            channel,
            local_addr,
            peer_addr,
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            input_buffer: Mutex::new(Buffer::new()),
            output_buffer: Mutex::new(Buffer::new()),
            connection_callback: Mutex::new(None),
            message_callback: Mutex::new(None),
            write_complete_callback: Mutex::new(None),
            high_water_mark_callback: Mutex::new(None),
            close_callback: Mutex::new(None),
        });

        let weak = conn.self_weak.clone();
        conn.channel.set_read_callback(Box::new(move |receive_time| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read(receive_time);
            }
        }));
        let weak = conn.self_weak.clone();
        conn.channel.set_write_callback(Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_write();
            }
        }));
        let weak = conn.self_weak.clone();
        conn.channel.set_close_callback(Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_close();
            }
        }));
        let weak = conn.self_weak.clone();
        conn.channel.set_error_callback(Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        }));

        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_address(&self) -> &InetAddress {
        &self.local_addr
    }

    pub fn peer_address(&self) -> &InetAddress {
        &self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    /// The worker loop this connection is pinned to.
    pub fn owner_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    /// Disable Nagle's algorithm on the connection socket.
    pub fn set_tcp_nodelay(&self, on: bool) {
        if let Err(e) = self.socket.set_nodelay(on) {
            tracing::warn!(name = %self.name, "failed to set TCP_NODELAY: {e}");
        }
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_callback.lock() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_callback.lock() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_callback.lock() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        *self.high_water_mark_callback.lock() = Some(cb);
        self.high_water_mark.store(mark, Ordering::Relaxed);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_callback.lock() = Some(cb);
    }

    /// Send bytes to the peer. Never blocks: anything the socket cannot take
    /// immediately is buffered and drained as the socket becomes writable.
    /// Dropped silently unless the connection is established.
    pub fn send(&self, data: &[u8]) {
        if self.state() != State::Connected {
            tracing::debug!(name = %self.name, "send on non-connected connection dropped");
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            // The caller's buffer may not outlive the hop; copy.
            let owned = data.to_vec();
            let Some(conn) = self.self_weak.upgrade() else {
                return;
            };
            self.event_loop
                .run_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    /// Half-close: stop sending once the output buffer drains, keep
    /// receiving. Only valid in the Connected state.
    pub fn shutdown(&self) {
        if self.transition(State::Connected, State::Disconnecting) {
            let Some(conn) = self.self_weak.upgrade() else {
                return;
            };
            self.event_loop.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: State, to: State) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn self_arc(&self) -> Option<TcpConnectionPtr> {
        self.self_weak.upgrade()
    }

    /// Mark the connection established: tie the channel, start reading,
    /// notify the user. Runs on the owner worker loop.
    pub(crate) fn connect_established(&self) {
        self.event_loop.assert_in_loop_thread();
        let Some(conn) = self.self_arc() else { return };

        debug_assert_eq!(self.state(), State::Connecting);
        self.set_state(State::Connected);
        CONNECTIONS_ACTIVE.increment();

        let owner: Arc<dyn Any + Send + Sync> = conn.clone();
        self.channel.tie(&owner);
        self.channel.enable_reading();

        self.invoke_connection_callback(&conn);
    }

    /// Idempotent tear-down, the last thing run on the owner loop for this
    /// connection.
    pub(crate) fn connect_destroyed(&self) {
        self.event_loop.assert_in_loop_thread();
        if self.transition(State::Connected, State::Disconnected) {
            CONNECTIONS_ACTIVE.decrement();
            self.channel.disable_all();
            if let Some(conn) = self.self_arc() {
                self.invoke_connection_callback(&conn);
            }
        }
        self.channel.remove();
    }

    /// Drain the socket into the input buffer, then deliver. A zero-byte
    /// read means the peer closed; buffered payload is delivered first so a
    /// FIN racing with data still surfaces the data.
    fn handle_read(&self, receive_time: Timestamp) {
        let Some(conn) = self.self_arc() else { return };

        let mut saw_eof = false;
        let mut read_error = None;
        {
            let mut input = self.input_buffer.lock();
            let mut total = 0u64;
            loop {
                match input.read_fd(self.socket.fd()) {
                    Ok(0) => {
                        saw_eof = true;
                        break;
                    }
                    Ok(n) => total += n as u64,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        read_error = Some(e);
                        break;
                    }
                }
            }
            BYTES_RECEIVED.add(total);

            if total > 0 {
                let cb = self.message_callback.lock().clone();
                match cb {
                    Some(cb) => cb(&conn, &mut input, receive_time),
                    None => {
                        // Default: drain and discard so the buffer cannot
                        // grow without bound.
                        tracing::debug!(
                            name = %self.name,
                            bytes = input.readable_bytes(),
                            "no message callback, discarding"
                        );
                        input.retrieve_all();
                    }
                }
            }
        }

        if let Some(e) = read_error {
            tracing::error!(name = %self.name, "read failed: {e}");
            self.handle_error();
        }
        if saw_eof {
            self.handle_close();
        }
    }

    /// The socket became writable: push out buffered bytes. On full drain,
    /// drop write interest, queue the write-complete callback, and finish a
    /// pending shutdown.
    fn handle_write(&self) {
        if !self.channel.is_writing() {
            tracing::trace!(name = %self.name, "write interest already gone");
            return;
        }
        let mut shutdown_pending = false;
        {
            let mut output = self.output_buffer.lock();
            while output.readable_bytes() > 0 {
                match output.write_fd(self.socket.fd()) {
                    Ok(n) => {
                        output.retrieve(n);
                        BYTES_SENT.add(n as u64);
                        if output.readable_bytes() == 0 {
                            self.channel.disable_writing();
                            self.queue_write_complete();
                            if self.state() == State::Disconnecting {
                                shutdown_pending = true;
                            }
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        tracing::error!(name = %self.name, "write failed: {e}");
                        break;
                    }
                }
            }
        }
        if shutdown_pending {
            self.shutdown_in_loop();
        }
    }

    /// The write path. Tries a direct write when nothing is queued, buffers
    /// the remainder, fires the high-water callback on upward crossings, and
    /// keeps the invariant: write interest is set iff unsent bytes exist.
    fn send_in_loop(&self, data: &[u8]) {
        self.event_loop.assert_in_loop_thread();
        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault = false;

        if self.state() == State::Disconnected {
            tracing::warn!(name = %self.name, "disconnected, giving up the write");
            return;
        }

        if !self.channel.is_writing() && self.output_buffer.lock().readable_bytes() == 0 {
            match socket::write(self.socket.fd(), data) {
                Ok(n) => {
                    nwrote = n;
                    remaining = data.len() - n;
                    BYTES_SENT.add(n as u64);
                    if remaining == 0 {
                        self.queue_write_complete();
                    }
                }
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::WouldBlock {
                        tracing::error!(name = %self.name, "direct write failed: {e}");
                        if matches!(
                            e.raw_os_error(),
                            Some(libc::EPIPE) | Some(libc::ECONNRESET)
                        ) {
                            fault = true;
                        }
                    }
                }
            }
        }

        if !fault && remaining > 0 {
            let mut output = self.output_buffer.lock();
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::Relaxed);
            if old_len + remaining >= mark && old_len < mark {
                let cb = self.high_water_mark_callback.lock().clone();
                if let (Some(cb), Some(conn)) = (cb, self.self_arc()) {
                    let queued = old_len + remaining;
                    self.event_loop.queue_in_loop(move || cb(&conn, queued));
                }
            }
            output.append(&data[nwrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    /// Shut the write half down only once the in-flight drain has finished;
    /// otherwise `handle_write` triggers it after the last byte goes out.
    fn shutdown_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if !self.channel.is_writing()
            && let Err(e) = self.socket.shutdown_write()
        {
            tracing::error!(name = %self.name, "shutdown(WRITE) failed: {e}");
        }
    }

    fn handle_close(&self) {
        self.event_loop.assert_in_loop_thread();
        let state = self.state();
        tracing::debug!(name = %self.name, ?state, fd = self.channel.fd(), "closing");
        debug_assert!(state == State::Connected || state == State::Disconnecting);
        self.set_state(State::Disconnected);
        CONNECTIONS_ACTIVE.decrement();
        self.channel.disable_all();

        // Keep a strong reference across both callbacks; the close hook
        // typically drops the registry's reference.
        let Some(conn) = self.self_arc() else { return };
        self.invoke_connection_callback(&conn);
        let close_cb = self.close_callback.lock().clone();
        if let Some(cb) = close_cb {
            cb(&conn);
        }
    }

    /// Unexpected readiness error: capture SO_ERROR and log; the next event
    /// cycle typically observes the read-zero and closes.
    fn handle_error(&self) {
        let err = socket::socket_error(self.socket.fd());
        tracing::error!(name = %self.name, so_error = err, "connection error");
    }

    fn invoke_connection_callback(&self, conn: &TcpConnectionPtr) {
        let cb = self.connection_callback.lock().clone();
        match cb {
            Some(cb) => cb(conn),
            None => tracing::info!(
                name = %self.name,
                peer = %self.peer_addr,
                up = self.connected(),
                "connection state changed"
            ),
        }
    }

    fn queue_write_complete(&self) {
        let cb = self.write_complete_callback.lock().clone();
        if let (Some(cb), Some(conn)) = (cb, self.self_arc()) {
            self.event_loop.queue_in_loop(move || cb(&conn));
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        tracing::debug!(
            name = %self.name,
            fd = self.socket.fd(),
            state = self.state.load(Ordering::Relaxed),
            "connection dropped"
        );
    }
}
