//! Listening socket plus its channel, living on the base loop.

use std::io;
use std::sync::Arc;

use crate::addr::InetAddress;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::metrics::CONNECTIONS_ACCEPTED;
use crate::socket::Socket;

const LISTEN_BACKLOG: i32 = 1024;

pub(crate) type NewConnectionCallback = Box<dyn FnMut(Socket, InetAddress) + Send>;

pub(crate) struct Acceptor {
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: InetAddress,
    listening: bool,
    new_connection_callback: Option<NewConnectionCallback>,
}

impl Acceptor {
    /// Create, configure, and bind the listening socket. Listening itself is
    /// deferred to [`Acceptor::listen`].
    pub(crate) fn new(
        event_loop: &Arc<EventLoop>,
        listen_addr: &InetAddress,
        reuse_port: bool,
    ) -> io::Result<Self> {
        let socket = Socket::new_nonblocking()?;
        socket.set_reuse_addr(true)?;
        socket.set_reuse_port(reuse_port)?;
        socket.bind(listen_addr)?;
        let local_addr = socket.local_addr()?;
        let channel = Channel::new(event_loop, socket.fd());

        Ok(Self {
            socket,
            channel,
            local_addr,
            listening: false,
            new_connection_callback: None,
        })
    }

    /// The bound address, with the kernel-chosen port for port-0 binds.
    pub(crate) fn local_addr(&self) -> InetAddress {
        self.local_addr
    }

    pub(crate) fn set_new_connection_callback(&mut self, cb: NewConnectionCallback) {
        self.new_connection_callback = Some(cb);
    }

    /// The acceptor's channel; the server wires its read callback back into
    /// [`Acceptor::handle_read`].
    pub(crate) fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    #[allow(dead_code)]
    pub(crate) fn listening(&self) -> bool {
        self.listening
    }

    /// Start listening and watch the fd for readability. Runs on the base
    /// loop.
    pub(crate) fn listen(&mut self) -> io::Result<()> {
        self.listening = true;
        self.socket.listen(LISTEN_BACKLOG)?;
        self.channel.enable_reading();
        tracing::info!(addr = %self.local_addr, "listening");
        Ok(())
    }

    /// Drain the accept queue. Runs for every readiness edge on the listen
    /// fd.
    pub(crate) fn handle_read(&mut self) {
        loop {
            match self.socket.accept() {
                Ok((conn, peer)) => {
                    CONNECTIONS_ACCEPTED.increment();
                    match &mut self.new_connection_callback {
                        Some(cb) => cb(conn, peer),
                        // No sink registered: the accepted socket drops and
                        // closes here.
                        None => tracing::warn!(%peer, "no connection sink, closing"),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    // EMFILE and friends: log and wait for the next edge
                    // rather than spinning.
                    if e.raw_os_error() == Some(libc::EMFILE) {
                        tracing::error!("accept failed, fd limit reached: {e}");
                    } else {
                        tracing::error!("accept failed: {e}");
                    }
                    break;
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
    }
}
