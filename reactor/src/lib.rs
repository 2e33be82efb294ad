//! reactor — a multi-reactor, non-blocking TCP server library.
//!
//! One base event loop owns the acceptor; N worker loops own connections.
//! Each loop is a single-threaded reactor: poll readiness, dispatch per-fd
//! callbacks, drain cross-thread tasks. A connection is pinned to one worker
//! for its whole lifetime, so its buffers and state are never contended.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use reactor::{EventLoop, InetAddress, ServerOption, TcpServer};
//!
//! fn main() -> std::io::Result<()> {
//!     let event_loop = EventLoop::new()?;
//!     let addr = InetAddress::any(8000);
//!     let mut server = TcpServer::new(&event_loop, &addr, "echo", ServerOption::NoReusePort)?;
//!     server.set_thread_num(3);
//!     server.set_message_callback(|conn, buf, _receive_time| {
//!         let msg = buf.retrieve_all_as_string();
//!         conn.send(msg.as_bytes());
//!     });
//!     server.start()?;
//!     event_loop.run();
//!     Ok(())
//! }
//! ```

pub(crate) mod acceptor;
pub mod addr;
pub mod buffer;
pub mod callbacks;
pub(crate) mod channel;
pub mod connection;
pub mod event_loop;
pub mod loop_thread;
pub mod metrics;
pub(crate) mod poller;
pub mod server;
pub(crate) mod socket;
pub mod timestamp;

/// IPv4 address value type.
pub use addr::InetAddress;
/// Byte queue handed to message callbacks.
pub use buffer::Buffer;
/// Callback signatures and the shared connection handle.
pub use callbacks::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnectionPtr,
    ThreadInitCallback, WriteCompleteCallback,
};
/// One reactor, pinned to one thread.
pub use event_loop::EventLoop;
/// Worker loop thread and round-robin pool.
pub use loop_thread::{EventLoopThread, EventLoopThreadPool};
/// The per-connection state machine.
pub use connection::TcpConnection;
/// The composed server.
pub use server::{ServerOption, TcpServer};
/// Receive-time timestamps.
pub use timestamp::Timestamp;
