//! Callback signatures shared across the server surface.

use std::sync::Arc;

use crate::buffer::Buffer;
use crate::connection::TcpConnection;
use crate::event_loop::EventLoop;
use crate::timestamp::Timestamp;

/// Shared-ownership handle to a connection, as passed to every callback.
pub type TcpConnectionPtr = Arc<TcpConnection>;

/// Invoked when a connection is established and again when it goes down;
/// distinguish with [`TcpConnection::connected`].
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Invoked with the input buffer and the receive timestamp whenever data
/// arrives.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Timestamp) + Send + Sync>;

/// Invoked once the output buffer has fully drained.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Invoked with the output-buffer size when it crosses the high-water mark
/// upward.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;

/// Internal hook the server installs to unregister a closed connection.
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Run on each worker loop right after it is constructed, before it starts
/// polling.
pub type ThreadInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;
