//! Acceptor + worker pool + connection registry.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::acceptor::Acceptor;
use crate::addr::InetAddress;
use crate::buffer::Buffer;
use crate::callbacks::{
    ConnectionCallback, MessageCallback, TcpConnectionPtr, ThreadInitCallback,
    WriteCompleteCallback,
};
use crate::connection::TcpConnection;
use crate::event_loop::EventLoop;
use crate::loop_thread::EventLoopThreadPool;
use crate::socket::Socket;
use crate::timestamp::Timestamp;

/// Whether the listening socket sets SO_REUSEPORT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerOption {
    NoReusePort,
    ReusePort,
}

/// A multi-reactor TCP server.
///
/// Owns the acceptor on the base loop and a pool of worker loops; every
/// accepted connection is pinned round-robin to one worker for its lifetime.
/// Construct it, register callbacks, call [`TcpServer::start`], then run the
/// base loop.
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    event_loop: Arc<EventLoop>,
    name: String,
    ip_port: String,
    local_addr: InetAddress,
    acceptor: Mutex<Acceptor>,
    pool: Mutex<EventLoopThreadPool>,
    connection_callback: Mutex<Option<ConnectionCallback>>,
    message_callback: Mutex<Option<MessageCallback>>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    thread_init_callback: Mutex<Option<ThreadInitCallback>>,
    started: AtomicU32,
    next_conn_id: AtomicU64,
    connections: Mutex<HashMap<String, TcpConnectionPtr>>,
}

impl TcpServer {
    /// Bind `listen_addr` on the given base loop. Must be called on the
    /// thread that constructed the loop.
    pub fn new(
        event_loop: &Arc<EventLoop>,
        listen_addr: &InetAddress,
        name: impl Into<String>,
        option: ServerOption,
    ) -> io::Result<TcpServer> {
        let name = name.into();
        let acceptor = Acceptor::new(event_loop, listen_addr, option == ServerOption::ReusePort)?;
        let local_addr = acceptor.local_addr();

        let inner = Arc::new(ServerInner {
            event_loop: event_loop.clone(),
            ip_port: local_addr.to_ip_port(),
            local_addr,
            acceptor: Mutex::new(acceptor),
            pool: Mutex::new(EventLoopThreadPool::new(event_loop.clone(), name.clone())),
            name,
            connection_callback: Mutex::new(None),
            message_callback: Mutex::new(None),
            write_complete_callback: Mutex::new(None),
            thread_init_callback: Mutex::new(None),
            started: AtomicU32::new(0),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
        });

        // Accepted sockets flow into new_connection on the base loop.
        let weak = Arc::downgrade(&inner);
        inner
            .acceptor
            .lock()
            .set_new_connection_callback(Box::new(move |socket, peer| {
                if let Some(inner) = weak.upgrade() {
                    ServerInner::new_connection(&inner, socket, peer);
                }
            }));

        let weak = Arc::downgrade(&inner);
        inner
            .acceptor
            .lock()
            .channel()
            .set_read_callback(Box::new(move |_receive_time: Timestamp| {
                if let Some(inner) = weak.upgrade() {
                    inner.acceptor.lock().handle_read();
                }
            }));

        Ok(TcpServer { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The bound listen address; reports the kernel-chosen port for port-0
    /// binds.
    pub fn listen_address(&self) -> InetAddress {
        self.inner.local_addr
    }

    /// Number of worker loops. Zero keeps every connection on the base loop.
    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.inner.pool.lock().set_thread_num(num_threads);
    }

    pub fn set_connection_callback(
        &mut self,
        cb: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    ) {
        *self.inner.connection_callback.lock() = Some(Arc::new(cb));
    }

    pub fn set_message_callback(
        &mut self,
        cb: impl Fn(&TcpConnectionPtr, &mut Buffer, Timestamp) + Send + Sync + 'static,
    ) {
        *self.inner.message_callback.lock() = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback(
        &mut self,
        cb: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    ) {
        *self.inner.write_complete_callback.lock() = Some(Arc::new(cb));
    }

    /// Hook run on each worker loop before it starts polling.
    pub fn set_thread_init_callback(
        &mut self,
        cb: impl Fn(&Arc<EventLoop>) + Send + Sync + 'static,
    ) {
        *self.inner.thread_init_callback.lock() = Some(Arc::new(cb));
    }

    /// Spawn the worker pool and start listening. Idempotent.
    pub fn start(&mut self) -> io::Result<()> {
        if self.inner.started.fetch_add(1, Ordering::AcqRel) == 0 {
            let init = self.inner.thread_init_callback.lock().clone();
            self.inner.pool.lock().start(init)?;

            let inner = self.inner.clone();
            self.inner.event_loop.run_in_loop(move || {
                if let Err(e) = inner.acceptor.lock().listen() {
                    tracing::error!(addr = %inner.ip_port, "listen failed: {e}");
                    panic!("listen on {} failed: {e}", inner.ip_port);
                }
            });
        }
        Ok(())
    }
}

impl ServerInner {
    /// Runs on the base loop for every accepted socket: pick a worker,
    /// register the connection, and hand it off.
    fn new_connection(inner: &Arc<ServerInner>, socket: Socket, peer_addr: InetAddress) {
        inner.event_loop.assert_in_loop_thread();
        let io_loop = inner.pool.lock().get_next_loop();

        let conn_id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", inner.name, inner.ip_port, conn_id);
        tracing::info!(
            server = %inner.name,
            conn = %conn_name,
            peer = %peer_addr,
            "new connection"
        );

        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!("getsockname failed: {e}");
                inner.local_addr
            }
        };

        let conn = TcpConnection::new(
            io_loop.clone(),
            conn_name.clone(),
            socket,
            local_addr,
            peer_addr,
        );

        if let Some(cb) = inner.connection_callback.lock().clone() {
            conn.set_connection_callback(cb);
        }
        if let Some(cb) = inner.message_callback.lock().clone() {
            conn.set_message_callback(cb);
        }
        if let Some(cb) = inner.write_complete_callback.lock().clone() {
            conn.set_write_complete_callback(cb);
        }
        let weak = Arc::downgrade(inner);
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(inner) = weak.upgrade() {
                ServerInner::remove_connection(&inner, conn.clone());
            }
        }));

        inner.connections.lock().insert(conn_name, conn.clone());
        io_loop.run_in_loop(move || conn.connect_established());
    }

    /// May be invoked from any loop (the close hook fires on the worker);
    /// hops to the base loop where the registry lives.
    fn remove_connection(inner: &Arc<ServerInner>, conn: TcpConnectionPtr) {
        let base = inner.clone();
        inner.event_loop.run_in_loop(move || {
            ServerInner::remove_connection_in_loop(&base, conn);
        });
    }

    fn remove_connection_in_loop(inner: &Arc<ServerInner>, conn: TcpConnectionPtr) {
        tracing::info!(server = %inner.name, conn = conn.name(), "removing connection");
        inner.connections.lock().remove(conn.name());
        // The captured strong reference keeps the connection alive until the
        // worker has finished the tear-down.
        let io_loop = conn.owner_loop().clone();
        io_loop.queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for TcpServer {
    /// Tear down every remaining connection on its owner loop. Like
    /// construction, this must happen on the base loop's thread.
    fn drop(&mut self) {
        let connections: Vec<_> = self
            .inner
            .connections
            .lock()
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in connections {
            let task_conn = conn.clone();
            conn.owner_loop().run_in_loop(move || task_conn.connect_destroyed());
        }
    }
}
