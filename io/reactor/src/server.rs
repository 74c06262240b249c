//! Top-level server façade: acceptor + loop pool + connection table.

use crate::acceptor::Acceptor;
use crate::addr::InetAddr;
use crate::connection::{
    ConnectionCallback, MessageCallback, TcpConnection, TcpConnectionHandle,
    WriteCompleteCallback,
};
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::loop_pool::LoopPool;
use crate::loop_thread::ThreadInitCallback;
use crate::socket;
use crate::timestamp::Timestamp;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use tracing::{error, info};

#[derive(Default)]
struct ServerCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    thread_init: Option<ThreadInitCallback>,
}

struct ServerInner {
    base_loop: Arc<EventLoop>,
    ip_port: String,
    name: String,
    acceptor: Arc<Acceptor>,
    pool: Mutex<LoopPool>,
    /// Only incremented from the base loop; atomic for soundness, not
    /// for contention.
    next_conn_id: AtomicU64,
    /// Keyed by connection name; mutated only on the base loop.
    connections: Mutex<HashMap<String, TcpConnectionHandle>>,
    started: Once,
    callbacks: Mutex<ServerCallbacks>,
}

/// A TCP server listening on one address.
///
/// Set the thread count and callbacks before [`TcpServer::start`]; the
/// base loop's `run()` then drives accepts while worker loops drive the
/// accepted connections.
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

impl TcpServer {
    pub fn new(
        base_loop: Arc<EventLoop>,
        listen_addr: &InetAddr,
        name: impl Into<String>,
        reuse_port: bool,
    ) -> Result<Self, Error> {
        let name = name.into();
        let acceptor = Acceptor::new(&base_loop, listen_addr, reuse_port)?;
        let inner = Arc::new(ServerInner {
            base_loop: base_loop.clone(),
            ip_port: listen_addr.to_ip_port(),
            name: name.clone(),
            acceptor: acceptor.clone(),
            pool: Mutex::new(LoopPool::new(base_loop, name)),
            next_conn_id: AtomicU64::new(0),
            connections: Mutex::new(HashMap::new()),
            started: Once::new(),
            callbacks: Mutex::new(ServerCallbacks::default()),
        });

        let weak = Arc::downgrade(&inner);
        acceptor.set_new_connection_callback(Box::new(move |fd, peer_addr| {
            if let Some(inner) = weak.upgrade() {
                ServerInner::new_connection(&inner, fd, peer_addr);
            }
        }));

        Ok(TcpServer { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn ip_port(&self) -> &str {
        &self.inner.ip_port
    }

    /// Number of worker loops; must be set before [`TcpServer::start`].
    pub fn set_thread_num(&self, num_threads: usize) {
        self.inner.pool.lock().set_thread_num(num_threads);
    }

    pub fn set_connection_callback(
        &self,
        cb: impl Fn(&TcpConnectionHandle) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().connection = Some(Arc::new(cb));
    }

    pub fn set_message_callback(
        &self,
        cb: impl Fn(&TcpConnectionHandle, &mut crate::buffer::Buffer, Timestamp)
            + Send
            + Sync
            + 'static,
    ) {
        self.inner.callbacks.lock().message = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback(
        &self,
        cb: impl Fn(&TcpConnectionHandle) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().write_complete = Some(Arc::new(cb));
    }

    pub fn set_thread_init_callback(
        &self,
        cb: impl Fn(&Arc<EventLoop>) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().thread_init = Some(Arc::new(cb));
    }

    /// Start the worker pool and begin listening. Idempotent: repeat
    /// calls are no-ops.
    pub fn start(&self) {
        let inner = self.inner.clone();
        self.inner.started.call_once(move || {
            let init = inner.callbacks.lock().thread_init.clone();
            if let Err(err) = inner.pool.lock().start(init) {
                error!(server = %inner.name, %err, "failed to start loop pool");
                return;
            }
            info!(server = %inner.name, addr = %inner.ip_port, "server starting");
            let acceptor = inner.acceptor.clone();
            inner.base_loop.run_in_loop(move || acceptor.listen());
        });
    }
}

impl ServerInner {
    /// Invoked by the acceptor on the base loop for every accepted fd.
    fn new_connection(inner: &Arc<ServerInner>, fd: OwnedFd, peer_addr: InetAddr) {
        let io_loop = inner.pool.lock().next_loop();
        let id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn_name = format!("{}-{}#{}", inner.name, inner.ip_port, id);
        info!(
            server = %inner.name,
            conn = %conn_name,
            peer = %peer_addr,
            "new connection"
        );

        let local_addr = match socket::local_addr_of(fd.as_raw_fd()) {
            Ok(addr) => addr,
            Err(err) => {
                error!(conn = %conn_name, %err, "getsockname failed");
                InetAddr::any(0)
            }
        };

        let conn = TcpConnection::new(
            io_loop.clone(),
            conn_name.clone(),
            fd,
            local_addr,
            peer_addr,
        );
        inner.connections.lock().insert(conn_name, conn.clone());

        {
            let callbacks = inner.callbacks.lock();
            if let Some(cb) = &callbacks.connection {
                conn.set_connection_callback(cb.clone());
            }
            if let Some(cb) = &callbacks.message {
                conn.set_message_callback(cb.clone());
            }
            if let Some(cb) = &callbacks.write_complete {
                conn.set_write_complete_callback(cb.clone());
            }
        }

        let weak = Arc::downgrade(inner);
        conn.set_close_callback(Arc::new(move |conn: &TcpConnectionHandle| {
            if let Some(inner) = weak.upgrade() {
                ServerInner::remove_connection(&inner, conn.clone());
            }
        }));

        let conn = conn.clone();
        io_loop.run_in_loop(move || conn.connect_established());
    }

    fn remove_connection(inner: &Arc<ServerInner>, conn: TcpConnectionHandle) {
        let inner = inner.clone();
        let base_loop = inner.base_loop.clone();
        base_loop.run_in_loop(move || ServerInner::remove_connection_in_loop(&inner, conn));
    }

    fn remove_connection_in_loop(inner: &Arc<ServerInner>, conn: TcpConnectionHandle) {
        info!(server = %inner.name, conn = %conn.name(), "removing connection");
        inner.connections.lock().remove(conn.name());
        let io_loop = conn.owner_loop().clone();
        // queue_in_loop, not run_in_loop: the destroy task must be
        // observed after the current dispatch pass on the worker loop.
        io_loop.queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        info!(server = %self.inner.name, "server shutting down");
        let conns: Vec<TcpConnectionHandle> = {
            let mut connections = self.inner.connections.lock();
            connections.drain().map(|(_, conn)| conn).collect()
        };
        for conn in conns {
            let io_loop = conn.owner_loop().clone();
            io_loop.run_in_loop(move || conn.connect_destroyed());
        }
    }
}
