use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::info;

use crate::acceptor::Acceptor;
use crate::connection::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
};
use crate::error::ReactorError;
use crate::event_loop::EventLoopHandle;
use crate::loop_thread::{LoopThreadPool, ThreadInitCallback};
use crate::socket;

#[derive(Default)]
struct UserCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<(HighWaterMarkCallback, usize)>,
}

/// Wires the `Acceptor` → `LoopThreadPool` → `TcpConnection` lifecycle
/// together behind one name → connection map.
pub struct Server {
    name: String,
    base_loop: EventLoopHandle,
    local_addr: SocketAddr,
    acceptor: Arc<Acceptor>,
    pool: LoopThreadPool,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    next_conn_id: AtomicU64,
    callbacks: Mutex<UserCallbacks>,
}

impl Server {
    pub fn bind(base_loop: EventLoopHandle, addr: SocketAddr, name: impl Into<String>, reuse_port: bool) -> Result<Arc<Self>, ReactorError> {
        let name = name.into();
        let acceptor = Acceptor::bind(base_loop.clone(), addr, reuse_port)?;
        let pool = LoopThreadPool::new(base_loop.clone(), name.clone());

        Ok(Arc::new(Server {
            name,
            base_loop,
            local_addr: addr,
            acceptor,
            pool,
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            callbacks: Mutex::new(UserCallbacks::default()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_thread_num(&self, n: usize) {
        self.pool.set_thread_num(n);
    }

    pub fn set_core_pins(&self, pins: Vec<usize>) {
        self.pool.set_core_pins(pins);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().unwrap().connection = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.lock().unwrap().message = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.callbacks.lock().unwrap().write_complete = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        self.callbacks.lock().unwrap().high_water_mark = Some((cb, mark));
    }

    /// Starts the worker pool and begins listening. Must be called before
    /// the base loop's `run()`.
    pub fn start(self: &Arc<Self>, thread_init_cb: Option<ThreadInitCallback>) -> Result<(), ReactorError> {
        if !self.pool.started() {
            self.pool.start(thread_init_cb);
        }

        let weak: Weak<Server> = Arc::downgrade(self);
        self.acceptor.set_new_connection_callback(move |fd, peer_addr| {
            if let Some(server) = weak.upgrade() {
                server.new_connection(fd, peer_addr);
            } else {
                socket::close(fd);
            }
        });

        self.acceptor.listen()
    }

    fn new_connection(self: &Arc<Self>, fd: RawFd, peer_addr: SocketAddr) {
        let worker_loop = self.pool.get_next_loop();
        let seq = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, self.local_addr, seq);

        let local_addr = socket::local_addr(fd).unwrap_or(self.local_addr);
        info!(name = %conn_name, %peer_addr, "accepted new connection");

        let conn = TcpConnection::new(worker_loop.clone(), conn_name.clone(), fd, local_addr, peer_addr);

        {
            let callbacks = self.callbacks.lock().unwrap();
            if let Some(cb) = callbacks.connection.clone() {
                conn.set_connection_callback(cb);
            }
            if let Some(cb) = callbacks.message.clone() {
                conn.set_message_callback(cb);
            }
            if let Some(cb) = callbacks.write_complete.clone() {
                conn.set_write_complete_callback(cb);
            }
            if let Some((cb, mark)) = callbacks.high_water_mark.clone() {
                conn.set_high_water_mark_callback(cb, mark);
            }
        }

        let weak_server: Weak<Server> = Arc::downgrade(self);
        let close_name = conn_name.clone();
        conn.set_close_callback(Arc::new(move |conn: &Arc<TcpConnection>| {
            if let Some(server) = weak_server.upgrade() {
                server.remove_connection(&close_name, conn);
            }
        }));

        self.connections.lock().unwrap().insert(conn_name, conn.clone());
        worker_loop.run_in_loop(move || conn.connect_established());
    }

    fn remove_connection(self: &Arc<Self>, name: &str, conn: &Arc<TcpConnection>) {
        self.connections.lock().unwrap().remove(name);
        let conn = conn.clone();
        let worker_loop = conn.loop_handle().clone();
        worker_loop.queue_in_loop(move || conn.connect_destroyed());
    }

    /// Tears down every live connection and stops the worker pool. The
    /// base loop is not driven here; the caller is responsible for
    /// stopping it once this returns.
    pub fn stop(self: &Arc<Self>) {
        let connections: Vec<Arc<TcpConnection>> = self.connections.lock().unwrap().values().cloned().collect();
        for conn in connections {
            let worker_loop = conn.loop_handle().clone();
            let conn = conn.clone();
            worker_loop.run_in_loop(move || conn.connect_destroyed());
        }
        self.connections.lock().unwrap().clear();
        for worker_loop in self.pool.all_loops() {
            worker_loop.quit();
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn base_loop(&self) -> &EventLoopHandle {
        &self.base_loop
    }
}
