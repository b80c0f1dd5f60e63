use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use reactor_timing::Timestamp;
use tracing::{debug, error, info};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::EventLoopHandle;
use crate::socket;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Timestamp) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

#[derive(Default)]
struct ConnCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

/// Per-connection state machine, I/O, and buffered send/receive.
///
/// `Connecting → Connected → Disconnecting → Disconnected`, with a direct
/// `Connected → Disconnected` edge on `handle_close`. Lives for as long as
/// any handle is held — typically the server's connection map, plus
/// whatever pending tasks or `send_file` continuations were posted while
/// it was reachable.
pub struct TcpConnection {
    loop_handle: EventLoopHandle,
    name: String,
    state: Mutex<State>,
    fd: RawFd,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    callbacks: Mutex<ConnCallbacks>,
}

impl TcpConnection {
    pub fn new(loop_handle: EventLoopHandle, name: String, fd: RawFd, local_addr: SocketAddr, peer_addr: SocketAddr) -> Arc<Self> {
        socket::set_keep_alive(fd, true);
        let channel = Channel::new(loop_handle.clone(), fd);

        let conn = Arc::new(TcpConnection {
            loop_handle,
            name,
            state: Mutex::new(State::Connecting),
            fd,
            channel,
            local_addr,
            peer_addr,
            input_buffer: Mutex::new(Buffer::new()),
            output_buffer: Mutex::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            callbacks: Mutex::new(ConnCallbacks::default()),
        });

        info!(name = %conn.name, fd, "TcpConnection created");

        let weak: Weak<TcpConnection> = Arc::downgrade(&conn);
        {
            let weak = weak.clone();
            conn.channel.set_read_callback(move |ts| {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read(ts);
                }
            });
        }
        {
            let weak = weak.clone();
            conn.channel.set_write_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            });
        }
        {
            let weak = weak.clone();
            conn.channel.set_close_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            });
        }
        {
            let weak = weak.clone();
            conn.channel.set_error_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_error();
                }
            });
        }

        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        *self.state.lock().unwrap() == State::Connected
    }

    pub fn loop_handle(&self) -> &EventLoopHandle {
        &self.loop_handle
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
        let mut callbacks = self.callbacks.lock().unwrap();
        callbacks.high_water_mark = Some(cb);
        self.high_water_mark.store(mark, Ordering::Relaxed);
    }

    pub fn set_close_callback(&self, cb: CloseCallback) {
        self.callbacks.lock().unwrap().close = Some(cb);
    }

    pub fn set_no_delay(&self, on: bool) {
        socket::set_tcp_nodelay(self.fd, on);
    }

    /// Transitions `Connecting → Connected`: ties the channel to this
    /// connection's own handle, enables read-readiness, and fires the
    /// connection callback. Called once, via a task posted onto the
    /// owning worker loop right after construction.
    pub fn connect_established(self: &Arc<Self>) {
        *self.state.lock().unwrap() = State::Connected;
        self.channel.tie(Arc::downgrade(self) as Weak<dyn std::any::Any + Send + Sync>);
        self.channel.enable_reading();

        if let Some(cb) = self.callbacks.lock().unwrap().connection.clone() {
            cb(self);
        }
    }

    /// Terminal step: removes the channel from the poller and lets this be
    /// the last strong reference dropped (by the caller, after this
    /// returns).
    pub fn connect_destroyed(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if *state == State::Connected {
            *state = State::Disconnected;
            drop(state);
            self.channel.disable_all();
            if let Some(cb) = self.callbacks.lock().unwrap().connection.clone() {
                cb(self);
            }
        }
        self.channel.remove();
    }

    fn handle_read(self: &Arc<Self>, receive_time: Timestamp) {
        let (n, errno) = self.input_buffer.lock().unwrap().read_fd(self.fd);
        if n > 0 {
            if let Some(cb) = self.callbacks.lock().unwrap().message.clone() {
                let mut buf = self.input_buffer.lock().unwrap();
                cb(self, &mut buf, receive_time);
            }
        } else if n == 0 {
            self.handle_close();
        } else {
            error!(name = %self.name, errno, "TcpConnection read failed");
            self.handle_error();
        }
    }

    fn handle_write(self: &Arc<Self>) {
        if !self.channel.is_writing() {
            error!(name = %self.name, fd = self.fd, "connection is down, no more writing");
            return;
        }

        let (n, errno) = self.output_buffer.lock().unwrap().write_fd(self.fd);
        if n < 0 {
            error!(name = %self.name, errno, "TcpConnection write failed");
            return;
        }

        let mut output = self.output_buffer.lock().unwrap();
        output.retrieve(n as usize);
        if output.readable_bytes() == 0 {
            drop(output);
            self.channel.disable_writing();

            if let Some(cb) = self.callbacks.lock().unwrap().write_complete.clone() {
                let this = self.clone();
                self.loop_handle.queue_in_loop(move || cb(&this));
            }
            if *self.state.lock().unwrap() == State::Disconnecting {
                self.shutdown_in_loop();
            }
        }
    }

    fn handle_close(self: &Arc<Self>) {
        info!(name = %self.name, fd = self.fd, "TcpConnection handleClose");
        *self.state.lock().unwrap() = State::Disconnected;
        self.channel.disable_all();

        if let Some(cb) = self.callbacks.lock().unwrap().connection.clone() {
            cb(self);
        }
        if let Some(cb) = self.callbacks.lock().unwrap().close.clone() {
            cb(self);
        }
    }

    fn handle_error(&self) {
        let err = socket::so_error(self.fd);
        error!(name = %self.name, so_error = err, "TcpConnection handleError");
    }

    /// Safe to call from any thread. Trampolines onto the owning loop if
    /// necessary, holding a clone of `self` so the connection survives
    /// until the posted task runs.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if *self.state.lock().unwrap() != State::Connected {
            return;
        }
        if self.loop_handle.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let this = self.clone();
            let data = data.to_vec();
            self.loop_handle.run_in_loop(move || this.send_in_loop(&data));
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        if *self.state.lock().unwrap() == State::Disconnected {
            error!(name = %self.name, "disconnected, give up writing");
            return;
        }

        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault_error = false;

        if !self.channel.is_writing() && self.output_buffer.lock().unwrap().readable_bytes() == 0 {
            let n = unsafe { libc::write(self.fd, data.as_ptr().cast(), data.len()) };
            if n >= 0 {
                nwrote = n as usize;
                remaining = data.len() - nwrote;
                if remaining == 0 {
                    if let Some(cb) = self.callbacks.lock().unwrap().write_complete.clone() {
                        let this = self.clone();
                        self.loop_handle.queue_in_loop(move || cb(&this));
                    }
                }
            } else {
                let errno = std::io::Error::last_os_error();
                if errno.raw_os_error() != Some(libc::EWOULDBLOCK) && errno.raw_os_error() != Some(libc::EAGAIN) {
                    error!(name = %self.name, error = %errno, "TcpConnection::sendInLoop failed");
                    if matches!(errno.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET)) {
                        fault_error = true;
                    }
                }
            }
        }

        if !fault_error && remaining > 0 {
            let old_len = self.output_buffer.lock().unwrap().readable_bytes();
            let hwm = self.high_water_mark.load(Ordering::Relaxed);
            if old_len < hwm && old_len + remaining >= hwm {
                if let Some(cb) = self.callbacks.lock().unwrap().high_water_mark.clone() {
                    let this = self.clone();
                    let total = old_len + remaining;
                    self.loop_handle.queue_in_loop(move || cb(&this, total));
                }
            }
            self.output_buffer.lock().unwrap().append(&data[nwrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    /// Half-closes the write side. Safe from any thread.
    pub fn shutdown(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if *state == State::Connected {
            *state = State::Disconnecting;
            drop(state);
            let this = self.clone();
            self.loop_handle.run_in_loop(move || this.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        if !self.channel.is_writing() {
            socket::shutdown_write(self.fd);
        }
    }

    /// Zero-copy send via `sendfile(2)`. Does not touch the output buffer
    /// and never triggers the high-water callback.
    pub fn send_file(self: &Arc<Self>, file_fd: RawFd, offset: libc::off_t, count: usize) {
        if *self.state.lock().unwrap() != State::Connected {
            error!(name = %self.name, "TcpConnection::sendFile - not connected");
            return;
        }
        if self.loop_handle.is_in_loop_thread() {
            self.send_file_in_loop(file_fd, offset, count);
        } else {
            let this = self.clone();
            self.loop_handle.run_in_loop(move || this.send_file_in_loop(file_fd, offset, count));
        }
    }

    fn send_file_in_loop(self: &Arc<Self>, file_fd: RawFd, offset: libc::off_t, count: usize) {
        if *self.state.lock().unwrap() == State::Disconnecting {
            error!(name = %self.name, "disconnected, give up writing");
            return;
        }

        let mut remaining = count;
        let mut fault_error = false;
        let mut off = offset;

        if !self.channel.is_writing() && self.output_buffer.lock().unwrap().readable_bytes() == 0 {
            let sent = unsafe { libc::sendfile(self.fd, file_fd, &mut off, remaining) };
            if sent >= 0 {
                remaining -= sent as usize;
                if remaining == 0 {
                    if let Some(cb) = self.callbacks.lock().unwrap().write_complete.clone() {
                        let this = self.clone();
                        self.loop_handle.queue_in_loop(move || cb(&this));
                    }
                }
            } else {
                let errno = std::io::Error::last_os_error();
                if errno.raw_os_error() != Some(libc::EWOULDBLOCK) {
                    error!(name = %self.name, error = %errno, "TcpConnection::sendFileInLoop failed");
                }
                if matches!(errno.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET)) {
                    fault_error = true;
                }
            }
        }

        if !fault_error && remaining > 0 {
            let this = self.clone();
            self.loop_handle.queue_in_loop(move || this.send_file_in_loop(file_fd, off, remaining));
        }
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("peer_addr", &self.peer_addr)
            .field("state", &*self.state.lock().unwrap())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_water_mark_defaults_to_64mb() {
        let hwm = AtomicUsize::new(DEFAULT_HIGH_WATER_MARK);
        assert_eq!(hwm.load(Ordering::Relaxed), 64 * 1024 * 1024);
    }
}
