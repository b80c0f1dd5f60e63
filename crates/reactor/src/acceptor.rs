use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{error, info};

use crate::channel::Channel;
use crate::error::ReactorError;
use crate::event_loop::EventLoopHandle;
use crate::socket;

pub type NewConnectionCallback = Box<dyn FnMut(RawFd, SocketAddr) + Send>;

/// Owns the listening socket on the base loop. Hands each accepted fd plus
/// its peer address to whatever `new_connection_callback` the server
/// installs; if none is installed the fd is closed immediately so it never
/// leaks.
pub struct Acceptor {
    socket_fd: RawFd,
    channel: Arc<Channel>,
    new_connection_callback: Mutex<Option<NewConnectionCallback>>,
    listening: AtomicBool,
    /// Reserved `/dev/null` fd, closed and reopened around an `EMFILE`
    /// accept so the listening fd can be drained without spinning on
    /// `EPOLLIN` with no free descriptors to accept into.
    idle_fd: Mutex<RawFd>,
}

fn open_idle_fd() -> RawFd {
    unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) }
}

impl Acceptor {
    pub fn bind(loop_handle: EventLoopHandle, addr: SocketAddr, reuse_port: bool) -> Result<Arc<Self>, ReactorError> {
        let fd = socket::create_nonblocking()?;
        socket::set_reuse_addr(fd, true)?;
        socket::set_reuse_port(fd, reuse_port)?;
        socket::bind(fd, addr)?;

        let channel = Channel::new(loop_handle, fd);
        let acceptor = Arc::new(Acceptor {
            socket_fd: fd,
            channel,
            new_connection_callback: Mutex::new(None),
            listening: AtomicBool::new(false),
            idle_fd: Mutex::new(open_idle_fd()),
        });

        let weak: Weak<Acceptor> = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move |_ts| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });

        Ok(acceptor)
    }

    pub fn set_new_connection_callback(&self, cb: impl FnMut(RawFd, SocketAddr) + Send + 'static) {
        *self.new_connection_callback.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub fn listen(self: &Arc<Self>) -> Result<(), ReactorError> {
        socket::listen(self.socket_fd, 1024)?;
        self.listening.store(true, Ordering::Release);
        self.channel.enable_reading();
        Ok(())
    }

    fn handle_read(&self) {
        match socket::accept(self.socket_fd) {
            Ok((connfd, peer_addr)) => {
                let mut cb = self.new_connection_callback.lock().unwrap();
                match cb.as_mut() {
                    Some(cb) => cb(connfd, peer_addr),
                    None => socket::close(connfd),
                }
            }
            Err(err) => {
                error!(error = %err, "Acceptor accept failed");
                if err.raw_os_error() == Some(libc::EMFILE) {
                    self.recover_from_emfile();
                }
            }
        }
    }

    fn recover_from_emfile(&self) {
        let mut idle_fd = self.idle_fd.lock().unwrap();
        if *idle_fd >= 0 {
            socket::close(*idle_fd);
        }
        match socket::accept(self.socket_fd) {
            Ok((connfd, _peer)) => socket::close(connfd),
            Err(err) => error!(error = %err, "accept-and-drop during EMFILE recovery also failed"),
        }
        *idle_fd = open_idle_fd();
        info!("recovered from EMFILE by reserving and releasing an idle fd");
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
        let idle_fd = *self.idle_fd.lock().unwrap();
        if idle_fd >= 0 {
            socket::close(idle_fd);
        }
        socket::close(self.socket_fd);
    }
}
