//! Reactor-pattern TCP server: one event loop per thread, a fixed pool of
//! worker loops fed round-robin from a single acceptor, and per-connection
//! state machines that never need their own locks because each one is
//! confined to exactly one loop for its entire life.
//!
//! Start at [`Server`]: bind it to a base [`EventLoop`], install the
//! connection/message callbacks, call [`Server::start`], then drive the
//! base loop with [`EventLoop::run`].

mod acceptor;
mod buffer;
mod channel;
mod connection;
mod current_loop;
mod error;
mod event_loop;
mod loop_thread;
mod poller;
mod server;
mod socket;

pub use acceptor::Acceptor;
pub use buffer::Buffer;
pub use channel::Channel;
pub use connection::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
};
pub use error::ReactorError;
pub use event_loop::{EventLoop, EventLoopHandle, Task};
pub use loop_thread::{LoopThread, LoopThreadPool, ThreadInitCallback, THREADS_CREATED};
pub use server::Server;

pub use reactor_timing::{Duration, Timestamp};

/// Installs a `tracing_subscriber` formatter driven by `RUST_LOG`, for use
/// in this crate's own unit tests that want to see the reactor's log
/// output. `tracing-subscriber` is a dev-dependency, so this helper only
/// exists in test builds of this crate; integration tests under `tests/`
/// wire their own subscriber the same way since they compile against the
/// same dev-dependencies.
#[cfg(test)]
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).try_init();
}
