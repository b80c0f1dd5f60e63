use std::net::SocketAddr;

use thiserror::Error;

/// Recoverable construction-time failures: bad user-supplied address, a
/// socket-option call the kernel rejected. Anything past construction that
/// indicates the reactor's own state is unrecoverable goes through
/// [`reactor_utils::fatal!`] instead.
#[derive(Error, Debug)]
pub enum ReactorError {
    #[error("failed to create socket: {0}")]
    Socket(#[source] std::io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to listen: {0}")]
    Listen(#[source] std::io::Error),

    #[error("failed to set socket option {name}: {source}")]
    SetSockOpt {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}
