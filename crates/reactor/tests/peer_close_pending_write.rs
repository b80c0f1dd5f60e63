use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use reactor::{EventLoop, Server};

/// The client drops its socket while the server still has a queued write in
/// flight. The server must not panic or abort: `send_in_loop`'s fault path
/// absorbs the `EPIPE`/`ECONNRESET` and the close callback still fires.
#[test]
fn server_survives_write_after_peer_closes() {
    let mut base_loop = EventLoop::new();
    let server = Server::bind(base_loop.handle(), "127.0.0.1:0".parse().unwrap(), "close", false).unwrap();
    server.set_thread_num(1);

    let closed = Arc::new(AtomicBool::new(false));
    let closed_clone = closed.clone();

    server.set_connection_callback(Arc::new(move |conn| {
        if conn.connected() {
            // Send a burst right away; by the time it lands the client has
            // already dropped its socket, so some of these writes race the
            // peer's FIN/RST.
            for _ in 0..20 {
                conn.send(&[0u8; 65536]);
            }
        } else {
            closed_clone.store(true, Ordering::SeqCst);
        }
    }));

    server.start(None).unwrap();
    let addr = server.local_addr();

    let handle = base_loop.handle();
    let client = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        let stream = TcpStream::connect(addr).unwrap();
        // Drop immediately without reading; the server's next attempt to
        // write to this connection should hit a dead socket.
        drop(stream);
        std::thread::sleep(std::time::Duration::from_millis(200));
        handle.quit();
    });

    base_loop.run();
    client.join().unwrap();

    assert!(closed.load(Ordering::SeqCst), "connection callback should report the disconnect");
}
