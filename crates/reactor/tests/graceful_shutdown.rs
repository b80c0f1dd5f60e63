use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use reactor::{EventLoop, Server};

/// `Server::stop` tears down every live connection (firing the disconnect
/// side of the connection callback for each) and quits every worker loop,
/// leaving the base loop for the caller to stop on its own terms.
#[test]
fn stop_disconnects_all_live_connections_and_quits_workers() {
    let mut base_loop = EventLoop::new();
    let server = Server::bind(base_loop.handle(), "127.0.0.1:0".parse().unwrap(), "shutdown", false).unwrap();
    server.set_thread_num(2);

    let connected = Arc::new(AtomicUsize::new(0));
    let disconnected = Arc::new(AtomicUsize::new(0));
    let connected_clone = connected.clone();
    let disconnected_clone = disconnected.clone();

    server.set_connection_callback(Arc::new(move |conn| {
        if conn.connected() {
            connected_clone.fetch_add(1, Ordering::SeqCst);
        } else {
            disconnected_clone.fetch_add(1, Ordering::SeqCst);
        }
    }));

    server.start(None).unwrap();
    let addr = server.local_addr();

    std::thread::sleep(std::time::Duration::from_millis(50));
    let streams: Vec<TcpStream> = (0..4).map(|_| TcpStream::connect(addr).unwrap()).collect();
    std::thread::sleep(std::time::Duration::from_millis(100));
    assert_eq!(connected.load(Ordering::SeqCst), 4);

    let handle = base_loop.handle();
    let server_for_stop = server.clone();
    std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        server_for_stop.stop();
        std::thread::sleep(std::time::Duration::from_millis(100));
        handle.quit();
    });

    base_loop.run();
    drop(streams);

    assert_eq!(disconnected.load(Ordering::SeqCst), 4, "every connection should report a disconnect after stop()");
}
