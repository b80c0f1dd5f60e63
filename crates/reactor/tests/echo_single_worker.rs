use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use reactor::{Buffer, EventLoop, Server, Timestamp};

#[test]
fn echo_single_worker_roundtrips_and_reports_disconnect() {
    let mut base_loop = EventLoop::new();
    let server = Server::bind(base_loop.handle(), "127.0.0.1:0".parse().unwrap(), "echo", false).unwrap();
    server.set_thread_num(1);

    server.set_message_callback(Arc::new(|conn, buf: &mut Buffer, _ts: Timestamp| {
        let data = buf.retrieve_all_as_vec();
        conn.send(&data);
    }));

    let (disconnected_tx, disconnected_rx) = mpsc::channel();
    let disconnected_tx = Arc::new(disconnected_tx);
    server.set_connection_callback(Arc::new(move |conn| {
        if !conn.connected() {
            disconnected_tx.send(()).ok();
        }
    }));

    server.start(None).unwrap();
    let addr = server.local_addr();

    let handle = base_loop.handle();
    let stopped = Arc::new(AtomicBool::new(false));
    let stopped_clone = stopped.clone();
    let client = std::thread::spawn(move || {
        // Give the acceptor a moment to start listening.
        std::thread::sleep(std::time::Duration::from_millis(50));
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        drop(stream);
        std::thread::sleep(std::time::Duration::from_millis(100));
        stopped_clone.store(true, Ordering::SeqCst);
        handle.quit();
    });

    base_loop.run();
    client.join().unwrap();

    assert!(stopped.load(Ordering::SeqCst));
    disconnected_rx.recv_timeout(std::time::Duration::from_secs(1)).expect("connection callback should fire on disconnect");
}
