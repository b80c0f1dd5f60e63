use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use reactor::{Buffer, EventLoop, Server, Timestamp};

/// A single write of several megabytes arrives in one burst, well past a
/// single `read_fd` scatter-read. The server must reassemble it across
/// however many `handle_read` calls it takes and echo back every byte.
#[test]
fn large_single_write_is_reassembled_and_echoed() {
    let mut base_loop = EventLoop::new();
    let server = Server::bind(base_loop.handle(), "127.0.0.1:0".parse().unwrap(), "burst", false).unwrap();
    server.set_thread_num(1);

    const PAYLOAD: usize = 8 * 1024 * 1024;

    let received_total = Arc::new(AtomicUsize::new(0));
    let received_clone = received_total.clone();
    server.set_message_callback(Arc::new(move |conn, buf: &mut Buffer, _ts: Timestamp| {
        received_clone.fetch_add(buf.readable_bytes(), Ordering::SeqCst);
        let data = buf.retrieve_all_as_vec();
        conn.send(&data);
    }));

    server.start(None).unwrap();
    let addr = server.local_addr();

    let handle = base_loop.handle();
    let client = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        let mut stream = TcpStream::connect(addr).unwrap();
        let payload = vec![0x5au8; PAYLOAD];
        stream.write_all(&payload).unwrap();

        let mut echoed = Vec::with_capacity(PAYLOAD);
        let mut buf = [0u8; 65536];
        while echoed.len() < PAYLOAD {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => echoed.extend_from_slice(&buf[..n]),
                Err(e) => panic!("client read failed: {e}"),
            }
        }
        handle.quit();
        echoed
    });

    base_loop.run();
    let echoed = client.join().unwrap();

    assert_eq!(echoed.len(), PAYLOAD);
    assert!(echoed.iter().all(|&b| b == 0x5a));
    assert_eq!(received_total.load(Ordering::SeqCst), PAYLOAD);
}
