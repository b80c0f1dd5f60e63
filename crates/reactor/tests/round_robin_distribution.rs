use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use reactor::{EventLoop, Server};

/// Opens nine simultaneous connections against a three-worker pool and
/// checks that the acceptor's round robin handed out exactly three per
/// worker loop, identified by the worker thread's name.
#[test]
fn nine_connections_spread_evenly_over_three_workers() {
    let mut base_loop = EventLoop::new();
    let server = Server::bind(base_loop.handle(), "127.0.0.1:0".parse().unwrap(), "rr", false).unwrap();
    server.set_thread_num(3);

    let seen_threads: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen_threads.clone();
    let total_seen = Arc::new(AtomicUsize::new(0));
    let total_clone = total_seen.clone();

    server.set_connection_callback(Arc::new(move |conn| {
        if conn.connected() {
            let name = std::thread::current().name().unwrap_or("?").to_string();
            seen_clone.lock().unwrap().push(name);
            total_clone.fetch_add(1, Ordering::SeqCst);
        }
    }));

    server.start(None).unwrap();
    let addr = server.local_addr();

    std::thread::sleep(std::time::Duration::from_millis(50));
    let mut streams = Vec::new();
    for _ in 0..9 {
        streams.push(TcpStream::connect(addr).unwrap());
    }

    let handle = base_loop.handle();
    let total_for_quit = total_seen.clone();
    std::thread::spawn(move || {
        for _ in 0..50 {
            if total_for_quit.load(Ordering::SeqCst) == 9 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        handle.quit();
    });

    base_loop.run();
    drop(streams);

    assert_eq!(total_seen.load(Ordering::SeqCst), 9);

    let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for name in seen_threads.lock().unwrap().iter() {
        *counts.entry(name.clone()).or_insert(0) += 1;
    }
    assert_eq!(counts.len(), 3, "expected exactly three distinct worker threads, got {counts:?}");
    for count in counts.values() {
        assert_eq!(*count, 3, "expected 3 connections per worker, got {counts:?}");
    }
}
