use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use reactor::EventLoop;

/// `run_in_loop` executes synchronously, before returning, when called from
/// the loop's own thread.
#[test]
fn run_in_loop_executes_immediately_on_loop_thread() {
    let mut event_loop = EventLoop::new();
    let handle = event_loop.handle();

    handle.queue_in_loop({
        let handle = handle.clone();
        move || {
            assert!(handle.is_in_loop_thread());
            let ran = Arc::new(AtomicBool::new(false));
            let ran_clone = ran.clone();
            handle.run_in_loop(move || {
                ran_clone.store(true, Ordering::SeqCst);
            });
            assert!(ran.load(Ordering::SeqCst), "run_in_loop must run synchronously on the owning thread");
            handle.quit();
        }
    });

    event_loop.run();
}

/// Calling `wakeup()` many times in a row before the loop drains its pipe
/// must not cause extra spurious task batches or lost tasks: the eventfd
/// coalesces writes, and `queue_in_loop` only ever wakes once per task.
#[test]
fn repeated_wakeup_does_not_duplicate_or_drop_tasks() {
    let mut event_loop = EventLoop::new();
    let handle = event_loop.handle();
    let count = Arc::new(AtomicUsize::new(0));

    let poster = {
        let handle = handle.clone();
        let count = count.clone();
        std::thread::spawn(move || {
            for _ in 0..3 {
                handle.wakeup();
            }
            for _ in 0..100 {
                let count = count.clone();
                handle.queue_in_loop(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                });
            }
            handle.quit();
        })
    };

    event_loop.run();
    poster.join().unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 100);
}

/// A freshly constructed `EventLoop` is owned by the thread that built it;
/// any other thread asking is correctly told no.
#[test]
fn is_in_loop_thread_reflects_constructing_thread() {
    let event_loop = EventLoop::new();
    let handle = event_loop.handle();
    assert!(handle.is_in_loop_thread());

    let handle_for_other = handle.clone();
    std::thread::spawn(move || {
        assert!(!handle_for_other.is_in_loop_thread());
    })
    .join()
    .unwrap();
}
