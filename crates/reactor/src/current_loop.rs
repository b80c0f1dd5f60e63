//! Per-thread bookkeeping for the "one event loop per thread" invariant.
//!
//! Each OS thread may own at most one [`crate::event_loop::EventLoop`].
//! The loop itself is not stored here (it lives on the thread's stack);
//! this module only tracks whether a claim has already been made so a
//! second construction attempt can be caught.

use std::cell::Cell;

use reactor_utils::fatal;

thread_local! {
    static HAS_LOOP: Cell<bool> = const { Cell::new(false) };
}

/// Claims this thread for a new `EventLoop`. Aborts the process if the
/// thread already owns one.
pub(crate) struct ThreadClaim {
    _private: (),
}

pub(crate) fn claim() -> ThreadClaim {
    HAS_LOOP.with(|cell| {
        if cell.get() {
            fatal!("another EventLoop already exists on thread {:?}", std::thread::current().id());
        }
        cell.set(true);
    });
    ThreadClaim { _private: () }
}

impl Drop for ThreadClaim {
    fn drop(&mut self) {
        HAS_LOOP.with(|cell| cell.set(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_released_on_drop() {
        std::thread::spawn(|| {
            {
                let _c = claim();
            }
            let _c2 = claim();
        })
        .join()
        .unwrap();
    }
}
