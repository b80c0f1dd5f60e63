use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use reactor_utils::ThreadPriority;
use tracing::debug;

use crate::event_loop::{EventLoop, EventLoopHandle};

/// Total `LoopThread`s spawned process-wide, for diagnostics and tests that
/// want to assert a pool's worker count without reaching into internals.
pub static THREADS_CREATED: AtomicUsize = AtomicUsize::new(0);

pub type ThreadInitCallback = Arc<dyn Fn(&EventLoopHandle) + Send + Sync>;

struct SharedState {
    loop_handle: Option<EventLoopHandle>,
}

/// Owns a thread that runs exactly one `EventLoop` to completion. The
/// caller blocks in `start_loop` until the spawned thread has constructed
/// its loop and published a handle to it via the condition variable.
pub struct LoopThread {
    name: String,
    state: Arc<(Mutex<SharedState>, Condvar)>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
    loop_handle: Mutex<Option<EventLoopHandle>>,
}

impl LoopThread {
    pub fn new(name: impl Into<String>) -> Self {
        LoopThread {
            name: name.into(),
            state: Arc::new((Mutex::new(SharedState { loop_handle: None }), Condvar::new())),
            join_handle: Mutex::new(None),
            loop_handle: Mutex::new(None),
        }
    }

    pub fn start_loop(&self, init_cb: Option<ThreadInitCallback>, core_pin: Option<usize>) -> EventLoopHandle {
        let state = self.state.clone();
        let name = self.name.clone();
        THREADS_CREATED.fetch_add(1, Ordering::Relaxed);

        let join = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                reactor_utils::thread_boot(core_pin, ThreadPriority::OSDefault);
                let mut event_loop = EventLoop::new();
                let handle = event_loop.handle();

                if let Some(cb) = &init_cb {
                    cb(&handle);
                }

                {
                    let (lock, cond) = &*state;
                    let mut guard = lock.lock().unwrap();
                    guard.loop_handle = Some(handle);
                    cond.notify_one();
                }

                debug!(%name, "loop thread entering run loop");
                event_loop.run();

                let (lock, _cond) = &*state;
                lock.lock().unwrap().loop_handle = None;
            })
            .expect("failed to spawn loop thread");

        *self.join_handle.lock().unwrap() = Some(join);

        let (lock, cond) = &*self.state;
        let mut guard = lock.lock().unwrap();
        while guard.loop_handle.is_none() {
            guard = cond.wait(guard).unwrap();
        }
        let handle = guard.loop_handle.clone().unwrap();
        *self.loop_handle.lock().unwrap() = Some(handle.clone());
        handle
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        if let Some(handle) = self.loop_handle.lock().unwrap().take() {
            handle.quit();
        }
        if let Some(join) = self.join_handle.lock().unwrap().take() {
            let _ = join.join();
        }
    }
}

/// Round-robin distributor of new connections over `n` worker `LoopThread`s.
/// With `n == 0`, every connection runs on the base (acceptor) loop.
pub struct LoopThreadPool {
    base_loop: EventLoopHandle,
    name: String,
    num_threads: AtomicUsize,
    core_pins: Mutex<Vec<usize>>,
    threads: Mutex<Vec<Arc<LoopThread>>>,
    loops: Mutex<Vec<EventLoopHandle>>,
    next: AtomicUsize,
    started: std::sync::atomic::AtomicBool,
}

impl LoopThreadPool {
    pub fn new(base_loop: EventLoopHandle, name: impl Into<String>) -> Self {
        LoopThreadPool {
            base_loop,
            name: name.into(),
            num_threads: AtomicUsize::new(0),
            core_pins: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
            started: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Sets the worker count. Only meaningful before `start()`.
    pub fn set_thread_num(&self, n: usize) -> &Self {
        self.num_threads.store(n, Ordering::Relaxed);
        self
    }

    /// Sets the per-worker core pins. Only meaningful before `start()`.
    pub fn set_core_pins(&self, pins: Vec<usize>) -> &Self {
        *self.core_pins.lock().unwrap() = pins;
        self
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn start(&self, init_cb: Option<ThreadInitCallback>) {
        let num_threads = self.num_threads.load(Ordering::Relaxed);
        if num_threads == 0 {
            if let Some(cb) = &init_cb {
                cb(&self.base_loop);
            }
            self.started.store(true, Ordering::Release);
            return;
        }

        let mut threads = self.threads.lock().unwrap();
        let mut loops = self.loops.lock().unwrap();
        let core_pins = self.core_pins.lock().unwrap();
        for i in 0..num_threads {
            let thread = Arc::new(LoopThread::new(format!("{}-{}", self.name, i)));
            let pin = core_pins.get(i).copied();
            let handle = thread.start_loop(init_cb.clone(), pin);
            threads.push(thread);
            loops.push(handle);
        }
        self.started.store(true, Ordering::Release);
    }

    /// Picks the next worker loop in round-robin order, or the base loop
    /// when the pool has no workers of its own.
    pub fn get_next_loop(&self) -> EventLoopHandle {
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            return self.base_loop.clone();
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % loops.len();
        loops[i].clone()
    }

    pub fn all_loops(&self) -> Vec<EventLoopHandle> {
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() { vec![self.base_loop.clone()] } else { loops.clone() }
    }
}
