use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use reactor_timing::Timestamp;
use reactor_utils::{fatal, safe_assert};
use tracing::{debug, error, info, warn};

use crate::channel::Channel;
use crate::current_loop::{self, ThreadClaim};
use crate::poller::EpollPoller;

const POLL_TIMEOUT_MS: i32 = 10_000;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    owner: ThreadId,
    poller: Mutex<EpollPoller>,
    wakeup_fd: RawFd,
    wakeup_channel: Mutex<Option<Arc<Channel>>>,
    pending: Mutex<Vec<Task>>,
    calling_pending: AtomicBool,
    looping: AtomicBool,
    quit: AtomicBool,
    poll_return_time: Mutex<Timestamp>,
}

/// A cheap, cloneable, `Send + Sync` reference to an [`EventLoop`].
///
/// This is the handle `Channel`s, `TcpConnection`s and the thread pool hold
/// to reach the owning loop across threads: the loop's poller and task
/// queue sit behind a `Mutex` purely to satisfy `Sync`, not because of real
/// contention — every access outside the owning thread only ever pushes a
/// task or writes the wakeup fd, both of which are the intended
/// cross-thread doors into an otherwise single-threaded reactor.
#[derive(Clone)]
pub struct EventLoopHandle(Arc<Inner>);

impl EventLoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        std::thread::current().id() == self.0.owner
    }

    fn assert_in_loop_thread(&self) {
        safe_assert!(self.is_in_loop_thread(), "operation requires the owning loop's thread");
    }

    pub fn poll_return_time(&self) -> Timestamp {
        *self.0.poll_return_time.lock().unwrap()
    }

    /// Runs `task` immediately if called from the loop's own thread,
    /// otherwise defers it via `queue_in_loop`.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Enqueues `task` for execution on the loop's next (or current, if
    /// mid-batch) pass over pending tasks, waking the loop if necessary so
    /// it doesn't wait out the full poll timeout.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.0.pending.lock().unwrap().push(Box::new(task));
        if !self.is_in_loop_thread() || self.0.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    pub fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe { libc::write(self.0.wakeup_fd, (&one as *const u64).cast(), 8) };
        if n != 8 {
            warn!(n, "EventLoop::wakeup wrote fewer than 8 bytes");
        }
    }

    /// Requests the loop exit after its current iteration finishes. Safe
    /// to call from any thread; wakes the loop if called off-thread.
    pub fn quit(&self) {
        self.0.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.0.poller.lock().unwrap().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.0.poller.lock().unwrap().remove_channel(channel);
    }

    pub fn has_channel(&self, fd: RawFd) -> bool {
        self.0.poller.lock().unwrap().has_channel(fd)
    }
}

/// A single-threaded reactor pinned to the thread that constructed it.
/// Drives the poller, dispatches ready channels, then drains deferred
/// tasks, forever, until `quit()` is observed.
pub struct EventLoop {
    handle: EventLoopHandle,
    active_channels: Vec<Arc<Channel>>,
    _claim: ThreadClaim,
}

fn create_wakeup_fd() -> RawFd {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        fatal!("eventfd failed: {}", std::io::Error::last_os_error());
    }
    fd
}

impl EventLoop {
    pub fn new() -> Self {
        let claim = current_loop::claim();
        let owner = std::thread::current().id();
        let wakeup_fd = create_wakeup_fd();

        let inner = Arc::new(Inner {
            owner,
            poller: Mutex::new(EpollPoller::new()),
            wakeup_fd,
            wakeup_channel: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            calling_pending: AtomicBool::new(false),
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            poll_return_time: Mutex::new(Timestamp::ZERO),
        });
        let handle = EventLoopHandle(inner);
        debug!(?owner, "EventLoop created");

        let wakeup_channel = Channel::new(handle.clone(), wakeup_fd);
        {
            let handle_for_read = handle.clone();
            wakeup_channel.set_read_callback(move |_ts| {
                let mut one: u64 = 0;
                let n = unsafe { libc::read(handle_for_read.0.wakeup_fd, (&mut one as *mut u64).cast(), 8) };
                if n != 8 {
                    warn!(n, "EventLoop wakeup read fewer than 8 bytes");
                }
            });
        }
        wakeup_channel.enable_reading();
        *handle.0.wakeup_channel.lock().unwrap() = Some(wakeup_channel);

        EventLoop { handle, active_channels: Vec::new(), _claim: claim }
    }

    pub fn handle(&self) -> EventLoopHandle {
        self.handle.clone()
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.handle.is_in_loop_thread()
    }

    pub fn quit(&self) {
        self.handle.quit();
    }

    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.handle.run_in_loop(task);
    }

    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.handle.queue_in_loop(task);
    }

    /// Drives the loop until `quit()` is observed. Blocks the calling
    /// thread for the duration.
    pub fn run(&mut self) {
        self.handle.0.looping.store(true, Ordering::Release);
        self.handle.0.quit.store(false, Ordering::Release);
        info!("EventLoop start looping");

        while !self.handle.0.quit.load(Ordering::Acquire) {
            self.active_channels.clear();
            let ts = {
                let mut poller = self.handle.0.poller.lock().unwrap();
                poller.poll(POLL_TIMEOUT_MS, &mut self.active_channels)
            };
            *self.handle.0.poll_return_time.lock().unwrap() = ts;

            for channel in &self.active_channels {
                channel.handle_event(ts);
            }
            self.do_pending_functors();
        }

        self.handle.0.looping.store(false, Ordering::Release);
        info!("EventLoop stop looping");
    }

    fn do_pending_functors(&self) {
        self.handle.0.calling_pending.store(true, Ordering::Release);
        let tasks = std::mem::take(&mut *self.handle.0.pending.lock().unwrap());
        for task in tasks {
            task();
        }
        self.handle.0.calling_pending.store(false, Ordering::Release);
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if let Some(wakeup_channel) = self.handle.0.wakeup_channel.lock().unwrap().take() {
            wakeup_channel.disable_all();
            wakeup_channel.remove();
        }
        unsafe { libc::close(self.handle.0.wakeup_fd) };
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn task_posted_from_another_thread_runs_and_wakes_loop() {
        let mut loop_ = EventLoop::new();
        let handle = loop_.handle();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();

        let poster = std::thread::spawn(move || {
            handle.queue_in_loop(move || {
                ran_clone.fetch_add(1, Ordering::SeqCst);
            });
            handle.quit();
        });

        loop_.run();
        poster.join().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tasks_run_in_fifo_order() {
        let mut loop_ = EventLoop::new();
        let handle = loop_.handle();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = order.clone();
            handle.queue_in_loop(move || order.lock().unwrap().push(i));
        }
        handle.queue_in_loop(move || handle.quit());

        loop_.run();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }
}
