use std::any::Any;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, Weak};

use reactor_timing::Timestamp;
use tracing::{debug, trace};

use crate::event_loop::EventLoopHandle;

const NONE_EVENT: i32 = 0;
const READ_EVENT: i32 = libc::EPOLLIN | libc::EPOLLPRI;
const WRITE_EVENT: i32 = libc::EPOLLOUT;

/// Cached registration state the poller uses to decide `EPOLL_CTL_ADD` vs
/// `_MOD` vs `_DEL` without an extra syscall to probe current state.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ChannelIndex {
    New,
    Added,
    Deleted,
}

struct ChannelState {
    interest: i32,
    revents: i32,
    index: ChannelIndex,
}

type ReadCallback = Box<dyn FnMut(Timestamp) + Send>;
type EventCallback = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct Callbacks {
    read: Option<ReadCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

/// A registration record for one file descriptor: interest bits, the most
/// recently reported revents, and the callbacks to dispatch them to.
///
/// A channel belongs to exactly one [`EventLoopHandle`] for its entire
/// life; every mutation of its interest bits is expected to happen on that
/// loop's thread (enforced in debug builds via `safe_assert!` inside the
/// loop handle's own methods).
pub struct Channel {
    loop_handle: EventLoopHandle,
    fd: RawFd,
    state: Mutex<ChannelState>,
    callbacks: Mutex<Callbacks>,
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
}

impl Channel {
    pub(crate) fn new(loop_handle: EventLoopHandle, fd: RawFd) -> Arc<Self> {
        Arc::new(Channel {
            loop_handle,
            fd,
            state: Mutex::new(ChannelState { interest: NONE_EVENT, revents: NONE_EVENT, index: ChannelIndex::New }),
            callbacks: Mutex::new(Callbacks::default()),
            tie: Mutex::new(None),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub(crate) fn interest(&self) -> i32 {
        self.state.lock().unwrap().interest
    }

    #[inline]
    pub(crate) fn set_revents(&self, revents: i32) {
        self.state.lock().unwrap().revents = revents;
    }

    #[inline]
    pub(crate) fn index(&self) -> ChannelIndex {
        self.state.lock().unwrap().index
    }

    #[inline]
    pub(crate) fn set_index(&self, index: ChannelIndex) {
        self.state.lock().unwrap().index = index;
    }

    pub fn is_reading(&self) -> bool {
        self.state.lock().unwrap().interest & READ_EVENT != 0
    }

    pub fn is_writing(&self) -> bool {
        self.state.lock().unwrap().interest & WRITE_EVENT != 0
    }

    pub fn is_none_event(&self) -> bool {
        self.state.lock().unwrap().interest == NONE_EVENT
    }

    pub fn enable_reading(self: &Arc<Self>) {
        self.state.lock().unwrap().interest |= READ_EVENT;
        self.update();
    }

    pub fn disable_reading(self: &Arc<Self>) {
        self.state.lock().unwrap().interest &= !READ_EVENT;
        self.update();
    }

    pub fn enable_writing(self: &Arc<Self>) {
        self.state.lock().unwrap().interest |= WRITE_EVENT;
        self.update();
    }

    pub fn disable_writing(self: &Arc<Self>) {
        self.state.lock().unwrap().interest &= !WRITE_EVENT;
        self.update();
    }

    pub fn disable_all(self: &Arc<Self>) {
        self.state.lock().unwrap().interest = NONE_EVENT;
        self.update();
    }

    fn update(self: &Arc<Self>) {
        self.loop_handle.update_channel(self);
    }

    pub fn remove(self: &Arc<Self>) {
        self.loop_handle.remove_channel(self);
    }

    pub fn set_read_callback(&self, cb: impl FnMut(Timestamp) + Send + 'static) {
        self.callbacks.lock().unwrap().read = Some(Box::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.callbacks.lock().unwrap().write = Some(Box::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.callbacks.lock().unwrap().close = Some(Box::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.callbacks.lock().unwrap().error = Some(Box::new(cb));
    }

    /// Installs a weak back-reference to the channel's owner. Upgraded
    /// once per `handle_event` call; if the upgrade fails, all callbacks
    /// for that dispatch are skipped because the owner is gone.
    pub fn tie(&self, owner: Weak<dyn Any + Send + Sync>) {
        *self.tie.lock().unwrap() = Some(owner);
    }

    pub fn handle_event(&self, receive_time: Timestamp) {
        let tie = self.tie.lock().unwrap().clone();
        match tie {
            Some(weak) => {
                if let Some(guard) = weak.upgrade() {
                    self.handle_event_with_guard(receive_time);
                    drop(guard);
                }
            }
            None => self.handle_event_with_guard(receive_time),
        }
    }

    fn handle_event_with_guard(&self, receive_time: Timestamp) {
        let revents = self.state.lock().unwrap().revents;
        trace!(fd = self.fd, revents, "channel handling event");

        if revents & libc::EPOLLHUP != 0 && revents & libc::EPOLLIN == 0 {
            if let Some(cb) = &mut self.callbacks.lock().unwrap().close {
                cb();
            }
        }
        if revents & libc::EPOLLERR != 0 {
            if let Some(cb) = &mut self.callbacks.lock().unwrap().error {
                cb();
            }
        }
        if revents & (libc::EPOLLIN | libc::EPOLLPRI) != 0 {
            if let Some(cb) = &mut self.callbacks.lock().unwrap().read {
                cb(receive_time);
            }
        }
        if revents & libc::EPOLLOUT != 0 {
            if let Some(cb) = &mut self.callbacks.lock().unwrap().write {
                cb();
            }
        }
        debug!(fd = self.fd, "channel dispatch complete");
    }
}
