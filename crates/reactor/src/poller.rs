use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};

use reactor_timing::Timestamp;
use reactor_utils::fatal;
use tracing::{debug, error, warn};

use crate::channel::{Channel, ChannelIndex};

const INIT_EVENT_LIST_SIZE: usize = 16;

/// Readiness-notification poller over `epoll`, registered in level-triggered
/// mode (no `EPOLLET`) so buffers can be drained incrementally across
/// several poll cycles without starvation.
///
/// Unlike the C original, which stashes a raw `Channel*` in `epoll_event`'s
/// `data.ptr`, this keeps `epoll_event.u64` as the plain fd and resolves the
/// channel through `channels`. That avoids smuggling a pointer through a
/// union across an FFI boundary for no benefit Rust's ownership model needs.
pub(crate) struct EpollPoller {
    epoll_fd: RawFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Weak<Channel>>,
}

impl EpollPoller {
    pub(crate) fn new() -> Self {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            fatal!("epoll_create1 failed: {}", std::io::Error::last_os_error());
        }
        EpollPoller {
            epoll_fd,
            events: vec![unsafe { std::mem::zeroed() }; INIT_EVENT_LIST_SIZE],
            channels: HashMap::new(),
        }
    }

    pub(crate) fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Timestamp {
        debug!(tracked = self.channels.len(), "polling");
        let num_events = unsafe {
            libc::epoll_wait(self.epoll_fd, self.events.as_mut_ptr(), self.events.len() as i32, timeout_ms)
        };
        let saved_errno = std::io::Error::last_os_error();
        let now = Timestamp::now();

        if num_events > 0 {
            debug!(num_events, "events ready");
            self.fill_active_channels(num_events as usize, active);
            if num_events as usize == self.events.len() {
                self.events.resize(self.events.len() * 2, unsafe { std::mem::zeroed() });
            }
        } else if num_events == 0 {
            debug!("poll timeout");
        } else if saved_errno.raw_os_error() != Some(libc::EINTR) {
            error!(error = %saved_errno, "epoll_wait failed");
        }
        now
    }

    fn fill_active_channels(&self, num_events: usize, active: &mut Vec<Arc<Channel>>) {
        for event in &self.events[0..num_events] {
            let fd = unsafe { event.u64 } as RawFd;
            match self.channels.get(&fd).and_then(Weak::upgrade) {
                Some(channel) => {
                    channel.set_revents(event.events as i32);
                    active.push(channel);
                }
                None => warn!(fd, "event for channel no longer tracked"),
            }
        }
    }

    pub(crate) fn update_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        let index = channel.index();
        debug!(fd, interest = channel.interest(), ?index, "updating channel");

        match index {
            ChannelIndex::New | ChannelIndex::Deleted => {
                if index == ChannelIndex::New {
                    self.channels.insert(fd, Arc::downgrade(channel));
                }
                channel.set_index(ChannelIndex::Added);
                self.ctl(libc::EPOLL_CTL_ADD, channel);
            }
            ChannelIndex::Added => {
                if channel.is_none_event() {
                    self.ctl(libc::EPOLL_CTL_DEL, channel);
                    channel.set_index(ChannelIndex::Deleted);
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, channel);
                }
            }
        }
    }

    pub(crate) fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        self.channels.remove(&fd);
        debug!(fd, "removing channel");

        if channel.index() == ChannelIndex::Added {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(ChannelIndex::New);
    }

    pub(crate) fn has_channel(&self, fd: RawFd) -> bool {
        self.channels.contains_key(&fd)
    }

    fn ctl(&self, op: i32, channel: &Arc<Channel>) {
        let fd = channel.fd();
        let mut event: libc::epoll_event = unsafe { std::mem::zeroed() };
        event.events = channel.interest() as u32;
        event.u64 = fd as u64;

        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) };
        if ret < 0 {
            if op == libc::EPOLL_CTL_DEL {
                error!(fd, error = %std::io::Error::last_os_error(), "epoll_ctl del failed");
            } else {
                fatal!("epoll_ctl add/mod failed for fd {fd}: {}", std::io::Error::last_os_error());
            }
        }
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll_fd) };
    }
}
