//! epoll-backed poller. Strictly level-triggered; `EPOLLET` is never set.

use super::{Poller, STATE_ADDED, STATE_DELETED, STATE_NEW};
use crate::channel::Channel;
use crate::event;
use crate::timestamp::Timestamp;
use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use tracing::{error, trace};

const INIT_EVENT_LIST_SIZE: usize = 16;

pub struct EpollPoller {
    epoll_fd: OwnedFd,
    channels: HashMap<RawFd, Arc<Channel>>,
    /// Reusable ready-event array; doubled whenever fully populated.
    events: Vec<libc::epoll_event>,
}

impl EpollPoller {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            error!(%err, "epoll_create1 failed");
            return Err(err);
        }
        Ok(EpollPoller {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            channels: HashMap::new(),
            events: vec![unsafe { mem::zeroed() }; INIT_EVENT_LIST_SIZE],
        })
    }

    fn ctl(&self, op: libc::c_int, channel: &Channel) {
        let mut ev: libc::epoll_event = unsafe { mem::zeroed() };
        ev.events = interest_to_epoll(channel.interest());
        ev.u64 = channel.fd() as u64;
        let ev_events = ev.events;
        trace!(fd = channel.fd(), events = ev_events, op, "epoll_ctl");
        if unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, channel.fd(), &mut ev) } < 0 {
            error!(
                fd = channel.fd(),
                op,
                err = %io::Error::last_os_error(),
                "epoll_ctl failed"
            );
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Timestamp {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        let saved = io::Error::last_os_error();
        let now = Timestamp::now();

        if n > 0 {
            let n = n as usize;
            trace!(ready = n, "events happened");
            for i in 0..n {
                let ev = self.events[i];
                let fd = ev.u64 as RawFd;
                if let Some(channel) = self.channels.get(&fd) {
                    channel.set_ready(epoll_to_ready(ev.events));
                    active.push(channel.clone());
                }
            }
            if n == self.events.len() {
                let doubled = self.events.len() * 2;
                self.events.resize(doubled, unsafe { mem::zeroed() });
            }
        } else if n < 0 && saved.raw_os_error() != Some(libc::EINTR) {
            error!(err = %saved, "epoll_wait failed");
        }
        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        let state = channel.state();
        trace!(
            fd = channel.fd(),
            interest = channel.interest(),
            state,
            "update channel"
        );
        if state == STATE_NEW || state == STATE_DELETED {
            if state == STATE_NEW {
                self.channels.insert(channel.fd(), channel.clone());
            }
            channel.set_state(STATE_ADDED);
            self.ctl(libc::EPOLL_CTL_ADD, channel);
        } else if channel.is_none_interest() {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
            channel.set_state(STATE_DELETED);
        } else {
            self.ctl(libc::EPOLL_CTL_MOD, channel);
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        if self.channels.remove(&channel.fd()).is_some() {
            trace!(fd = channel.fd(), "remove channel");
            if channel.state() == STATE_ADDED {
                self.ctl(libc::EPOLL_CTL_DEL, channel);
            }
            channel.set_state(STATE_NEW);
        }
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .map(|c| std::ptr::eq(c.as_ref(), channel))
            .unwrap_or(false)
    }
}

fn interest_to_epoll(interest: u32) -> u32 {
    let mut ev = 0u32;
    if interest & event::READABLE != 0 {
        ev |= (libc::EPOLLIN | libc::EPOLLPRI) as u32;
    }
    if interest & event::WRITABLE != 0 {
        ev |= libc::EPOLLOUT as u32;
    }
    ev
}

fn epoll_to_ready(events: u32) -> u32 {
    let mut ready = event::NONE;
    if events & libc::EPOLLIN as u32 != 0 {
        ready |= event::READABLE;
    }
    if events & libc::EPOLLPRI as u32 != 0 {
        ready |= event::PRIORITY;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        ready |= event::WRITABLE;
    }
    if events & libc::EPOLLHUP as u32 != 0 {
        ready |= event::HANGUP;
    }
    if events & libc::EPOLLERR as u32 != 0 {
        ready |= event::ERROR;
    }
    ready
}
