//! Per-descriptor event dispatch.
//!
//! A `Channel` couples one file descriptor's readiness to user-level
//! callbacks. It is owned by exactly one [`EventLoop`] and, apart from
//! construction, is only touched from that loop's thread; its
//! registration state is mutated only by the poller.

use crate::event;
use crate::event_loop::EventLoop;
use crate::poller;
use crate::timestamp::Timestamp;
use parking_lot::Mutex;
use std::any::Any;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

pub type ReadCallback = Box<dyn FnMut(Timestamp) + Send>;
pub type EventCallback = Box<dyn FnMut() + Send>;

/// The callback record for one channel. Missing entries make the
/// corresponding readiness a no-op.
#[derive(Default)]
pub struct EventHandlers {
    pub read: Option<ReadCallback>,
    pub write: Option<EventCallback>,
    pub close: Option<EventCallback>,
    pub error: Option<EventCallback>,
}

pub struct Channel {
    owner: Weak<EventLoop>,
    fd: RawFd,
    interest: AtomicU32,
    ready: AtomicU32,
    /// Poller registration slot: one of `poller::{STATE_NEW, STATE_ADDED,
    /// STATE_DELETED}`.
    state: AtomicI32,
    /// Lifetime guard; upgraded for the duration of each dispatch.
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    handlers: Mutex<EventHandlers>,
}

impl Channel {
    pub fn new(owner: Weak<EventLoop>, fd: RawFd) -> Arc<Self> {
        Arc::new(Channel {
            owner,
            fd,
            interest: AtomicU32::new(event::NONE),
            ready: AtomicU32::new(event::NONE),
            state: AtomicI32::new(poller::STATE_NEW),
            tie: Mutex::new(None),
            handlers: Mutex::new(EventHandlers::default()),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> u32 {
        self.interest.load(Ordering::Acquire)
    }

    pub fn is_none_interest(&self) -> bool {
        self.interest() == event::NONE
    }

    pub fn is_reading(&self) -> bool {
        self.interest() & event::READABLE != 0
    }

    pub fn is_writing(&self) -> bool {
        self.interest() & event::WRITABLE != 0
    }

    pub fn set_handlers(&self, handlers: EventHandlers) {
        *self.handlers.lock() = handlers;
    }

    /// Install the lifetime guard. After this, events are dropped once
    /// the guarded object has been destroyed.
    pub fn tie(&self, obj: Arc<dyn Any + Send + Sync>) {
        *self.tie.lock() = Some(Arc::downgrade(&obj));
    }

    pub(crate) fn set_ready(&self, mask: u32) {
        self.ready.store(mask, Ordering::Release);
    }

    pub(crate) fn state(&self) -> i32 {
        self.state.load(Ordering::Acquire)
    }

    pub(crate) fn set_state(&self, state: i32) {
        self.state.store(state, Ordering::Release);
    }

    pub fn enable_reading(self: &Arc<Self>) {
        self.interest.fetch_or(event::READABLE, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_reading(self: &Arc<Self>) {
        self.interest.fetch_and(!event::READABLE, Ordering::AcqRel);
        self.update();
    }

    pub fn enable_writing(self: &Arc<Self>) {
        self.interest.fetch_or(event::WRITABLE, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_writing(self: &Arc<Self>) {
        self.interest.fetch_and(!event::WRITABLE, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_all(self: &Arc<Self>) {
        self.interest.store(event::NONE, Ordering::Release);
        self.update();
    }

    /// Unregister from the owner loop's poller.
    pub fn remove(self: &Arc<Self>) {
        if let Some(owner) = self.owner.upgrade() {
            owner.remove_channel(self);
        }
    }

    fn update(self: &Arc<Self>) {
        if let Some(owner) = self.owner.upgrade() {
            owner.update_channel(self);
        }
    }

    /// Dispatch the readiness recorded by the poller. If a lifetime
    /// guard is installed and cannot be upgraded, the event is dropped.
    pub fn handle_event(&self, at: Timestamp) {
        let tie = self.tie.lock().clone();
        match tie {
            Some(weak) => {
                if let Some(_guard) = weak.upgrade() {
                    self.dispatch(at);
                }
            }
            None => self.dispatch(at),
        }
    }

    fn dispatch(&self, at: Timestamp) {
        let ready = self.ready.load(Ordering::Acquire);
        let mut handlers = self.handlers.lock();
        // Hang-up with nothing left to read means the peer is gone.
        if ready & event::HANGUP != 0 && ready & event::READABLE == 0 {
            if let Some(cb) = handlers.close.as_mut() {
                cb();
            }
        }
        if ready & event::ERROR != 0 {
            if let Some(cb) = handlers.error.as_mut() {
                cb();
            }
        }
        if ready & (event::READABLE | event::PRIORITY) != 0 {
            if let Some(cb) = handlers.read.as_mut() {
                cb(at);
            }
        }
        if ready & event::WRITABLE != 0 {
            if let Some(cb) = handlers.write.as_mut() {
                cb();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn orphan_channel(fd: RawFd) -> Arc<Channel> {
        Channel::new(Weak::new(), fd)
    }

    #[test]
    fn interest_mutators() {
        let ch = orphan_channel(0);
        assert!(ch.is_none_interest());
        ch.enable_reading();
        assert!(ch.is_reading());
        ch.enable_writing();
        assert!(ch.is_writing());
        ch.disable_writing();
        assert!(!ch.is_writing());
        assert!(ch.is_reading());
        ch.disable_all();
        assert!(ch.is_none_interest());
    }

    #[test]
    fn dispatch_order_and_masks() {
        let ch = orphan_channel(0);
        let order = Arc::new(Mutex::new(Vec::new()));
        let (o1, o2, o3, o4) = (order.clone(), order.clone(), order.clone(), order.clone());
        ch.set_handlers(EventHandlers {
            read: Some(Box::new(move |_| o1.lock().push("read"))),
            write: Some(Box::new(move || o2.lock().push("write"))),
            close: Some(Box::new(move || o3.lock().push("close"))),
            error: Some(Box::new(move || o4.lock().push("error"))),
        });

        ch.set_ready(event::ERROR | event::READABLE | event::WRITABLE);
        ch.handle_event(Timestamp::now());
        assert_eq!(*order.lock(), vec!["error", "read", "write"]);

        order.lock().clear();
        ch.set_ready(event::HANGUP);
        ch.handle_event(Timestamp::now());
        assert_eq!(*order.lock(), vec!["close"]);

        // Hang-up with pending input is read first, not closed.
        order.lock().clear();
        ch.set_ready(event::HANGUP | event::READABLE);
        ch.handle_event(Timestamp::now());
        assert_eq!(*order.lock(), vec!["read"]);
    }

    #[test]
    fn dead_tie_drops_events() {
        let ch = orphan_channel(0);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        ch.set_handlers(EventHandlers {
            read: Some(Box::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        });
        ch.set_ready(event::READABLE);

        let guard: Arc<dyn Any + Send + Sync> = Arc::new(42u32);
        ch.tie(guard.clone());
        ch.handle_event(Timestamp::now());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        drop(guard);
        ch.handle_event(Timestamp::now());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
