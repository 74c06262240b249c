//! Readiness demultiplexing.
//!
//! The poller owns the fd -> channel registration table for one event
//! loop. `update_channel` / `remove_channel` are only invoked from the
//! owner loop's thread, so no concurrency control is needed beyond the
//! loop holding the poller.

use crate::channel::Channel;
use crate::timestamp::Timestamp;
use std::io;
use std::sync::Arc;

mod epoll;

pub use epoll::EpollPoller;

/// Channel not known to the poller.
pub(crate) const STATE_NEW: i32 = -1;
/// Channel registered with the OS.
pub(crate) const STATE_ADDED: i32 = 1;
/// Channel in the table but unregistered (no interest).
pub(crate) const STATE_DELETED: i32 = 2;

pub trait Poller: Send {
    /// Block up to `timeout_ms` and append every ready channel to
    /// `active` with its ready mask set. Returns the wake-up time.
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Timestamp;

    /// Apply the channel's current interest to the OS registration,
    /// driving the kNew/kAdded/kDeleted state machine.
    fn update_channel(&mut self, channel: &Arc<Channel>);

    /// Drop the channel from the table and the OS registration.
    fn remove_channel(&mut self, channel: &Channel);

    fn has_channel(&self, channel: &Channel) -> bool;
}

/// Select the platform backend.
pub fn new_default_poller() -> io::Result<Box<dyn Poller>> {
    Ok(Box::new(EpollPoller::new()?))
}
