//! Single-threaded cooperative scheduler.
//!
//! One `EventLoop` per OS thread, enforced at construction. The owner
//! thread suspends only inside the poller; foreign threads inject work
//! through [`EventLoop::run_in_loop`] / [`EventLoop::queue_in_loop`] and
//! force the loop out of its wait with an eventfd write.

use crate::channel::{Channel, EventHandlers};
use crate::error::Error;
use crate::poller::{new_default_poller, Poller};
use crate::timestamp::Timestamp;
use parking_lot::Mutex;
use std::any::Any;
use std::cell::Cell;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use tracing::{error, info, trace};

pub type Task = Box<dyn FnOnce() + Send>;

const POLL_TIMEOUT_MS: i32 = 10 * 1000;

thread_local! {
    static LOOP_IN_THREAD: Cell<bool> = const { Cell::new(false) };
}

pub struct EventLoop {
    thread_id: ThreadId,
    looping: AtomicBool,
    quit: AtomicBool,
    calling_pending_tasks: AtomicBool,
    poll_return_time: AtomicI64,
    poller: Mutex<Box<dyn Poller>>,
    wakeup_channel: Arc<Channel>,
    wakeup_fd: OwnedFd,
    pending_tasks: Mutex<Vec<Task>>,
}

impl EventLoop {
    /// Create the loop owned by the calling thread.
    ///
    /// Panics if this thread already owns a loop; that is a programming
    /// error the process cannot recover from.
    pub fn new() -> Result<Arc<Self>, Error> {
        if LOOP_IN_THREAD.get() {
            error!(thread = ?thread::current().id(), "another EventLoop exists in this thread");
            panic!("another EventLoop exists in this thread");
        }

        let poller = new_default_poller()?;
        let wakeup_fd = create_eventfd()?;
        let wakeup_raw = wakeup_fd.as_raw_fd();

        let event_loop = Arc::new_cyclic(|weak: &Weak<EventLoop>| EventLoop {
            thread_id: thread::current().id(),
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            calling_pending_tasks: AtomicBool::new(false),
            poll_return_time: AtomicI64::new(0),
            poller: Mutex::new(poller),
            wakeup_channel: Channel::new(weak.clone(), wakeup_raw),
            wakeup_fd,
            pending_tasks: Mutex::new(Vec::new()),
        });

        event_loop.wakeup_channel.set_handlers(EventHandlers {
            read: Some(Box::new(move |_| drain_wakeup(wakeup_raw))),
            ..Default::default()
        });
        event_loop.wakeup_channel.enable_reading();

        LOOP_IN_THREAD.set(true);
        info!(thread = ?event_loop.thread_id, "event loop created");
        Ok(event_loop)
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Time of the most recent poller wake-up.
    pub fn poll_return_time(&self) -> Timestamp {
        Timestamp::from_micros(self.poll_return_time.load(Ordering::Acquire))
    }

    /// Drive the loop until [`EventLoop::quit`]. Must be called from the
    /// owner thread.
    pub fn run(&self) {
        if !self.is_in_loop_thread() {
            error!("EventLoop::run called off the owner thread");
            panic!("EventLoop::run called off the owner thread");
        }
        self.looping.store(true, Ordering::Release);
        self.quit.store(false, Ordering::Release);
        info!("event loop start looping");

        let mut active: Vec<Arc<Channel>> = Vec::new();
        while !self.quit.load(Ordering::Acquire) {
            active.clear();
            let at = self.poller.lock().poll(POLL_TIMEOUT_MS, &mut active);
            self.poll_return_time
                .store(at.micros_since_epoch(), Ordering::Release);
            for channel in &active {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| channel.handle_event(at))) {
                    error!(
                        fd = channel.fd(),
                        "event handler panicked: {}",
                        panic_message(&panic)
                    );
                }
            }
            self.run_pending_tasks();
        }

        info!("event loop stop looping");
        self.looping.store(false, Ordering::Release);
    }

    /// Ask the loop to exit after the current iteration. Safe from any
    /// thread.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Run `task` on the loop thread: immediately when already there,
    /// queued otherwise.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queue `task` for the bottom of a loop iteration.
    ///
    /// The wake-up condition is subtle but load-bearing: a foreign
    /// caller must always wake the loop, and so must a caller on the
    /// loop thread while the pending queue is being drained, because the
    /// drain has already swapped the queue out.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        {
            self.pending_tasks.lock().push(Box::new(task));
        }
        if !self.is_in_loop_thread() || self.calling_pending_tasks.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Force the loop out of its poller wait.
    pub fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wakeup_fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n != 8 {
            error!(bytes = n, "wakeup write returned unexpected byte count");
        }
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.poller.lock().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Arc<Channel>) {
        self.poller.lock().remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.poller.lock().has_channel(channel)
    }

    fn run_pending_tasks(&self) {
        self.calling_pending_tasks.store(true, Ordering::Release);
        // Swap under the lock, run outside it: a task that queues more
        // work must not deadlock against its own loop.
        let tasks: Vec<Task> = std::mem::take(&mut *self.pending_tasks.lock());
        let count = tasks.len();
        for task in tasks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
                error!("queued task panicked: {}", panic_message(&panic));
            }
        }
        if count > 0 {
            trace!(count, "ran pending tasks");
        }
        self.calling_pending_tasks.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        let poller = self.poller.get_mut();
        poller.remove_channel(&self.wakeup_channel);
        if self.is_in_loop_thread() {
            LOOP_IN_THREAD.set(false);
        }
    }
}

fn create_eventfd() -> Result<OwnedFd, Error> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        let err = io::Error::last_os_error();
        error!(%err, "eventfd creation failed");
        return Err(Error::Io(err));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn drain_wakeup(fd: RawFd) {
    let mut counter: u64 = 0;
    let n = unsafe { libc::read(fd, &mut counter as *mut u64 as *mut libc::c_void, 8) };
    if n != 8 {
        error!(bytes = n, "wakeup read returned unexpected byte count");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "opaque panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn one_loop_per_thread() {
        let handle = thread::spawn(|| {
            let _first = EventLoop::new().unwrap();
            let second = catch_unwind(EventLoop::new);
            assert!(second.is_err());
        });
        handle.join().unwrap();
    }

    #[test]
    fn run_in_loop_on_owner_thread_is_synchronous() {
        let event_loop = EventLoop::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        event_loop.run_in_loop(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn queued_tasks_run_in_order_exactly_once() {
        let event_loop = EventLoop::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let seen = seen.clone();
            event_loop.queue_in_loop(move || seen.lock().push(i));
        }
        let l = event_loop.clone();
        event_loop.queue_in_loop(move || l.quit());
        event_loop.wakeup();
        event_loop.run();
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn foreign_thread_wakes_idle_loop() {
        let (tx, rx) = std::sync::mpsc::channel();
        let (loop_tx, loop_rx) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || {
            let event_loop = EventLoop::new().unwrap();
            loop_tx.send(event_loop.clone()).unwrap();
            event_loop.run();
        });
        let event_loop: Arc<EventLoop> = loop_rx.recv().unwrap();

        // Give the loop time to park inside poll, then inject a task.
        thread::sleep(Duration::from_millis(50));
        let before = event_loop.poll_return_time();
        event_loop.run_in_loop(move || {
            tx.send(Timestamp::now()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(2))
            .expect("task did not run promptly");
        assert!(event_loop.poll_return_time() >= before);

        event_loop.quit();
        handle.join().unwrap();
    }

    #[test]
    fn panicking_task_does_not_kill_loop() {
        let (loop_tx, loop_rx) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || {
            let event_loop = EventLoop::new().unwrap();
            loop_tx.send(event_loop.clone()).unwrap();
            event_loop.run();
        });
        let event_loop: Arc<EventLoop> = loop_rx.recv().unwrap();

        event_loop.run_in_loop(|| panic!("boom"));
        let (tx, rx) = std::sync::mpsc::channel();
        event_loop.run_in_loop(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(2))
            .expect("loop died after a panicking task");

        event_loop.quit();
        handle.join().unwrap();
    }
}
