//! One event loop hosted on a dedicated OS thread.

use crate::error::Error;
use crate::event_loop::EventLoop;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::error;

/// Invoked on each worker loop right after it is constructed, before it
/// starts looping.
pub type ThreadInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

struct Shared {
    slot: Mutex<Option<Arc<EventLoop>>>,
    ready: Condvar,
    failed: AtomicBool,
}

/// Spawns a thread whose body constructs a stack-local loop, publishes
/// it, and drives it until quit.
pub struct LoopThread {
    name: String,
    init: Option<ThreadInitCallback>,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl LoopThread {
    pub fn new(init: Option<ThreadInitCallback>, name: impl Into<String>) -> Self {
        LoopThread {
            name: name.into(),
            init,
            shared: Arc::new(Shared {
                slot: Mutex::new(None),
                ready: Condvar::new(),
                failed: AtomicBool::new(false),
            }),
            handle: None,
        }
    }

    /// Spawn the thread and block until its loop is published.
    pub fn start_loop(&mut self) -> Result<Arc<EventLoop>, Error> {
        let shared = self.shared.clone();
        let init = self.init.clone();
        let thread_name = self.name.clone();

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let event_loop = match EventLoop::new() {
                    Ok(event_loop) => event_loop,
                    Err(err) => {
                        error!(thread = %thread_name, %err, "failed to create worker loop");
                        let _slot = shared.slot.lock();
                        shared.failed.store(true, Ordering::Release);
                        shared.ready.notify_one();
                        return;
                    }
                };
                if let Some(cb) = init {
                    cb(&event_loop);
                }
                {
                    *shared.slot.lock() = Some(event_loop.clone());
                    shared.ready.notify_one();
                }
                event_loop.run();
                *shared.slot.lock() = None;
            })
            .map_err(Error::Io)?;
        self.handle = Some(handle);

        let mut slot = self.shared.slot.lock();
        while slot.is_none() && !self.shared.failed.load(Ordering::Acquire) {
            self.shared.ready.wait(&mut slot);
        }
        match slot.clone() {
            Some(event_loop) => Ok(event_loop),
            None => Err(Error::WorkerStartup(self.name.clone())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        let event_loop = self.shared.slot.lock().clone();
        if let Some(event_loop) = event_loop {
            event_loop.quit();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
