//! Fixed-size pool of worker loops plus the base loop.

use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::loop_thread::{LoopThread, ThreadInitCallback};
use std::sync::Arc;

/// Round-robin allocator over the worker loops. With zero workers every
/// request falls back to the base loop. Only touched from the base
/// loop's thread.
pub struct LoopPool {
    base_loop: Arc<EventLoop>,
    name: String,
    started: bool,
    num_threads: usize,
    next: usize,
    threads: Vec<LoopThread>,
    loops: Vec<Arc<EventLoop>>,
}

impl LoopPool {
    pub fn new(base_loop: Arc<EventLoop>, name: impl Into<String>) -> Self {
        LoopPool {
            base_loop,
            name: name.into(),
            started: false,
            num_threads: 0,
            next: 0,
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    /// Must be called before [`LoopPool::start`]; the pool never resizes
    /// afterwards.
    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    pub fn start(&mut self, init: Option<ThreadInitCallback>) -> Result<(), Error> {
        self.started = true;

        for i in 0..self.num_threads {
            let thread_name = format!("{}-{}", self.name, i);
            let mut thread = LoopThread::new(init.clone(), thread_name);
            let event_loop = thread.start_loop()?;
            self.threads.push(thread);
            self.loops.push(event_loop);
        }

        if self.num_threads == 0 {
            if let Some(cb) = init {
                cb(&self.base_loop);
            }
        }
        Ok(())
    }

    /// Next loop in round-robin order, or the base loop when the pool is
    /// empty.
    pub fn next_loop(&mut self) -> Arc<EventLoop> {
        if self.loops.is_empty() {
            return self.base_loop.clone();
        }
        let event_loop = self.loops[self.next].clone();
        self.next += 1;
        if self.next >= self.loops.len() {
            self.next = 0;
        }
        event_loop
    }

    pub fn all_loops(&self) -> Vec<Arc<EventLoop>> {
        if self.loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            self.loops.clone()
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr(event_loop: &Arc<EventLoop>) -> usize {
        Arc::as_ptr(event_loop) as usize
    }

    #[test]
    fn round_robin_over_three_workers() {
        let base = EventLoop::new().unwrap();
        let mut pool = LoopPool::new(base.clone(), "pool-test");
        pool.set_thread_num(3);
        pool.start(None).unwrap();

        let picks: Vec<usize> = (0..5).map(|_| ptr(&pool.next_loop())).collect();
        assert_eq!(picks[0], picks[3]);
        assert_eq!(picks[1], picks[4]);
        assert_ne!(picks[0], picks[1]);
        assert_ne!(picks[1], picks[2]);
        assert_ne!(picks[0], picks[2]);
        for pick in &picks {
            assert_ne!(*pick, ptr(&base));
        }
        assert_eq!(pool.all_loops().len(), 3);
    }

    #[test]
    fn zero_workers_fall_back_to_base_loop() {
        let base = EventLoop::new().unwrap();
        let mut pool = LoopPool::new(base.clone(), "pool-zero");
        pool.start(None).unwrap();

        assert_eq!(ptr(&pool.next_loop()), ptr(&base));
        assert_eq!(ptr(&pool.next_loop()), ptr(&base));
        let all = pool.all_loops();
        assert_eq!(all.len(), 1);
        assert_eq!(ptr(&all[0]), ptr(&base));
    }

    #[test]
    fn zero_workers_run_init_on_base_loop() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let base = EventLoop::new().unwrap();
        let mut pool = LoopPool::new(base, "pool-init");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        pool.start(Some(Arc::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
