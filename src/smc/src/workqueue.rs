//! Deferred work items run on a shared thread pool.
//!
//! A `WorkItem` is scheduled from contexts that must not block (hardware event callbacks).
//! Scheduling an item that is already pending does nothing; runs of one item never overlap.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use futures::executor::{ThreadPool, ThreadPoolBuilder};

use crate::config::SMC_WQ_THREADS;

pub(crate) fn build_pool() -> std::io::Result<ThreadPool> {
    ThreadPoolBuilder::new()
        .pool_size(SMC_WQ_THREADS)
        .name_prefix("smc-wq-")
        .create()
}

struct WorkState {
    pending: AtomicBool,
    running: Mutex<()>,
    queued: AtomicUsize,
    /// Only pairs `idle` with `queued`; `schedule` never takes it.
    idle_lock: Mutex<()>,
    idle: Condvar,
    func: Box<dyn Fn() + Send + Sync>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// Decrements the queued count even when the work function panics.
struct Finished<'a>(&'a WorkState);

impl Drop for Finished<'_> {
    fn drop(&mut self) {
        self.0.queued.fetch_sub(1, Ordering::AcqRel);
        // a flush between its check and its wait still holds the lock, so it cannot miss this
        drop(lock(&self.0.idle_lock));
        self.0.idle.notify_all();
    }
}

impl WorkState {
    fn run(&self) {
        let _finished = Finished(self);
        let _running = lock(&self.running);
        // Cleared before running so that a schedule() racing with this run queues another one.
        self.pending.store(false, Ordering::Release);
        (self.func)();
    }
}

pub(crate) struct WorkItem {
    state: Arc<WorkState>,
    pool: ThreadPool,
}

impl WorkItem {
    pub(crate) fn new<F>(pool: ThreadPool, func: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        WorkItem {
            state: Arc::new(WorkState {
                pending: AtomicBool::new(false),
                running: Mutex::new(()),
                queued: AtomicUsize::new(0),
                idle_lock: Mutex::new(()),
                idle: Condvar::new(),
                func: Box::new(func),
            }),
            pool,
        }
    }

    /// Queue a run unless one is already pending. Takes no lock.
    pub(crate) fn schedule(&self) -> bool {
        if self.state.pending.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.state.queued.fetch_add(1, Ordering::AcqRel);
        let state = Arc::clone(&self.state);
        self.pool.spawn_ok(async move { state.run() });
        true
    }

    /// Wait until no run is queued or executing.
    ///
    /// Must not be called from the work function itself.
    pub(crate) fn flush(&self) {
        let mut idle = lock(&self.state.idle_lock);
        while self.state.queued.load(Ordering::Acquire) > 0 {
            idle = self
                .state
                .idle
                .wait(idle)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("pending", &self.state.pending.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn pending_run_coalesces() {
        let pool = build_pool().unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Mutex::new(gate_rx);
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&runs);
        let work = WorkItem::new(pool, move || {
            gate_rx.lock().unwrap().recv().unwrap();
            r.fetch_add(1, Ordering::SeqCst);
        });

        assert!(work.schedule());
        // the first run is blocked on the gate; at most one more can be pending behind it
        std::thread::sleep(Duration::from_millis(20));
        let queued = (0..10).filter(|_| work.schedule()).count();
        assert!(queued <= 1);
        for _ in 0..(1 + queued) {
            gate_tx.send(()).unwrap();
        }
        work.flush();
        assert_eq!(runs.load(Ordering::SeqCst), 1 + queued);
    }

    #[test]
    fn runs_never_overlap() {
        let pool = build_pool().unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicBool::new(false));
        let (a, o) = (Arc::clone(&active), Arc::clone(&overlap));
        let work = WorkItem::new(pool, move || {
            if a.fetch_add(1, Ordering::SeqCst) != 0 {
                o.store(true, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_millis(2));
            a.fetch_sub(1, Ordering::SeqCst);
        });
        for _ in 0..50 {
            work.schedule();
            std::thread::sleep(Duration::from_micros(300));
        }
        work.flush();
        assert!(!overlap.load(Ordering::SeqCst));
    }

    #[test]
    fn schedule_does_not_wait_for_flush() {
        let (done_tx, done_rx) = mpsc::channel();
        let done_tx = Mutex::new(done_tx);
        let work = Arc::new(WorkItem::new(build_pool().unwrap(), move || {
            let _ = done_tx.lock().unwrap().send(());
        }));
        // a flusher parked on the idle lock must not hold up event delivery
        let idle = lock(&work.state.idle_lock);
        let w = Arc::clone(&work);
        let scheduler = std::thread::spawn(move || w.schedule());
        assert!(scheduler.join().unwrap());
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        drop(idle);
        work.flush();
        assert_eq!(work.state.queued.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn flush_without_work_returns() {
        let work = WorkItem::new(build_pool().unwrap(), || {});
        work.flush();
    }
}
