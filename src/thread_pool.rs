//! Fixed-size worker pool with two priority levels and polled futures.
//!
//! On-demand chunk decodes are submitted at high priority so a saturated
//! prefetch queue can never stall the caller. Results come back through
//! `TaskFuture`, a small mutex-and-condvar future the owner thread can
//! poll with a zero timeout while it advances prefetches. Workers never
//! wait on other workers' futures, so the pool cannot deadlock on itself.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{PargzError, PargzResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPriority {
    /// On-demand work the caller is blocked on.
    High,
    /// Speculative prefetches.
    Normal,
}

enum FutureSlot<T> {
    Pending,
    Done(T),
    Panicked,
}

struct FutureState<T> {
    slot: Mutex<FutureSlot<T>>,
    ready: Condvar,
}

/// Handle to a submitted task's eventual result.
pub struct TaskFuture<T> {
    state: Arc<FutureState<T>>,
}

impl<T> TaskFuture<T> {
    fn new() -> (Self, Arc<FutureState<T>>) {
        let state = Arc::new(FutureState {
            slot: Mutex::new(FutureSlot::Pending),
            ready: Condvar::new(),
        });
        (
            Self {
                state: Arc::clone(&state),
            },
            state,
        )
    }

    pub fn is_ready(&self) -> bool {
        !matches!(*self.state.slot.lock().unwrap(), FutureSlot::Pending)
    }

    /// Wait up to `timeout` for completion; true when the result is ready.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.state.slot.lock().unwrap();
        let (guard, _) = self
            .state
            .ready
            .wait_timeout_while(guard, timeout, |slot| matches!(slot, FutureSlot::Pending))
            .unwrap();
        !matches!(*guard, FutureSlot::Pending)
    }

    /// Block until the task finishes and take its result. A panicked
    /// worker surfaces as an internal error instead of a deadlock.
    pub fn take(self) -> PargzResult<T> {
        let mut guard = self.state.slot.lock().unwrap();
        while matches!(*guard, FutureSlot::Pending) {
            guard = self.state.ready.wait(guard).unwrap();
        }
        match std::mem::replace(&mut *guard, FutureSlot::Panicked) {
            FutureSlot::Done(value) => Ok(value),
            FutureSlot::Panicked => Err(PargzError::internal("worker task panicked")),
            FutureSlot::Pending => unreachable!("waited for completion"),
        }
    }
}

type Job = Box<dyn FnOnce() + Send>;

struct Queues {
    high: VecDeque<Job>,
    normal: VecDeque<Job>,
    running: bool,
}

struct PoolShared {
    queues: Mutex<Queues>,
    ping: Condvar,
}

pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let shared = Arc::new(PoolShared {
            queues: Mutex::new(Queues {
                high: VecDeque::new(),
                normal: VecDeque::new(),
                running: true,
            }),
            ping: Condvar::new(),
        });

        let workers = (0..threads)
            .map(|index| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("pargz-worker-{index}"))
                    .spawn(move || worker_main(&shared))
                    .expect("spawning worker thread")
            })
            .collect();

        Self { shared, workers }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn pending_tasks(&self) -> usize {
        let queues = self.shared.queues.lock().unwrap();
        queues.high.len() + queues.normal.len()
    }

    pub fn submit<T, F>(&self, priority: TaskPriority, task: F) -> TaskFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (future, state) = TaskFuture::new();
        let job: Job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(task));
            let mut slot = state.slot.lock().unwrap();
            *slot = match result {
                Ok(value) => FutureSlot::Done(value),
                Err(_) => FutureSlot::Panicked,
            };
            state.ready.notify_all();
        });

        let mut queues = self.shared.queues.lock().unwrap();
        match priority {
            TaskPriority::High => queues.high.push_back(job),
            TaskPriority::Normal => queues.normal.push_back(job),
        }
        drop(queues);
        self.shared.ping.notify_one();

        future
    }

    /// Cooperative shutdown: raise the stop flag, wake everyone, join.
    /// Queued-but-unstarted tasks are dropped; their futures resolve as
    /// abandoned (panicked) rather than hanging.
    pub fn stop(&mut self) {
        {
            let mut queues = self.shared.queues.lock().unwrap();
            queues.running = false;
            queues.high.clear();
            queues.normal.clear();
        }
        self.shared.ping.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_main(shared: &PoolShared) {
    loop {
        let job = {
            let mut queues = shared.queues.lock().unwrap();
            loop {
                if !queues.running {
                    return;
                }
                if let Some(job) = queues.high.pop_front() {
                    break job;
                }
                if let Some(job) = queues.normal.pop_front() {
                    break job;
                }
                queues = shared.ping.wait(queues).unwrap();
            }
        };
        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn runs_tasks_and_returns_results() {
        let pool = ThreadPool::new(4);
        let futures: Vec<_> = (0..32)
            .map(|i| pool.submit(TaskPriority::Normal, move || i * 2))
            .collect();
        let results: Vec<i32> = futures.into_iter().map(|f| f.take().unwrap()).collect();
        assert_eq!(results, (0..32).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn high_priority_jumps_the_queue() {
        let pool = ThreadPool::new(1);
        let gate = Arc::new(AtomicBool::new(false));
        let order = Arc::new(Mutex::new(Vec::new()));

        // Occupy the single worker until the gate opens.
        let blocker_gate = Arc::clone(&gate);
        let blocker = pool.submit(TaskPriority::Normal, move || {
            while !blocker_gate.load(Ordering::Acquire) {
                std::thread::yield_now();
            }
        });

        let normal_order = Arc::clone(&order);
        let normal = pool.submit(TaskPriority::Normal, move || {
            normal_order.lock().unwrap().push("normal");
        });
        let high_order = Arc::clone(&order);
        let high = pool.submit(TaskPriority::High, move || {
            high_order.lock().unwrap().push("high");
        });

        gate.store(true, Ordering::Release);
        blocker.take().unwrap();
        high.take().unwrap();
        normal.take().unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["high", "normal"]);
    }

    #[test]
    fn wait_timeout_polls_without_blocking_forever() {
        let pool = ThreadPool::new(1);
        let gate = Arc::new(AtomicBool::new(false));
        let task_gate = Arc::clone(&gate);
        let future = pool.submit(TaskPriority::Normal, move || {
            while !task_gate.load(Ordering::Acquire) {
                std::thread::yield_now();
            }
            7
        });

        assert!(!future.wait_timeout(Duration::from_millis(1)));
        gate.store(true, Ordering::Release);
        assert_eq!(future.take().unwrap(), 7);
    }

    #[test]
    fn panicking_task_resolves_as_error() {
        let pool = ThreadPool::new(1);
        let future = pool.submit(TaskPriority::Normal, || panic!("boom"));
        assert!(matches!(future.take(), Err(PargzError::Internal(_))));

        // The worker survives the panic.
        let ok = pool.submit(TaskPriority::Normal, || 1);
        assert_eq!(ok.take().unwrap(), 1);
    }

    #[test]
    fn stop_joins_all_workers() {
        let mut pool = ThreadPool::new(4);
        for _ in 0..16 {
            pool.submit(TaskPriority::Normal, || {
                std::thread::sleep(Duration::from_millis(1))
            });
        }
        pool.stop();
        assert_eq!(pool.size(), 0);
    }
}
