//! Elastic worker pool for transfer sessions.
//!
//! Workers are tokio tasks pulling boxed futures from a shared queue. The
//! pool starts at `min` workers, adds one whenever outstanding work
//! (queued + running) exceeds the worker count, and lets workers retire
//! cooperatively once outstanding work drops below it again.

use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{oneshot, Notify};

type Job = BoxFuture<'static, ()>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool is closed")]
    Closed,
    #[error("task panicked: {0}")]
    TaskPanicked(String),
    #[error("task was dropped before completing")]
    Cancelled,
}

/// Cloneable handle to a shared pool.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
    min: usize,
    max: usize,
}

struct State {
    queue: VecDeque<Job>,
    workers: usize,
    running: usize,
    closed: bool,
}

impl State {
    fn outstanding(&self) -> usize {
        self.queue.len() + self.running
    }

    fn has_surplus(&self, min: usize) -> bool {
        self.workers > min && self.outstanding() < self.workers
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl WorkerPool {
    /// Start a pool with `min` workers. Must be called inside a tokio runtime.
    pub fn new(min: usize, max: usize) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                workers: min,
                running: 0,
                closed: false,
            }),
            notify: Notify::new(),
            min,
            max,
        });
        for _ in 0..min {
            tokio::spawn(worker_loop(Arc::clone(&shared)));
        }
        tracing::debug!(min, max, "worker pool started");
        Self { shared }
    }

    /// Queue `task` and return a handle resolving to its output.
    pub fn submit<F, T>(&self, task: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = async move {
            let result = AssertUnwindSafe(task)
                .catch_unwind()
                .await
                .map_err(|payload| PoolError::TaskPanicked(panic_message(payload.as_ref())));
            let _ = tx.send(result);
        }
        .boxed();

        let (grow, shrink) = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            state.queue.push_back(job);
            if state.outstanding() > state.workers && state.workers < self.shared.max {
                state.workers += 1;
                (true, false)
            } else {
                (false, state.has_surplus(self.shared.min))
            }
        };

        if grow {
            tokio::spawn(worker_loop(Arc::clone(&self.shared)));
        } else if shrink {
            // Idle workers re-check whether they are surplus.
            self.shared.notify.notify_waiters();
        }
        self.shared.notify.notify_one();

        Ok(TaskHandle { rx })
    }

    pub fn worker_count(&self) -> usize {
        self.shared.lock().workers
    }

    /// Queued plus running tasks.
    pub fn outstanding(&self) -> usize {
        self.shared.lock().outstanding()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Refuse new submissions. Queued tasks still run; idle workers exit.
    pub fn shutdown(&self) {
        self.shared.lock().closed = true;
        self.shared.notify.notify_waiters();
    }
}

async fn worker_loop(shared: Arc<Shared>) {
    loop {
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let job = {
            let mut state = shared.lock();
            match state.queue.pop_front() {
                Some(job) => {
                    state.running += 1;
                    Some(job)
                }
                None if state.closed || state.has_surplus(shared.min) => {
                    state.workers -= 1;
                    tracing::trace!(workers = state.workers, "idle worker exiting");
                    return;
                }
                None => None,
            }
        };

        match job {
            Some(job) => {
                job.await;
                let mut state = shared.lock();
                state.running -= 1;
                if state.has_surplus(shared.min) {
                    state.workers -= 1;
                    tracing::trace!(workers = state.workers, "surplus worker retiring");
                    return;
                }
            }
            None => notified.await,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Resolves to the task's output, or why there is none.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T, PoolError>>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(PoolError::Cancelled)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::watch;

    async fn wait_for_workers(pool: &WorkerPool, want: usize) {
        for _ in 0..200 {
            if pool.worker_count() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker count stuck at {}, wanted {want}", pool.worker_count());
    }

    fn blocking_tasks(
        pool: &WorkerPool,
        n: usize,
        release: &watch::Receiver<bool>,
    ) -> Vec<TaskHandle<usize>> {
        (0..n)
            .map(|i| {
                let mut release = release.clone();
                pool.submit(async move {
                    let _ = release.wait_for(|go| *go).await;
                    i
                })
                .unwrap()
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn tasks_return_results() {
        let pool = WorkerPool::new(2, 4);
        let handles: Vec<_> = (0..20u64)
            .map(|i| pool.submit(async move { i * i }).unwrap())
            .collect();
        let mut total = 0;
        for h in handles {
            total += h.await.unwrap();
        }
        assert_eq!(total, (0..20u64).map(|i| i * i).sum::<u64>());
    }

    #[tokio::test]
    async fn panic_is_reported_and_worker_survives() {
        let pool = WorkerPool::new(1, 1);
        let bad = pool.submit(async { panic!("boom") }).unwrap();
        match bad.await {
            Err(PoolError::TaskPanicked(msg)) => assert!(msg.contains("boom")),
            other => panic!("unexpected {other:?}"),
        }
        let good = pool.submit(async { 5 }).unwrap();
        assert_eq!(good.await, Ok(5));
        assert_eq!(pool.worker_count(), 1);
    }

    #[tokio::test]
    async fn submit_after_shutdown_fails() {
        let pool = WorkerPool::new(1, 2);
        pool.shutdown();
        assert!(pool.is_closed());
        assert!(matches!(pool.submit(async {}), Err(PoolError::Closed)));
    }

    #[tokio::test]
    async fn queued_work_drains_after_shutdown() {
        let pool = WorkerPool::new(1, 1);
        let (tx, rx) = watch::channel(false);
        let handles = blocking_tasks(&pool, 3, &rx);
        pool.shutdown();
        tx.send_replace(true);
        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(h.await, Ok(i));
        }
        wait_for_workers(&pool, 0).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn grows_to_max_and_shrinks_back_to_min() {
        let pool = WorkerPool::new(2, 4);
        let (tx, rx) = watch::channel(false);
        let handles = blocking_tasks(&pool, 6, &rx);

        assert_eq!(pool.worker_count(), 4);
        assert_eq!(pool.outstanding(), 6);

        tx.send_replace(true);
        for h in handles {
            h.await.unwrap();
        }
        wait_for_workers(&pool, 2).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn grows_only_as_far_as_pending_work() {
        let pool = WorkerPool::new(2, 8);
        let (tx, rx) = watch::channel(false);
        let handles = blocking_tasks(&pool, 3, &rx);

        assert_eq!(pool.worker_count(), 3);

        tx.send_replace(true);
        for h in handles {
            h.await.unwrap();
        }
        wait_for_workers(&pool, 2).await;
    }
}
