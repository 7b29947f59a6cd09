use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

/// Bounded worker pool that delivery completions run on.
///
/// The runtime is chosen by the caller, so slow result handling never competes
/// with the transport's own I/O tasks, and the concurrency limit is set
/// independently of the transport.
#[derive(Debug, Clone)]
pub struct CompletionExecutor {
    handle: Handle,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl CompletionExecutor {
    pub fn new(handle: Handle, concurrency: usize) -> Self {
        Self { handle, semaphore: Arc::new(Semaphore::new(concurrency.max(1))), tracker: TaskTracker::new() }
    }

    /// Uses the runtime the caller is currently running on.
    ///
    /// # Panics
    /// Panics when called outside of a tokio runtime.
    pub fn current(concurrency: usize) -> Self {
        Self::new(Handle::current(), concurrency)
    }

    /// Runs `task` once a worker permit is free.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        self.tracker.spawn_on(
            async move {
                // The semaphore is never closed, so a failed acquire cannot happen.
                let _permit = semaphore.acquire_owned().await.ok();
                task.await
            },
            &self.handle,
        )
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub fn close(&self) -> bool {
        self.tracker.close()
    }

    /// Resolves once the executor is closed and every spawned task has finished.
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let executor = CompletionExecutor::current(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                executor.spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2, "At most two tasks may run at once");
        assert_eq!(executor.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_wait_drains_spawned_tasks() {
        let executor = CompletionExecutor::current(4);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let done = Arc::clone(&done);
            executor.spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        executor.close();
        executor.wait().await;

        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(executor.in_flight(), 0);
    }

    #[test]
    fn test_runs_on_supplied_runtime() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("completion-pool")
            .enable_all()
            .build()
            .unwrap();
        let executor = CompletionExecutor::new(runtime.handle().clone(), 1);

        let handle = executor.spawn(async { std::thread::current().name().map(ToString::to_string) });
        let thread_name = runtime.block_on(handle).unwrap();

        assert_eq!(thread_name.as_deref(), Some("completion-pool"));
    }
}
