//! Cancellable delayed tasks.
//!
//! Reconnect retries and log upload cycles both run through [`Scheduler`]. A task that
//! has been cancelled before its delay elapsed never runs its body.

use std::future::Future;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct Scheduler {
    runtime: Handle,
}

impl Scheduler {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Binds to the runtime of the calling context. Panics outside a Tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    pub fn schedule<F>(&self, delay: Duration, task: F) -> ScheduledTask
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.schedule_with(CancellationToken::new(), delay, task)
    }

    /// Like [`Scheduler::schedule`] but cancelled through `token`, which lets callers
    /// hand the same token to the task body or derive it from a parent.
    pub fn schedule_with<F>(
        &self,
        token: CancellationToken,
        delay: Duration,
        task: F,
    ) -> ScheduledTask
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = token.clone();
        let handle = self.runtime.spawn(async move {
            tokio::select! {
                biased;
                _ = guard.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            task.await;
        });
        ScheduledTask { token, handle }
    }

    pub fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(task)
    }
}

/// Handle to a pending delayed task. Dropping the handle detaches the task.
#[derive(Debug)]
pub struct ScheduledTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use test_timeout::tokio_timeout_test;

    fn counting_task(counter: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio_timeout_test(10, paused)]
    async fn runs_after_delay() {
        let scheduler = Scheduler::current();
        let fired = Arc::new(AtomicUsize::new(0));
        let task = scheduler.schedule(Duration::from_secs(5), counting_task(&fired));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(task.is_finished());
    }

    #[tokio_timeout_test(10, paused)]
    async fn cancelled_task_never_fires() {
        let scheduler = Scheduler::current();
        let fired = Arc::new(AtomicUsize::new(0));
        let task = scheduler.schedule(Duration::from_secs(5), counting_task(&fired));

        tokio::time::sleep(Duration::from_secs(1)).await;
        task.cancel();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(task.is_cancelled());
        assert!(task.is_finished());
    }

    #[tokio_timeout_test(10, paused)]
    async fn parent_token_cancels_child_tasks() {
        let scheduler = Scheduler::current();
        let fired = Arc::new(AtomicUsize::new(0));
        let parent = CancellationToken::new();
        let _first =
            scheduler.schedule_with(parent.child_token(), Duration::from_secs(1), counting_task(&fired));
        let _second =
            scheduler.schedule_with(parent.child_token(), Duration::from_secs(2), counting_task(&fired));

        parent.cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio_timeout_test(10, paused)]
    async fn independent_timers_coexist() {
        let scheduler = Scheduler::current();
        let fired = Arc::new(AtomicUsize::new(0));
        let short = scheduler.schedule(Duration::from_secs(1), counting_task(&fired));
        let long = scheduler.schedule(Duration::from_secs(3), counting_task(&fired));

        long.cancel();
        tokio::time::sleep(Duration::from_secs(4)).await;

        assert!(short.is_finished());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
