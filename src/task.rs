use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A spawned background task that is cancelled explicitly or when dropped.
///
/// The task receives a [`CancellationToken`] and should race its awaits
/// against `token.cancelled()`. The token fires before the task is aborted,
/// so a task that is parked on I/O sees cancellation on its next poll.
pub struct TaskHandle {
    name: &'static str,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub fn spawn<F, Fut>(name: &'static str, task: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::with_token(name, CancellationToken::new(), task)
    }

    /// Like [`TaskHandle::spawn`], but the task is also cancelled when
    /// `parent` is.
    pub fn spawn_child<F, Fut>(name: &'static str, parent: &CancellationToken, task: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::with_token(name, parent.child_token(), task)
    }

    fn with_token<F, Fut>(name: &'static str, token: CancellationToken, task: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task(token.clone()));
        debug!(task = name, "task spawned");
        Self {
            name,
            token,
            handle: Some(handle),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Returns `false` if the task was already cancelled.
    pub fn cancel(&mut self) -> bool {
        let Some(handle) = self.handle.take() else {
            return false;
        };
        self.token.cancel();
        handle.abort();
        debug!(task = self.name, "task cancelled");
        true
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
