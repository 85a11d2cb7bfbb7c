//! Runtime handle shared by response pipelines and the relocation worker

use std::sync::Arc;

use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};
use tokio::task::JoinHandle;

use crate::error::{ClientError, ClientResult};

/// Owned runtime that shuts down without blocking when dropped, so the last
/// clone may go away on any thread, including a runtime worker.
struct OwnedRuntime(Option<Runtime>);

impl Drop for OwnedRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

/// Cloneable handle onto a tokio runtime.
///
/// Inside a multi-thread runtime the ambient handle is reused; otherwise a
/// dedicated multi-thread runtime is created and kept alive by every clone.
/// A current-thread runtime is never reused: a caller blocking in
/// [`crate::Task::resume_and_wait`] would stall the only thread driving it.
#[derive(Clone)]
pub struct Executor {
    handle: Handle,
    _owned: Option<Arc<OwnedRuntime>>,
}

impl Executor {
    /// Use the ambient runtime if it is multi-threaded, otherwise build one
    pub fn current_or_owned(thread_name: &str) -> ClientResult<Self> {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                Ok(Self::from_handle(handle))
            }
            Ok(_) => {
                tracing::debug!(thread_name, "Ambient runtime is single-threaded, building an owned one");
                Self::owned(thread_name)
            }
            Err(_) => Self::owned(thread_name),
        }
    }

    /// True when this executor runs its own runtime
    pub fn is_owned(&self) -> bool {
        self._owned.is_some()
    }

    /// Build a dedicated multi-thread runtime
    pub fn owned(thread_name: &str) -> ClientResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name(thread_name)
            .enable_all()
            .build()
            .map_err(|e| ClientError::Runtime(format!("Failed to build runtime: {}", e)))?;
        Ok(Self {
            handle: runtime.handle().clone(),
            _owned: Some(Arc::new(OwnedRuntime(Some(runtime)))),
        })
    }

    pub fn from_handle(handle: Handle) -> Self {
        Self { handle, _owned: None }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn spawn_blocking<F, R>(&self, job: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.handle.spawn_blocking(job)
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("owned", &self._owned.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owned_executor_runs_blocking_jobs() {
        let executor = Executor::current_or_owned("webtask-test").unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        executor.spawn_blocking(move || tx.send(42).unwrap());
        assert_eq!(rx.recv().unwrap(), 42);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ambient_multi_thread_runtime_is_reused() {
        let executor = Executor::current_or_owned("webtask-test").unwrap();
        assert!(!executor.is_owned());
        let value = executor.spawn(async { 7 }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_current_thread_runtime_is_not_reused() {
        let executor = Executor::current_or_owned("webtask-test").unwrap();
        assert!(executor.is_owned());

        // Jobs progress even while this thread is blocked
        let (tx, rx) = std::sync::mpsc::channel();
        executor.spawn(async move { tx.send(7).unwrap() });
        assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap(), 7);
    }
}
