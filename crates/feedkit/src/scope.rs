//! Task arenas tied to a cancellation token.
//!
//! Every task the engine starts belongs to a [`TaskScope`]: one per
//! generation, with a child scope per window-serving pass. Shutting a scope
//! down cancels its token (and therefore every child scope's token) and
//! waits for all of its tasks to finish, so nothing outlives the scope that
//! spawned it.

use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// A set of tasks that share a cancellation token.
pub(crate) struct TaskScope {
    name: &'static str,
    token: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
    runtime: Handle,
}

impl TaskScope {
    /// Create a root scope on the current runtime.
    ///
    /// Panics outside a Tokio runtime, like `tokio::spawn`.
    pub(crate) fn root(name: &'static str, token: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            name,
            token,
            tasks: Mutex::new(JoinSet::new()),
            runtime: Handle::current(),
        })
    }

    /// Create a scope whose token is cancelled whenever this one is.
    pub(crate) fn child(&self, name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            token: self.token.child_token(),
            tasks: Mutex::new(JoinSet::new()),
            runtime: self.runtime.clone(),
        })
    }

    /// Spawn a task that stops at the first suspension point after the
    /// scope is cancelled. Spawning into a cancelled scope is a no-op.
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.token.is_cancelled() {
            trace!(scope = self.name, "spawn into cancelled scope ignored");
            return;
        }
        let token = self.token.clone();
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        // Reap finished tasks so fire-and-forget spawns don't accumulate.
        while tasks.try_join_next().is_some() {}
        tasks.spawn_on(
            async move {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {}
                    _ = task => {}
                }
            },
            &self.runtime,
        );
    }

    /// Cancel the scope and wait for every task in it to finish.
    pub(crate) async fn shutdown(&self) {
        self.token.cancel();
        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        while tasks.join_next().await.is_some() {}
        trace!(scope = self.name, "scope shut down");
    }

    pub(crate) fn downgrade(self: &Arc<Self>) -> WeakScope {
        WeakScope(Arc::downgrade(self))
    }
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        // JoinSet aborts its tasks on drop; cancel the token too so child
        // scopes held elsewhere observe the teardown.
        self.token.cancel();
    }
}

/// Non-owning handle used by callbacks that may outlive their scope.
#[derive(Clone)]
pub(crate) struct WeakScope(Weak<TaskScope>);

impl WeakScope {
    /// Spawn into the scope if it is still alive.
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some(scope) = self.0.upgrade() {
            scope.spawn(task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn shutdown_cancels_pending_tasks() {
        let scope = TaskScope::root("test", CancellationToken::new());
        let finished = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&finished);
        scope.spawn(async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            f.fetch_add(1, Ordering::SeqCst);
        });
        scope.shutdown().await;
        assert!(scope.token.is_cancelled());
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn child_is_cancelled_with_parent() {
        let root = TaskScope::root("root", CancellationToken::new());
        let child = root.child("child");
        root.shutdown().await;
        assert!(child.token.is_cancelled());
    }

    #[tokio::test]
    async fn spawn_after_shutdown_is_ignored() {
        let scope = TaskScope::root("test", CancellationToken::new());
        scope.shutdown().await;
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        scope.spawn(async move {
            r.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn weak_scope_spawns_while_alive() {
        let scope = TaskScope::root("test", CancellationToken::new());
        let weak = scope.downgrade();
        let (tx, rx) = tokio::sync::oneshot::channel();
        weak.spawn(async move {
            let _ = tx.send(());
        });
        rx.await.unwrap();
        drop(scope);
        // Dropped scope: nothing to spawn into.
        weak.spawn(async {});
    }
}
