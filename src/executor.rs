//! Background task execution: one detached tokio task per
//! (story, trigger-kind) pair, tracked in a shared table so a second
//! trigger for the same key is a no-op and `Stop` can cancel the task in
//! flight.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What triggered a background task — distinguishes the stage-advance
/// task from the chat-refinement task so both can run concurrently
/// against the same story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Stage,
    Chat,
}

/// Unique key for the task table: a story can have at most one stage
/// task and one chat task in flight at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub story_id: Uuid,
    pub kind: TaskKind,
}

impl TaskKey {
    pub fn stage(story_id: Uuid) -> Self {
        TaskKey { story_id, kind: TaskKind::Stage }
    }
    pub fn chat(story_id: Uuid) -> Self {
        TaskKey { story_id, kind: TaskKind::Chat }
    }
}

struct TaskHandle {
    join: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Registers, tracks, and cancels background tasks. Cloneable — all
/// clones share the same underlying table.
#[derive(Clone)]
pub struct Executor {
    tasks: Arc<RwLock<HashMap<TaskKey, TaskHandle>>>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Executor { tasks: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Spawn `body` under `key` unless a task is already registered for
    /// it, in which case the trigger is silently ignored (idempotent
    /// re-trigger). `body` receives a [`CancellationToken`] it must poll
    /// cooperatively, and must itself never panic past task boundaries —
    /// callers are expected to catch every error into a published event
    /// rather than letting the task unwind.
    pub async fn spawn<F, Fut>(&self, key: TaskKey, body: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&key) {
            log::debug!("task already running for {key:?}, ignoring duplicate trigger");
            return;
        }
        let cancel = CancellationToken::new();
        let cancel_for_task = cancel.clone();
        let tasks_ref = self.tasks.clone();
        let join = tokio::spawn(async move {
            body(cancel_for_task).await;
            tasks_ref.write().await.remove(&key);
        });
        tasks.insert(key, TaskHandle { join, cancel });
    }

    /// Signal cancellation to the task registered under `key`, if any.
    /// The task is responsible for observing the token and exiting; this
    /// does not forcibly abort it so in-flight writes can finish
    /// consistently.
    pub async fn stop(&self, key: TaskKey) -> bool {
        if let Some(handle) = self.tasks.read().await.get(&key) {
            handle.cancel.cancel();
            true
        } else {
            false
        }
    }

    pub async fn is_running(&self, key: TaskKey) -> bool {
        self.tasks.read().await.contains_key(&key)
    }

    /// Abort every tracked task immediately, used on process shutdown.
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.write().await;
        for (_, handle) in tasks.drain() {
            handle.cancel.cancel();
            handle.join.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn duplicate_trigger_is_ignored() {
        let executor = Executor::new();
        let key = TaskKey::stage(Uuid::new_v4());
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let runs = runs.clone();
            executor
                .spawn(key, move |_cancel| async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    runs.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_cancels_a_cooperative_task() {
        let executor = Executor::new();
        let key = TaskKey::chat(Uuid::new_v4());
        let cancelled = Arc::new(AtomicUsize::new(0));
        let cancelled_for_task = cancelled.clone();

        executor
            .spawn(key, move |cancel| async move {
                cancel.cancelled().await;
                cancelled_for_task.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert!(executor.is_running(key).await);
        assert!(executor.stop(key).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert!(!executor.is_running(key).await);
    }

    #[tokio::test]
    async fn stop_on_unknown_key_returns_false() {
        let executor = Executor::new();
        assert!(!executor.stop(TaskKey::stage(Uuid::new_v4())).await);
    }

    #[tokio::test]
    async fn task_deregisters_itself_on_completion() {
        let executor = Executor::new();
        let key = TaskKey::stage(Uuid::new_v4());
        executor.spawn(key, |_cancel| async move {}).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!executor.is_running(key).await);
    }
}
