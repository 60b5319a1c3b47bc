use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why a supervised task did not complete successfully.
#[derive(Debug, Error)]
pub enum TaskError<E> {
    #[error("{0}")]
    Failed(E),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("task was aborted")]
    Aborted,
}

/// Completion record of one task.
#[derive(Debug)]
pub struct TaskExit<K, E> {
    pub key: K,
    pub result: Result<(), TaskError<E>>,
}

/// What ended [`TaskGroup::first_exit`].
#[derive(Debug)]
pub enum FirstExit<K, E> {
    /// A task finished, successfully or not.
    Task(TaskExit<K, E>),
    /// The stop token was cancelled while every task was still running.
    Cancelled,
}

/// Outcome of [`TaskGroup::drain`].
#[derive(Debug)]
pub struct Drained<K, E> {
    /// Tasks that finished before the deadline, in completion order.
    pub exits: Vec<TaskExit<K, E>>,
    /// Tasks still running when the deadline elapsed.
    pub pending: Vec<K>,
}

impl<K, E> Drained<K, E> {
    pub fn timed_out(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// A set of named tasks supervised as one unit.
///
/// The intended protocol is: [`spawn`](Self::spawn) every stage, wait for
/// [`first_exit`](Self::first_exit), ask the remaining stages to stop by
/// whatever means they offer, then [`drain`](Self::drain) with a deadline and
/// finally [`shutdown`](Self::shutdown) whatever is left.
pub struct TaskGroup<K, E> {
    tasks: JoinSet<Result<(), E>>,
    keys: HashMap<Id, K>,
}

impl<K, E> TaskGroup<K, E>
where
    K: Clone + fmt::Debug + Send + 'static,
    E: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            keys: HashMap::new(),
        }
    }

    /// Spawn `future` as the task identified by `key`.
    pub fn spawn<F>(&mut self, key: K, future: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        let handle = self.tasks.spawn(future);
        debug!(task = ?key, "Spawned supervised task");
        self.keys.insert(handle.id(), key);
    }

    /// Number of tasks that have not been reported yet.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Keys of the tasks that have not been reported yet.
    pub fn pending(&self) -> Vec<K> {
        self.keys.values().cloned().collect()
    }

    /// Report a task that has already finished, without waiting.
    pub fn try_next_exit(&mut self) -> Option<TaskExit<K, E>> {
        while let Some(joined) = self.tasks.try_join_next_with_id() {
            if let Some(exit) = self.settle(joined) {
                return Some(exit);
            }
        }
        None
    }

    /// Wait for the next task to finish. `None` once the group is empty.
    pub async fn next_exit(&mut self) -> Option<TaskExit<K, E>> {
        while let Some(joined) = self.tasks.join_next_with_id().await {
            if let Some(exit) = self.settle(joined) {
                return Some(exit);
            }
        }
        None
    }

    /// Wait until a task finishes or `stop` is cancelled, whichever comes first.
    ///
    /// An empty group only returns once `stop` is cancelled.
    pub async fn first_exit(&mut self, stop: &CancellationToken) -> FirstExit<K, E> {
        tokio::select! {
            biased;
            _ = stop.cancelled() => FirstExit::Cancelled,
            exit = self.next_exit() => match exit {
                Some(exit) => FirstExit::Task(exit),
                None => {
                    stop.cancelled().await;
                    FirstExit::Cancelled
                }
            },
        }
    }

    /// Collect finishing tasks until the group is empty or `deadline` elapses.
    ///
    /// Tasks still running at the deadline are left in the group and listed in
    /// [`Drained::pending`].
    pub async fn drain(&mut self, deadline: Duration) -> Drained<K, E> {
        let mut exits = Vec::new();
        let finished = tokio::time::timeout(deadline, async {
            while let Some(exit) = self.next_exit().await {
                exits.push(exit);
            }
        })
        .await;

        let pending = if finished.is_err() {
            let pending = self.pending();
            warn!(?pending, ?deadline, "Tasks still running after drain deadline");
            pending
        } else {
            Vec::new()
        };

        Drained { exits, pending }
    }

    /// Abort every remaining task and wait for them to unwind.
    pub async fn shutdown(&mut self) -> Vec<TaskExit<K, E>> {
        self.tasks.abort_all();
        let mut exits = Vec::new();
        while let Some(exit) = self.next_exit().await {
            exits.push(exit);
        }
        exits
    }

    fn settle(&mut self, joined: Result<(Id, Result<(), E>), JoinError>) -> Option<TaskExit<K, E>> {
        let (id, result) = match joined {
            Ok((id, result)) => (id, result.map_err(TaskError::Failed)),
            Err(err) => {
                let id = err.id();
                let result = if err.is_cancelled() {
                    Err(TaskError::Aborted)
                } else {
                    Err(TaskError::Panicked(panic_message(err)))
                };
                (id, result)
            }
        };

        let Some(key) = self.keys.remove(&id) else {
            debug!(?id, "Ignoring completion of an untracked task");
            return None;
        };
        Some(TaskExit { key, result })
    }
}

impl<K, E> Default for TaskGroup<K, E>
where
    K: Clone + fmt::Debug + Send + 'static,
    E: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => {
            if let Some(s) = payload.downcast_ref::<&'static str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "<non-string panic payload>".to_string()
            }
        }
        Err(err) => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Group = TaskGroup<&'static str, String>;

    #[tokio::test]
    async fn first_exit_reports_the_earliest_task() {
        let mut group = Group::new();
        group.spawn("slow", async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });
        group.spawn("fast", async { Err("boom".to_string()) });

        let stop = CancellationToken::new();
        match group.first_exit(&stop).await {
            FirstExit::Task(exit) => {
                assert_eq!(exit.key, "fast");
                match exit.result {
                    Err(TaskError::Failed(msg)) => assert_eq!(msg, "boom"),
                    other => panic!("expected failure, got {:?}", other),
                }
            }
            FirstExit::Cancelled => panic!("stop was never cancelled"),
        }
        assert_eq!(group.pending(), vec!["slow"]);

        let aborted = group.shutdown().await;
        assert_eq!(aborted.len(), 1);
        assert!(matches!(aborted[0].result, Err(TaskError::Aborted)));
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn first_exit_observes_cancellation() {
        let mut group = Group::new();
        group.spawn("forever", std::future::pending());

        let stop = CancellationToken::new();
        stop.cancel();
        assert!(matches!(group.first_exit(&stop).await, FirstExit::Cancelled));
        assert_eq!(group.len(), 1);
        group.shutdown().await;
    }

    #[tokio::test]
    async fn empty_group_waits_for_cancellation() {
        let mut group = Group::new();
        let stop = CancellationToken::new();

        let canceller = {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                stop.cancel();
            })
        };

        assert!(matches!(group.first_exit(&stop).await, FirstExit::Cancelled));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn drain_collects_finished_and_lists_pending() {
        let mut group = Group::new();
        group.spawn("quick", async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(())
        });
        group.spawn("stuck", std::future::pending());

        let drained = group.drain(Duration::from_millis(200)).await;
        assert_eq!(drained.exits.len(), 1);
        assert_eq!(drained.exits[0].key, "quick");
        assert!(drained.exits[0].result.is_ok());
        assert!(drained.timed_out());
        assert_eq!(drained.pending, vec!["stuck"]);

        group.shutdown().await;
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn drain_without_pending_tasks() {
        let mut group = Group::new();
        group.spawn("a", async { Ok(()) });
        group.spawn("b", async { Err("late failure".to_string()) });

        let drained = group.drain(Duration::from_secs(5)).await;
        assert!(!drained.timed_out());
        assert_eq!(drained.exits.len(), 2);
    }

    #[tokio::test]
    async fn panics_are_reported_with_their_key() {
        let mut group = Group::new();
        group.spawn("panicky", async {
            if true {
                panic!("stage exploded");
            }
            Ok(())
        });

        let exit = group.next_exit().await.unwrap();
        assert_eq!(exit.key, "panicky");
        match exit.result {
            Err(TaskError::Panicked(msg)) => assert_eq!(msg, "stage exploded"),
            other => panic!("expected panic, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn try_next_exit_does_not_block() {
        let mut group = Group::new();
        group.spawn("forever", std::future::pending());
        assert!(group.try_next_exit().is_none());

        group.spawn("done", async { Ok(()) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let exit = group.try_next_exit().unwrap();
        assert_eq!(exit.key, "done");
        group.shutdown().await;
    }
}
