//! Per-key serialized task executor.
//!
//! Outbound work on a dialog is funneled through this executor keyed by the
//! dialog's Call-ID: tasks for the same key run one at a time in submission
//! order on a worker owned by that key, tasks for different keys run in
//! parallel. This ordering guarantee replaces dialog-wide locks: a second
//! re-INVITE submitted behind an in-flight one simply waits in the queue.
//!
//! `submit_first` head-inserts a task; the ACK for a 2xx uses it to jump
//! ahead of ordinary queued sends while still staying behind whatever is
//! currently executing.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::trace;

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct KeyQueue {
    tasks: VecDeque<Task>,
    running: bool,
}

struct ExecutorInner {
    queues: Mutex<HashMap<String, KeyQueue>>,
    cancel_token: CancellationToken,
}

#[derive(Clone)]
pub struct KeyedExecutor {
    inner: Arc<ExecutorInner>,
}

enum Position {
    First,
    Last,
}

impl KeyedExecutor {
    pub fn new(cancel_token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                queues: Mutex::new(HashMap::new()),
                cancel_token,
            }),
        }
    }

    /// Queue a task at the tail of the key's queue.
    pub fn submit_last<F>(&self, key: &str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.submit(key, Box::pin(task), Position::Last)
    }

    /// Queue a task at the head of the key's queue.
    pub fn submit_first<F>(&self, key: &str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.submit(key, Box::pin(task), Position::First)
    }

    /// Drop every queued (not yet started) task for a key.
    pub fn cancel(&self, key: &str) {
        if let Some(queue) = self.inner.queues.lock().unwrap().get_mut(key) {
            queue.tasks.clear();
        }
    }

    pub fn queued(&self, key: &str) -> usize {
        self.inner
            .queues
            .lock()
            .unwrap()
            .get(key)
            .map(|q| q.tasks.len())
            .unwrap_or(0)
    }

    fn submit(&self, key: &str, task: Task, position: Position) {
        let spawn_worker = {
            let mut queues = self.inner.queues.lock().unwrap();
            let queue = queues.entry(key.to_string()).or_insert_with(|| KeyQueue {
                tasks: VecDeque::new(),
                running: false,
            });
            match position {
                Position::First => queue.tasks.push_front(task),
                Position::Last => queue.tasks.push_back(task),
            }
            if queue.running {
                false
            } else {
                queue.running = true;
                true
            }
        };

        if spawn_worker {
            let inner = self.inner.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                trace!(key, "executor worker started");
                loop {
                    let next = {
                        let mut queues = inner.queues.lock().unwrap();
                        match queues.get_mut(&key) {
                            Some(queue) => match queue.tasks.pop_front() {
                                Some(task) => Some(task),
                                None => {
                                    queue.running = false;
                                    queues.remove(&key);
                                    None
                                }
                            },
                            None => None,
                        }
                    };
                    let Some(task) = next else { break };
                    if inner.cancel_token.is_cancelled() {
                        break;
                    }
                    task.await;
                }
                trace!(key, "executor worker drained");
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn same_key_runs_in_submission_order() {
        let executor = KeyedExecutor::new(CancellationToken::new());
        let (tx, mut rx) = unbounded_channel();
        for i in 0..5u32 {
            let tx = tx.clone();
            executor.submit_last("dlg-1", async move {
                // stagger to catch reordering bugs
                tokio::time::sleep(Duration::from_millis(5)).await;
                tx.send(i).unwrap();
            });
        }
        drop(tx);
        let mut seen = vec![];
        while let Some(i) = rx.recv().await {
            seen.push(i);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn head_insert_jumps_queued_tasks() {
        let executor = KeyedExecutor::new(CancellationToken::new());
        let (tx, mut rx) = unbounded_channel();

        let blocker = tx.clone();
        executor.submit_last("dlg-1", async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            blocker.send("running").unwrap();
        });
        // both queued while the first task sleeps
        let tail = tx.clone();
        executor.submit_last("dlg-1", async move {
            tail.send("tail").unwrap();
        });
        let ack = tx.clone();
        executor.submit_first("dlg-1", async move {
            ack.send("ack").unwrap();
        });
        drop(tx);

        let mut seen = vec![];
        while let Some(s) = rx.recv().await {
            seen.push(s);
        }
        assert_eq!(seen, vec!["running", "ack", "tail"]);
    }

    #[tokio::test]
    async fn different_keys_run_concurrently() {
        let executor = KeyedExecutor::new(CancellationToken::new());
        let (tx, mut rx) = unbounded_channel();

        let slow = tx.clone();
        executor.submit_last("slow", async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            slow.send("slow").unwrap();
        });
        let fast = tx.clone();
        executor.submit_last("fast", async move {
            fast.send("fast").unwrap();
        });
        drop(tx);

        assert_eq!(rx.recv().await, Some("fast"));
        assert_eq!(rx.recv().await, Some("slow"));
    }
}
