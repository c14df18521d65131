//! Bounded queue for fire-and-forget background work
//!
//! Presentation and bookkeeping work that must not block an interaction
//! reply (status-message edits, non-critical persistence) is submitted here
//! and executed one at a time by a worker task. The queue is bounded and
//! `submit` fails loudly when it is full; task failures are pushed onto a
//! failure channel the host drains and logs, never swallowed.

use std::future::Future;
use std::pin::Pin;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// A background task that did not complete
#[derive(Debug)]
pub struct TaskFailure {
    pub label: String,
    pub error: anyhow::Error,
}

type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

struct QueuedTask {
    label: String,
    fut: TaskFuture,
}

/// Handle for submitting background work.
pub struct BackgroundTasks {
    tx: mpsc::Sender<QueuedTask>,
}

impl BackgroundTasks {
    /// Spawn the worker. Returns the handle plus the failure receiver the
    /// host is expected to drain.
    pub fn new(capacity: usize) -> (Self, mpsc::UnboundedReceiver<TaskFailure>) {
        let (tx, rx) = mpsc::channel::<QueuedTask>(capacity);
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::worker(rx, failure_tx));
        (Self { tx }, failure_rx)
    }

    /// Enqueue a task. Fails immediately when the queue is full or the
    /// worker has exited; the caller decides whether to do the work inline.
    pub fn submit<F>(&self, label: &str, fut: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.tx
            .try_send(QueuedTask {
                label: label.to_string(),
                fut: Box::pin(fut),
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(task) => {
                    anyhow!("Background queue full, rejecting '{}'", task.label)
                }
                mpsc::error::TrySendError::Closed(task) => {
                    anyhow!("Background worker stopped, rejecting '{}'", task.label)
                }
            })
    }

    async fn worker(
        mut rx: mpsc::Receiver<QueuedTask>,
        failures: mpsc::UnboundedSender<TaskFailure>,
    ) {
        while let Some(task) = rx.recv().await {
            if let Err(error) = task.fut.await {
                error!("Background task '{}' failed: {:#}", task.label, error);
                let _ = failures.send(TaskFailure {
                    label: task.label,
                    error,
                });
            }
        }
        debug!("Background queue channel closed, worker exiting");
    }
}
