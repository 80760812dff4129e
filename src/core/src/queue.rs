//! Dispatch queue: a serial execution context on a dedicated worker thread.
//!
//! Every VM owns one. Tasks run one at a time in submission order, which is
//! what the hypervisor requires of all mutation on a single VM instance.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Queue identifier
pub type QueueId = u64;

type Task = Box<dyn FnOnce() + Send + 'static>;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_QUEUE: Cell<Option<QueueId>> = const { Cell::new(None) };
}

struct QueueState {
    id: QueueId,
    label: String,
    sender: mpsc::UnboundedSender<Task>,
    submitted: AtomicU64,
    completed: Arc<AtomicU64>,
}

/// Serial dispatch queue
///
/// Cloning yields another reference to the same queue. The worker thread
/// exits once every clone is dropped and the backlog has drained.
#[derive(Clone)]
pub struct DispatchQueue {
    state: Arc<QueueState>,
}

impl DispatchQueue {
    /// Spawn the worker thread for a new queue.
    pub fn new(label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();
        let completed = Arc::new(AtomicU64::new(0));
        let worker_completed = Arc::clone(&completed);
        let worker_label = label.clone();

        std::thread::Builder::new()
            .name(label.clone())
            .spawn(move || {
                CURRENT_QUEUE.with(|current| current.set(Some(id)));
                tracing::trace!(queue = %worker_label, "dispatch queue started");
                while let Some(task) = receiver.blocking_recv() {
                    if catch_unwind(AssertUnwindSafe(task)).is_err() {
                        tracing::error!(queue = %worker_label, "task panicked on dispatch queue");
                    }
                    worker_completed.fetch_add(1, Ordering::Release);
                }
                tracing::trace!(queue = %worker_label, "dispatch queue drained");
            })?;

        Ok(Self {
            state: Arc::new(QueueState {
                id,
                label,
                sender,
                submitted: AtomicU64::new(0),
                completed,
            }),
        })
    }

    pub fn id(&self) -> QueueId {
        self.state.id
    }

    pub fn label(&self) -> &str {
        &self.state.label
    }

    /// Whether the calling thread is this queue's worker.
    pub fn is_current(&self) -> bool {
        CURRENT_QUEUE.with(|current| current.get() == Some(self.state.id))
    }

    /// Enqueue a task; it runs after everything submitted before it.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        self.state
            .sender
            .send(Box::new(task))
            .map_err(|_| BridgeError::failed(format!("dispatch queue {} is closed", self.label())))?;
        self.state.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Enqueue a task and receive its return value asynchronously.
    pub fn submit_with_result<T>(
        &self,
        task: impl FnOnce() -> T + Send + 'static,
    ) -> Result<oneshot::Receiver<T>>
    where
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(move || {
            let _ = tx.send(task());
        })?;
        Ok(rx)
    }

    /// Run a task on the queue and block until it returns.
    ///
    /// Runs inline when already on this queue, so nested calls from a task
    /// cannot deadlock.
    pub fn sync<T>(&self, task: impl FnOnce() -> T + Send + 'static) -> Result<T>
    where
        T: Send + 'static,
    {
        if self.is_current() {
            return Ok(task());
        }
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        self.submit(move || {
            let _ = tx.send(task());
        })?;
        rx.recv()
            .map_err(|_| BridgeError::failed(format!("task on {} did not complete", self.label())))
    }

    /// Queue status
    pub fn status(&self) -> QueueStatus {
        let submitted = self.state.submitted.load(Ordering::Relaxed);
        let completed = self.state.completed.load(Ordering::Acquire);
        QueueStatus {
            label: self.state.label.clone(),
            submitted,
            completed,
            pending: submitted.saturating_sub(completed),
        }
    }
}

impl std::fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("id", &self.state.id)
            .field("label", &self.state.label)
            .finish()
    }
}

/// Queue status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub label: String,
    pub submitted: u64,
    pub completed: u64,
    pub pending: u64,
}
