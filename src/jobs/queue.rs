//! Bounded ingestion queue.
//!
//! The queue bounds in-flight ingestion work. A full queue rejects the
//! enqueue; the job row stays `pending` and the caller retries with
//! backoff. Workers share one receiver.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::types::JobId;

/// Sender half of the ingestion queue.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<JobId>,
}

/// Shared receiver half: each worker pulls the next job id.
#[derive(Clone)]
pub struct JobReceiver {
    rx: Arc<Mutex<mpsc::Receiver<JobId>>>,
}

/// Create a queue bounded at `capacity`.
pub fn job_queue(capacity: usize) -> (JobQueue, JobReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        JobQueue { tx },
        JobReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

impl JobQueue {
    /// Enqueue without waiting. `false` means the queue is full; the job
    /// stays pending and should be re-enqueued later.
    pub fn try_enqueue(&self, job_id: JobId) -> bool {
        self.tx.try_send(job_id).is_ok()
    }

    /// Enqueue, waiting for a slot. `false` means the queue is closed.
    pub async fn enqueue(&self, job_id: JobId) -> bool {
        self.tx.send(job_id).await.is_ok()
    }
}

impl JobReceiver {
    /// Next job id, or `None` once the queue is closed and drained.
    pub async fn next(&self) -> Option<JobId> {
        self.rx.lock().await.recv().await
    }
}
