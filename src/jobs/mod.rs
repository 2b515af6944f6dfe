//! Background ingestion: job store, bounded queue, worker pool.

pub mod queue;
pub mod store;
pub mod worker;

pub use queue::{job_queue, JobQueue, JobReceiver};
pub use store::{JobStore, JobUpdate, MemoryJobStore};
pub use worker::{IngestWorker, PlainTextExtractor, TextExtractor};
