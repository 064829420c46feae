//! Pipeline module: the job queue, the stage engine and the workers that
//! connect them.
//!
//! The pipeline is responsible for:
//! - Admitting production jobs into a bounded, priority-aware queue
//! - Driving each job through the fixed stage order, trend check to upload
//! - Gating scripts on quality and routing weak ones through one rework
//! - Parking finished videos for human review without holding a worker
//! - Deferring uploads that would break a channel's daily quota

mod engine;
mod job_queue;
mod manager;
mod worker_pool;

pub use engine::{PipelineEngine, RunOutcome};
pub use job_queue::JobQueue;
pub use manager::{PipelineEvent, PipelineManager, PipelineStats};
pub use worker_pool::{WorkerPool, WorkerPoolConfig};
