//! Persistent background job subsystem.
//!
//! The store owns job rows and every state transition; the queue is the
//! enqueue/claim policy layer; the pool runs dispatcher loops; maintenance
//! and the monitor observe from their own timers.
//!
//! ```text
//! API handler ─► JobQueue.enqueue ─► JobStore (row written)
//!
//! WorkerPool
//!     ├─► JobQueue.claim(worker_id, types)
//!     ├─► JobRegistry.execute(job, ctx)   (handlers in domains/)
//!     └─► complete / fail via JobStore
//!
//! Maintenance ─► cleanup + stalled-reaper sweeps
//! Monitor     ─► health scoring, alerts, auto-retry
//! ```

pub mod events;
pub mod job;
pub mod maintenance;
pub mod memory_store;
pub mod monitor;
pub mod pool;
pub mod postgres_store;
pub mod queue;
pub mod registry;
pub mod store;

pub use events::{JobEvent, JobEventHub};
pub use job::{
    Job, JobFilter, JobMetrics, JobPriority, JobProgress, JobResult, JobSort, JobStats, JobStatus,
    JobType, SortDirection,
};
pub use maintenance::{CleanupSweepReport, Maintenance};
pub use memory_store::MemoryJobStore;
pub use monitor::{Alert, AlertRing, AlertSeverity, HealthReport, Monitor};
pub use pool::{
    run_claimed_job, JobOutcome, PoolHealthSnapshot, PoolState, WorkerDescriptor, WorkerPool,
    WorkerReport, WorkerStatus,
};
pub use postgres_store::PostgresJobStore;
pub use queue::{
    EnqueueDerived, EnqueueOptions, EnqueueReceipt, JobPayload, JobQueue, QueueDefaults,
    SchemaRegistry,
};
pub use registry::{JobContext, JobRegistry, ProgressSink, SharedJobRegistry};
pub use store::{BulkAction, BulkOutcome, FailOutcome, JobStore};
