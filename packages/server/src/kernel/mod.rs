//! Kernel: infrastructure shared by every worker.
//!
//! Business logic stays in `domains/`; this layer provides the job
//! subsystem, the upstream mail integration, object-storage archival, and
//! the dependency container that wires them together.

pub mod archive;
pub mod deps;
pub mod jobs;
pub mod mail;

pub use deps::WorkerDeps;
