//! Core library for the Docket background pipeline.
//!
//! Ingests, analyzes, assigns, and archives email against legal matters.
//! The REST surface and UI live elsewhere; this crate is the persistent
//! job subsystem they call into: durable queue, typed workers, upstream
//! mail fetch, object-storage archival, maintenance, and monitoring.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod testing;

pub use config::Config;
