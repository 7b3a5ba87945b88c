//! Object-storage archival of canonical emails.
//!
//! - [`object_store`] - storage contract plus memory/filesystem backends
//! - [`paths`] - deterministic key layout and sanitization
//! - [`archiver`] - the write/read/delete/stats surface
//! - [`types`] - persisted document shapes

pub mod archiver;
pub mod object_store;
pub mod paths;
pub mod types;

pub use archiver::BlobArchiver;
pub use object_store::{LocalObjectStore, MemoryObjectStore, ObjectInfo, ObjectStore, StorageError};
pub use types::{
    ArchivedAttachment, ArchivedEmailMetadata, CaseArchiveStats, RetrievedAttachment,
    RetrievedEmail, StorageOutcome, STORAGE_VERSION,
};
