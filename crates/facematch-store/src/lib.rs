//! facematch-store — persistence adapters.
//!
//! - [`registry`]: SQLite-backed face registry with an in-memory L2 search index.
//! - [`jobs`]: SQLite job queue with claim-by-conditional-update.
//! - [`objects`]: object storage over a local directory tree or an HTTP gateway.

pub mod jobs;
pub mod objects;
pub mod registry;

pub use jobs::{JobKind, ABANDONED_MESSAGE, EXPIRED_MESSAGE, JobQueueError, JobRecord, JobStatus, PurgeReport, SqliteJobQueue};
pub use objects::{open_object_store, FsObjectStore, HttpObjectStore, ObjectPath, ObjectStore, ObjectStoreError};
pub use registry::{FaceRecord, FaceRegistry, NewFace, Predicate, RecordPatch, RegistryError, SqliteRegistry};

use std::path::Path;

/// Create the parent directory of a database file if it does not exist yet.
pub(crate) fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}
