//! bleepdisk: one storage contract over S3, local disk and memory.
//!
//! Application code talks to a [`StorageDriver`] per configured disk and
//! performs file operations (write, read, existence and metadata checks,
//! URL generation, delete, copy, move) without depending on the backend's
//! own API.  Drivers are built from YAML configuration by a
//! [`DiskRegistry`].

pub mod config;
pub mod errors;
pub mod metrics;
pub mod storage;

pub use config::{Config, CredentialStrategy, DiskConfig, DriverKind, S3DiskConfig};
pub use errors::{StorageError, StorageResult};
pub use storage::{
    DiskRegistry, FileOptions, MetaResponse, ObjectBody, PutResponse, RenameResponse, StorageDriver,
};
