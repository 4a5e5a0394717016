//! Object storage.
//!
//! The [`backend::ObjectBackend`] trait abstracts over where bytes
//! physically live: an S3 bucket, a local directory or process memory.
//! [`driver::StorageDriver`] layers the disk contract on top of any of them.

pub mod aws;
pub mod backend;
pub mod body;
pub mod driver;
pub mod local;
pub mod memory;
pub mod registry;
pub mod signing;

pub use body::ObjectBody;
pub use driver::{FileOptions, MetaResponse, PutResponse, RenameResponse, StorageDriver};
pub use registry::DiskRegistry;
