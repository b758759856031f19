//! Persistor - uniform object storage for document and history services
//!
//! One async contract ([`storage::Persistor`]) over:
//! - the local filesystem
//! - S3 and S3-compatible stores
//! - Google Cloud Storage
//! - a migration wrapper that reads through to an old backend while
//!   writing to a new one
//!
//! Every byte moving through a persistor is metered and MD5-hashed, and
//! every failure maps onto one error taxonomy ([`Error`]).

pub mod config;
pub mod error;
pub mod keys;
pub mod storage;
pub mod stream;
pub mod telemetry;

pub use error::{Error, ErrorKind, Result};
pub use storage::{create_persistor, Backend, Persistor};
