//! Persisted data models.

mod blob;
mod block;
mod container;
mod service;

pub use blob::*;
pub use block::*;
pub use container::*;
pub use service::*;

use uuid::Uuid;

/// Returns a fresh opaque etag. Every entity mutation installs a new one.
pub fn new_etag() -> String {
    format!("\"0x{}\"", Uuid::new_v4().simple())
}
