//! Durable storage for the address tree.
//!
//! The manager serializes the whole tree to a single value under
//! [`STORE_KEY`] after every mutation, and compares [`Storage::modification_time`]
//! with the host boot time on load.
use std::time::SystemTime;

use async_trait::async_trait;

mod memory;
mod sqlite;

pub use memory::{MemoryError, MemoryStore};
pub use sqlite::SqliteStore;

/// key the address tree is stored under
pub const STORE_KEY: &str = "IPAM";

#[async_trait]
pub trait Storage: Send + Sync + 'static {
    // send/sync/static required for async trait bounds
    type Error: std::error::Error + Send + Sync + 'static;

    /// the value stored at `key`, or `None` if it was never written
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, Self::Error>;
    /// replace the value stored at `key`
    async fn write(&self, key: &str, value: &[u8]) -> Result<(), Self::Error>;
    /// when the store was last written
    async fn modification_time(&self) -> Result<SystemTime, Self::Error>;
}
