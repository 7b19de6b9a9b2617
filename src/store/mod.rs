//! String-keyed JSON persistence.
//!
//! [`JsonStore`] is the raw key/value seam; [`TestDatabase`] layers the
//! scheduler's key scheme and typed accessors on top of it.

pub mod database;
pub mod file;
pub mod memory;

use serde_json::Value;
use thiserror::Error;

pub use database::{StoredDefinitions, TestDatabase};
pub use file::FileJsonStore;
pub use memory::InMemoryJsonStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt value under '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

/// Calls are made while the scheduler lock is held, so implementations must not block for long.
pub trait JsonStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    fn delete(&self, key: &str) -> Result<bool, StoreError>;

    fn exists(&self, key: &str) -> Result<bool, StoreError>;
}
