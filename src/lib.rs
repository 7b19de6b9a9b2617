pub mod config;
pub mod dashboard;
pub mod error;
pub mod graph;
pub mod model;
pub mod node;
pub mod protocol;
pub mod scheduler;
pub mod shutdown;
pub mod source_control;
pub mod stats;
pub mod store;
pub mod tls;
pub mod worker;

pub use error::{LooperError, Result};
