//! The commit graph: commits with their run statistics, and the branches that
//! order them.

pub mod branch;
pub mod commit;
pub mod ordering;

pub use branch::{Branch, FAILURE_RATE_LEVELS};
pub use commit::{Commit, DefinitionsState, EXCLUDE_MARKER, MAX_BUILD_ATTEMPTS};
pub use ordering::order_commits;
