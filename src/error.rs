use thiserror::Error;

use crate::model::{BranchId, CommitId, DefinitionError, ParseIdError};
use crate::protocol::ProtocolError;
use crate::source_control::SourceControlError;
use crate::store::StoreError;
use crate::tls::TlsError;

#[derive(Error, Debug)]
pub enum LooperError {
    #[error("Commit not found: {0}")]
    CommitNotFound(CommitId),

    #[error("Branch not found: {0}")]
    BranchNotFound(BranchId),

    #[error("Test not found: {0}")]
    TestNotFound(String),

    #[error("Invalid identifier: {0}")]
    InvalidId(#[from] ParseIdError),

    #[error("Test definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Source control error: {0}")]
    SourceControl(#[from] SourceControlError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LooperError>;
