use std::io;

use thiserror::Error;

use crate::tig::TigId;

pub type Result<T> = std::result::Result<T, TigStoreError>;

#[derive(Debug, Error)]
pub enum TigStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("I/O error at version {version} offset {offset}: {source}")]
    IoAt {
        version: u32,
        offset: u64,
        source: io::Error,
    },
    #[error("corrupt store: {0}")]
    CorruptStore(String),
    #[error("corrupt payload for tig {id}: {reason}")]
    CorruptPayload { id: TigId, reason: &'static str },
    #[error("tig {0} is deleted")]
    TigDeleted(TigId),
    #[error("store version overflow: cannot advance past {0}")]
    VersionOverflow(u32),
    #[error("data file for version {version} exceeds the addressable offset range")]
    OffsetOverflow { version: u32 },
    #[error("invalid mode: {0}")]
    InvalidMode(&'static str),
}

impl TigStoreError {
    /// Exit status for callers that wrap the store in a command-line tool.
    pub fn exit_code(&self) -> i32 {
        match self {
            TigStoreError::CorruptStore(_) | TigStoreError::CorruptPayload { .. } => 2,
            TigStoreError::VersionOverflow(_) => 3,
            TigStoreError::Io(_) | TigStoreError::IoAt { .. } | TigStoreError::OffsetOverflow { .. } => 4,
            TigStoreError::TigDeleted(_) | TigStoreError::InvalidMode(_) => 1,
        }
    }
}
