//! Error types for elohim-blockservice

use cid::Cid;
use thiserror::Error;

/// Errors surfaced by the block service and its collaborators
#[derive(Error, Debug)]
pub enum BlockServiceError {
    /// CID built with a hash function on the deny-list
    #[error("Unsafe CID {cid}: {reason}")]
    Security { cid: Cid, reason: String },

    /// No backing store has the block
    #[error("Block not found: {0}")]
    NotFound(Cid),

    /// I/O failure against an external collaborator
    #[error("{collaborator} error: {message}")]
    Upstream {
        collaborator: &'static str,
        message: String,
    },

    /// Batch write where some blocks failed; the others stay persisted
    #[error("{} of the batch failed to store", .0.len())]
    Aggregate(Vec<(Cid, BlockServiceError)>),

    /// Caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
}

impl BlockServiceError {
    pub fn index(message: impl ToString) -> Self {
        Self::Upstream {
            collaborator: "LocalIndex",
            message: message.to_string(),
        }
    }

    pub fn remote(message: impl ToString) -> Self {
        Self::Upstream {
            collaborator: "RemoteStore",
            message: message.to_string(),
        }
    }

    pub fn exchange(message: impl ToString) -> Self {
        Self::Upstream {
            collaborator: "Exchange",
            message: message.to_string(),
        }
    }

    pub fn metering(message: impl ToString) -> Self {
        Self::Upstream {
            collaborator: "Metering",
            message: message.to_string(),
        }
    }

    /// True when the block is definitely absent rather than unreachable
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_security(&self) -> bool {
        matches!(self, Self::Security { .. })
    }
}

impl From<reqwest::Error> for BlockServiceError {
    fn from(e: reqwest::Error) -> Self {
        Self::remote(e)
    }
}

pub type Result<T> = std::result::Result<T, BlockServiceError>;
