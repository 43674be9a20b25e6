use std::{io, path::PathBuf};

use thiserror::Error;

pub type TransportError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("request {url} failed with HTTP status {status}")]
    Status { url: String, status: u16 },

    #[error("request {url} failed")]
    Transport {
        url: String,
        #[source]
        source: TransportError,
    },

    #[error("{context}: {}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("segment {index} is missing at {}", path.display())]
    MissingSegment { index: u32, path: PathBuf },

    #[error("segment {index} has {actual} bytes, expected {expected}")]
    SegmentSize {
        index: u32,
        expected: u64,
        actual: u64,
    },

    #[error("unusable range response from {url}: {detail}")]
    InvalidRange { url: String, detail: String },

    #[error("invalid cache key {value:?}: {reason}")]
    InvalidKey { value: String, reason: &'static str },
}

impl CacheError {
    pub(crate) fn io(context: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            context,
            path: path.into(),
            source,
        }
    }

    /// True for failures raised by the remote side or the transport.
    #[must_use]
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Self::Status { .. } | Self::Transport { .. } | Self::InvalidRange { .. }
        )
    }

    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
