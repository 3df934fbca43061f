use teledrive_session::{AuthState, SessionError};

/// Errors produced by the transfer pipelines.
///
/// Transient backend failures never show up here directly: they are
/// retried and only surface as [`RemotePart`](Self::RemotePart) once the
/// retry budget is spent.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("session not ready (state: {state})")]
    SessionNotReady { state: AuthState },

    #[error("source ended after {actual} of {expected} bytes")]
    ShortRead { expected: u64, actual: u64 },

    #[error("part {index} failed after {attempts} attempt(s): {source}")]
    RemotePart {
        index: u32,
        attempts: u32,
        #[source]
        source: SessionError,
    },

    #[error("reassembled {actual} bytes, expected {expected}")]
    ReassemblyLength { expected: u64, actual: u64 },

    #[error("structural failure: {0}")]
    Structural(#[source] SessionError),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("source is empty")]
    EmptySource,

    #[error("invalid transfer record: {0}")]
    InvalidRecord(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Maps a session error that will not be retried.
    pub(crate) fn from_session(err: SessionError) -> Self {
        match err {
            SessionError::NotReady(state) => Self::SessionNotReady { state },
            other => Self::Structural(other),
        }
    }

    /// Sequence index of the failing part, if the error names one.
    pub fn part_index(&self) -> Option<u32> {
        match self {
            Self::RemotePart { index, .. } => Some(*index),
            _ => None,
        }
    }
}
