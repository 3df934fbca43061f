//! Chunked file transfer over a size-limited messaging backend.
//!
//! Files larger than one message are split into parts, posted in order
//! through a [`BackendSession`](teledrive_session::BackendSession) and
//! described by a [`TransferRecord`] the caller persists. The record is
//! all that is needed to download the file again or delete its parts.

mod chunked;
mod cleanup;
mod config;
mod download;
mod engine;
mod error;
mod progress;
mod retry;
mod types;
mod upload;

pub use chunked::{PartSplitter, Segment, checksum_bytes};
pub use config::{ConfigError, DEFAULT_PART_SIZE, TransferConfig};
pub use engine::TransferEngine;
pub use error::TransferError;
pub use progress::{DEFAULT_FINISHED_LIMIT, ProgressCallback, ProgressTracker, SpeedCalculator};
pub use retry::RetryPolicy;
pub use types::{
    PartHandle, ProgressSnapshot, TransferDirection, TransferProgress, TransferRecord,
    TransferState, percent,
};
pub use upload::UploadFailure;
