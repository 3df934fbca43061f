//! Transfer engine: the entry point for uploads, downloads and cleanup.
//!
//! The pipelines live in their own modules (`upload`, `download`,
//! `cleanup`) as further `impl TransferEngine` blocks.

use std::time::Duration;

use teledrive_session::BackendSession;
use tokio_util::sync::CancellationToken;

use crate::TransferError;
use crate::config::{ConfigError, TransferConfig};
use crate::progress::ProgressTracker;
use crate::retry::RetryPolicy;

/// Runs transfers against one shared [`BackendSession`].
///
/// Each transfer is one sequential task. Several transfers may run
/// concurrently on the same engine; the session serializes their remote
/// calls.
pub struct TransferEngine {
    pub(crate) session: BackendSession,
    pub(crate) config: TransferConfig,
    pub(crate) policy: RetryPolicy,
    pub(crate) tracker: ProgressTracker,
}

impl TransferEngine {
    /// Creates an engine after validating `config`.
    pub fn new(session: BackendSession, config: TransferConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let policy = RetryPolicy::from_config(&config);
        Ok(Self {
            session,
            config,
            policy,
            tracker: ProgressTracker::new(None),
        })
    }

    /// Publishes progress to an existing tracker instead of a private one.
    pub fn with_tracker(mut self, tracker: ProgressTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn session(&self) -> &BackendSession {
        &self.session
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Registry of running and recently finished transfers.
    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    pub(crate) fn check_cancelled(&self, cancel: &CancellationToken) -> Result<(), TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        Ok(())
    }

    /// Cooperative throttle between two parts.
    pub(crate) async fn pause_between_parts(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let Some(delay) = self.config.inter_part_delay() else {
            return Ok(());
        };
        pause(delay, cancel).await
    }
}

async fn pause(delay: Duration, cancel: &CancellationToken) -> Result<(), TransferError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
