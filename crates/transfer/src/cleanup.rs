//! Best-effort deletion of a record's parts.

use tracing::{debug, info, warn};

use crate::engine::TransferEngine;
use crate::types::{PartHandle, TransferRecord};

impl TransferEngine {
    /// Deletes every part of `record` and returns how many were deleted.
    ///
    /// A part that cannot be deleted (already gone, backend error) is
    /// logged and skipped. Calling this twice is harmless; the second
    /// call simply deletes nothing.
    pub async fn delete_all(&self, record: &TransferRecord) -> usize {
        let failed = self.delete_parts(&record.parts).await;
        let deleted = record.parts.len() - failed.len();
        info!(
            transfer = %record.id,
            deleted,
            failed = failed.len(),
            "cleanup finished"
        );
        deleted
    }

    /// Deletes `parts` once each, returning those that could not be deleted.
    pub(crate) async fn delete_parts(&self, parts: &[PartHandle]) -> Vec<PartHandle> {
        let mut failed = Vec::new();
        for part in parts {
            let result = self
                .session
                .delete_part(part.remote_id(), self.policy.call_timeout)
                .await;
            match result {
                Ok(()) => debug!(part = part.index(), remote_id = part.remote_id(), "part deleted"),
                Err(e) => {
                    warn!(
                        part = part.index(),
                        remote_id = part.remote_id(),
                        error = %e,
                        "could not delete part"
                    );
                    failed.push(part.clone());
                }
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;
    use teledrive_session::memory::ALWAYS;
    use teledrive_session::{BackendError, BackendSession, MemoryBackend, SessionConfig};
    use tokio_util::sync::CancellationToken;

    fn engine(backend: &MemoryBackend) -> TransferEngine {
        let session = BackendSession::new(
            SessionConfig::direct_secret("secret"),
            Box::new(backend.clone()),
        );
        let config = TransferConfig {
            part_size_bytes: 10,
            inter_part_delay_millis: 0,
            ..Default::default()
        };
        TransferEngine::new(session, config).unwrap()
    }

    #[tokio::test]
    async fn deletes_every_part() {
        let backend = MemoryBackend::new().with_secret("secret");
        let engine = engine(&backend);
        let record = engine
            .upload(&[0u8; 35][..], 35, "f", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(backend.part_count(), 4);

        assert_eq!(engine.delete_all(&record).await, 4);
        assert_eq!(backend.part_count(), 0);
    }

    #[tokio::test]
    async fn second_call_deletes_nothing() {
        let backend = MemoryBackend::new().with_secret("secret");
        let engine = engine(&backend);
        let record = engine
            .upload(&[0u8; 20][..], 20, "f", None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(engine.delete_all(&record).await, 2);
        assert_eq!(engine.delete_all(&record).await, 0);
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_the_rest() {
        let backend = MemoryBackend::new().with_secret("secret");
        let engine = engine(&backend);
        let record = engine
            .upload(&[0u8; 30][..], 30, "f", None, &CancellationToken::new())
            .await
            .unwrap();
        backend.fail_delete(
            record.parts[0].remote_id(),
            BackendError::Server {
                code: 500,
                message: "internal".into(),
            },
            ALWAYS,
        );

        assert_eq!(engine.delete_all(&record).await, 2);
        assert_eq!(backend.part_count(), 1);
        assert!(backend.part(record.parts[0].remote_id()).is_some());
    }
}
