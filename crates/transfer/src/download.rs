//! Download and reassembly pipeline.
//!
//! Fetches parts in sequence order and streams each one into the sink as
//! soon as it arrives. Remote parts are never modified, so a failed
//! download can simply be retried with the same record.

use std::sync::Arc;

use teledrive_session::{BackendError, SessionError};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::TransferError;
use crate::chunked::checksum_bytes;
use crate::engine::TransferEngine;
use crate::retry::run_with_retry;
use crate::types::{PartHandle, TransferDirection, TransferProgress, TransferRecord};

impl TransferEngine {
    /// Writes the file described by `record` into `sink`.
    ///
    /// Returns the number of bytes written. On failure the sink may hold a
    /// prefix of the file; discarding it is up to the caller.
    pub async fn download<W>(
        &self,
        record: &TransferRecord,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        if !record.is_complete() {
            return Err(TransferError::InvalidRecord(format!(
                "record is {}, expected complete",
                record.state
            )));
        }
        record.validate()?;

        let parts = record.ordered_parts();
        let progress = Arc::new(TransferProgress::new(
            record.id,
            &record.name,
            TransferDirection::Download,
            record.total_size,
            parts.len() as u32,
        ));
        self.tracker.track(Arc::clone(&progress));
        info!(transfer = %record.id, name = %record.name, parts = parts.len(), "download started");

        let outcome = self
            .download_parts(record, &parts, sink, &progress, cancel)
            .await
            .and_then(|written| {
                if written == record.total_size {
                    Ok(written)
                } else {
                    Err(TransferError::ReassemblyLength {
                        expected: record.total_size,
                        actual: written,
                    })
                }
            });

        match &outcome {
            Ok(written) => {
                progress.complete();
                info!(transfer = %record.id, bytes = written, "download complete");
            }
            Err(e) => {
                progress.fail(&e.to_string());
                warn!(transfer = %record.id, error = %e, "download failed");
            }
        }
        self.tracker.finish(&record.id);
        outcome
    }

    async fn download_parts<W>(
        &self,
        record: &TransferRecord,
        parts: &[&PartHandle],
        sink: &mut W,
        progress: &TransferProgress,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0u64;
        for part in parts {
            self.check_cancelled(cancel)?;

            let data = run_with_retry(&self.policy, "download", part.index(), cancel, || async {
                let data = self
                    .session
                    .download_part(part.remote_id(), self.policy.call_timeout)
                    .await?;
                verify_part(part, &data)?;
                Ok::<_, SessionError>(data)
            })
            .await?;

            sink.write_all(&data).await?;
            let len = data.len() as u64;
            written += len;
            progress.add_part(len);
            self.tracker.notify_progress(&record.id);
            debug!(transfer = %record.id, part = part.index(), bytes = len, "part downloaded");
        }
        sink.flush().await?;
        Ok(written)
    }
}

/// Checks fetched bytes against the checksum recorded at upload time.
///
/// A mismatch fails the attempt as transient, so the part is fetched again.
fn verify_part(part: &PartHandle, data: &[u8]) -> Result<(), SessionError> {
    if part.checksum().is_empty() || checksum_bytes(data) == part.checksum() {
        return Ok(());
    }
    Err(SessionError::Backend(BackendError::ChecksumMismatch {
        remote_id: part.remote_id().to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::TransferConfig;
    use crate::types::TransferState;
    use teledrive_session::memory::ALWAYS;
    use teledrive_session::{AuthState, BackendSession, MemoryBackend, SessionConfig};

    fn config() -> TransferConfig {
        TransferConfig {
            part_size_bytes: 10,
            max_retry_attempts: 3,
            backoff_base_millis: 100,
            backoff_max_millis: 1000,
            inter_part_delay_millis: 0,
            call_timeout_millis: 5000,
        }
    }

    fn engine(backend: &MemoryBackend) -> TransferEngine {
        let session = BackendSession::new(
            SessionConfig::direct_secret("secret"),
            Box::new(backend.clone()),
        );
        TransferEngine::new(session, config()).unwrap()
    }

    async fn uploaded(engine: &TransferEngine, data: &[u8]) -> TransferRecord {
        engine
            .upload(data, data.len() as u64, "f.bin", None, &CancellationToken::new())
            .await
            .unwrap()
    }

    #[test]
    fn verify_skips_empty_checksum() {
        let part = PartHandle::new("m", 0, 3, None, "");
        assert!(verify_part(&part, b"abc").is_ok());

        let part = PartHandle::new("m", 0, 3, None, checksum_bytes(b"abc"));
        assert!(verify_part(&part, b"abc").is_ok());
        assert!(verify_part(&part, b"abd").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reassembles_in_index_order() {
        let backend = MemoryBackend::new().with_secret("secret");
        let engine = engine(&backend);
        let data: Vec<u8> = (0..25).collect();
        let mut record = uploaded(&engine, &data).await;
        record.parts.reverse();

        let mut out: Vec<u8> = Vec::new();
        let written = engine
            .download(&record, &mut out, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(written, 25);
        assert_eq!(out, data);
    }

    #[tokio::test(start_paused = true)]
    async fn single_part_uses_one_fetch() {
        let backend = MemoryBackend::new().with_secret("secret");
        let engine = engine(&backend);
        let record = uploaded(&engine, b"tiny").await;

        let mut out: Vec<u8> = Vec::new();
        engine
            .download(&record, &mut out, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out, b"tiny");
        assert_eq!(backend.calls().fetch, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn corrupted_part_is_fetched_again() {
        let backend = MemoryBackend::new().with_secret("secret");
        let engine = engine(&backend);
        let data = [3u8; 20];
        let record = uploaded(&engine, &data).await;
        backend.corrupt_fetch(record.parts[1].remote_id(), 1);

        let mut out: Vec<u8> = Vec::new();
        engine
            .download(&record, &mut out, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out, data);
        assert_eq!(backend.calls().fetch, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_corruption_exhausts_retries() {
        let backend = MemoryBackend::new().with_secret("secret");
        let engine = engine(&backend);
        let record = uploaded(&engine, &[3u8; 20]).await;
        backend.corrupt_fetch(record.parts[0].remote_id(), ALWAYS);

        let err = engine
            .download(&record, &mut Vec::<u8>::new(), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            TransferError::RemotePart { index, source, .. } => {
                assert_eq!(index, 0);
                assert!(matches!(
                    source,
                    SessionError::Backend(BackendError::ChecksumMismatch { .. })
                ));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(backend.part_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn network_errors_are_retried() {
        let backend = MemoryBackend::new().with_secret("secret");
        let engine = engine(&backend);
        let record = uploaded(&engine, b"tiny").await;
        backend.fail_fetch(
            record.parts[0].remote_id(),
            BackendError::Network("reset".into()),
            2,
        );

        let mut out: Vec<u8> = Vec::new();
        engine
            .download(&record, &mut out, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out, b"tiny");
        assert_eq!(backend.calls().fetch, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_hint_is_honoured() {
        let backend = MemoryBackend::new().with_secret("secret");
        let engine = engine(&backend);
        let record = uploaded(&engine, b"tiny").await;
        backend.fail_fetch(
            record.parts[0].remote_id(),
            BackendError::RateLimited {
                retry_after: Some(Duration::from_secs(4)),
            },
            1,
        );

        let start = tokio::time::Instant::now();
        engine
            .download(&record, &mut Vec::<u8>::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(4));
        assert_eq!(backend.calls().fetch, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_timeouts_exhaust_retries() {
        let backend = MemoryBackend::new().with_secret("secret");
        let engine = engine(&backend);
        let record = uploaded(&engine, &[6u8; 20]).await;
        backend.fail_every_fetch(BackendError::Timeout, ALWAYS);

        let mut out: Vec<u8> = Vec::new();
        let err = engine
            .download(&record, &mut out, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            TransferError::RemotePart {
                index,
                attempts,
                source,
            } => {
                assert_eq!(index, 0);
                assert_eq!(attempts, 3);
                assert!(matches!(source, SessionError::Backend(BackendError::Timeout)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(out.is_empty());
        assert_eq!(backend.calls().fetch, 3);
        assert_eq!(backend.part_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn length_mismatch_detected() {
        let backend = MemoryBackend::new().with_secret("secret");
        let engine = engine(&backend);
        let record = uploaded(&engine, &[1u8; 15]).await;

        // Same handles without checksums, pointing at a shorter part.
        let mut forged = record.clone();
        let short = engine.upload(&b"xy"[..], 2, "s", None, &CancellationToken::new()).await.unwrap();
        forged.parts = vec![
            PartHandle::new(record.parts[0].remote_id(), 0, 10, None, ""),
            PartHandle::new(short.parts[0].remote_id(), 1, 5, None, ""),
        ];

        let mut out: Vec<u8> = Vec::new();
        let err = engine
            .download(&forged, &mut out, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TransferError::ReassemblyLength {
                expected: 15,
                actual: 12
            }
        ));
        let snap = engine.tracker().get(&forged.id).unwrap().snapshot();
        assert_eq!(snap.state, TransferState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_part_is_structural_and_keeps_the_rest() {
        let backend = MemoryBackend::new().with_secret("secret");
        let engine = engine(&backend);
        let record = uploaded(&engine, &[5u8; 30]).await;
        backend.remove_part(record.parts[1].remote_id());

        let mut out: Vec<u8> = Vec::new();
        let err = engine
            .download(&record, &mut out, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Structural(_)));
        assert_eq!(out.len(), 10);
        assert_eq!(backend.part_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn incomplete_record_refused() {
        let backend = MemoryBackend::new().with_secret("secret");
        let engine = engine(&backend);
        let mut record = uploaded(&engine, &[1u8; 12]).await;
        record.state = TransferState::Failed;

        let err = engine
            .download(&record, &mut Vec::<u8>::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidRecord(_)));
        assert_eq!(backend.calls().fetch, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn not_ready_session_fails_download() {
        let backend = MemoryBackend::new().with_secret("secret");
        let engine = engine(&backend);
        let record = uploaded(&engine, &[1u8; 12]).await;
        engine.session().logout().await.unwrap();

        let err = engine
            .download(&record, &mut Vec::<u8>::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::SessionNotReady {
                state: AuthState::Closed
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_download_leaves_parts() {
        let backend = MemoryBackend::new()
            .with_secret("secret")
            .with_latency(Duration::from_millis(100));
        let engine = engine(&backend);
        let record = uploaded(&engine, &[1u8; 30]).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.cancel();
        });

        let err = engine
            .download(&record, &mut Vec::<u8>::new(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        assert_eq!(backend.part_count(), 3);
    }
}
