//! Upload pipeline.
//!
//! Splits the source, posts every part in order with retries and records
//! the acknowledged handles. Any failure rolls back the parts already
//! posted, so a failed upload leaves nothing reachable behind.

use std::sync::Arc;

use teledrive_session::OutgoingPart;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::TransferError;
use crate::chunked::PartSplitter;
use crate::engine::TransferEngine;
use crate::retry::run_with_retry;
use crate::types::{PartHandle, TransferDirection, TransferProgress, TransferRecord};

/// A failed upload, after rollback.
#[derive(Debug, thiserror::Error)]
#[error("upload failed: {error}")]
pub struct UploadFailure {
    /// The error that stopped the upload.
    #[source]
    pub error: TransferError,
    /// The record in its `failed` state, with no parts.
    pub record: TransferRecord,
    /// Parts deleted during rollback.
    pub rolled_back: usize,
    /// Parts that could not be deleted and remain on the backend.
    pub orphaned: Vec<PartHandle>,
}

impl TransferEngine {
    /// Uploads `total_size` bytes from `source` as the logical file `name`.
    ///
    /// When `label` is set every part carries the caption
    /// `"Part {i}/{n} of {label}"`. Uploading the same source twice yields
    /// two independent records.
    pub async fn upload<R>(
        &self,
        source: R,
        total_size: u64,
        name: &str,
        label: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<TransferRecord, UploadFailure>
    where
        R: AsyncRead + Unpin,
    {
        let mut record = TransferRecord::begin(name, total_size, self.config.part_size_bytes);
        if total_size == 0 {
            let error = TransferError::EmptySource;
            record.fail(&error.to_string());
            return Err(UploadFailure {
                error,
                record,
                rolled_back: 0,
                orphaned: Vec::new(),
            });
        }

        let mut splitter = PartSplitter::new(source, total_size, self.config.part_size_bytes);
        let part_count = splitter.part_count();
        let progress = Arc::new(TransferProgress::new(
            record.id,
            name,
            TransferDirection::Upload,
            total_size,
            part_count,
        ));
        self.tracker.track(Arc::clone(&progress));
        info!(transfer = %record.id, name, total_size, parts = part_count, "upload started");

        let outcome = self
            .upload_parts(&mut splitter, &mut record, &progress, label, cancel)
            .await;

        match outcome {
            Ok(()) => {
                record.complete();
                progress.complete();
                self.tracker.finish(&record.id);
                info!(transfer = %record.id, parts = record.parts.len(), "upload complete");
                Ok(record)
            }
            Err(error) => {
                let uploaded = std::mem::take(&mut record.parts);
                warn!(
                    transfer = %record.id,
                    error = %error,
                    uploaded = uploaded.len(),
                    "upload failed, rolling back"
                );

                let orphaned = self.delete_parts(&uploaded).await;
                let rolled_back = uploaded.len() - orphaned.len();
                if !orphaned.is_empty() {
                    warn!(
                        transfer = %record.id,
                        orphaned = orphaned.len(),
                        "rollback left parts on the backend"
                    );
                }

                let message = error.to_string();
                record.fail(&message);
                progress.fail(&message);
                self.tracker.finish(&record.id);
                Err(UploadFailure {
                    error,
                    record,
                    rolled_back,
                    orphaned,
                })
            }
        }
    }

    async fn upload_parts<R>(
        &self,
        splitter: &mut PartSplitter<R>,
        record: &mut TransferRecord,
        progress: &TransferProgress,
        label: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let part_count = splitter.part_count();
        let multipart = !splitter.is_single_part();

        loop {
            self.check_cancelled(cancel)?;
            let Some(segment) = splitter.next_segment().await? else {
                break;
            };
            if segment.index > 0 {
                self.pause_between_parts(cancel).await?;
            }

            let index = segment.index;
            let size = segment.len();
            let caption = label.map(|l| format!("Part {}/{} of {}", index + 1, part_count, l));
            let file_name = part_file_name(&record.name, index, multipart);
            let data = segment.data;

            let remote = run_with_retry(&self.policy, "upload", index, cancel, || {
                self.session.upload_part(
                    OutgoingPart {
                        index,
                        file_name: file_name.clone(),
                        caption: caption.clone(),
                        data: data.clone(),
                    },
                    self.policy.call_timeout,
                )
            })
            .await?;

            if remote.size != size {
                warn!(
                    transfer = %record.id,
                    part = index,
                    sent = size,
                    stored = remote.size,
                    "backend reports a different part size"
                );
            }

            record.push_part(PartHandle::new(
                remote.remote_id,
                index,
                size,
                caption,
                segment.checksum,
            ));
            progress.add_part(size);
            self.tracker.notify_progress(&record.id);
            debug!(
                transfer = %record.id,
                part = index,
                parts = part_count,
                progress = record.progress,
                "part uploaded"
            );
        }
        Ok(())
    }
}

/// File name a part is posted under.
fn part_file_name(name: &str, index: u32, multipart: bool) -> String {
    if multipart {
        format!("{name}.part{:03}", index + 1)
    } else {
        name.to_string()
    }
}
