use std::collections::BTreeSet;
use std::fmt;
use std::sync::RwLock;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::TransferError;
use crate::progress::SpeedCalculator;

/// Reference to one uploaded part. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartHandle {
    remote_id: String,
    index: u32,
    size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    caption: Option<String>,
    /// SHA-256 hex digest of the part (empty means no verification).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    checksum: String,
}

impl PartHandle {
    pub fn new(
        remote_id: impl Into<String>,
        index: u32,
        size: u64,
        caption: Option<String>,
        checksum: impl Into<String>,
    ) -> Self {
        Self {
            remote_id: remote_id.into(),
            index,
            size,
            caption,
            checksum: checksum.into(),
        }
    }

    /// Backend identifier used to fetch or delete the part.
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// 0-based sequence index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Byte length.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn caption(&self) -> Option<&str> {
        self.caption.as_deref()
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }
}

/// Terminal state of a transfer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferState {
    InProgress,
    Complete,
    Failed,
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProgress => f.write_str("in-progress"),
            Self::Complete => f.write_str("complete"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Durable description of one logical file stored as parts.
///
/// Produced by the upload pipeline and handed to the caller, who persists
/// it. The engine only reads it back to download or delete the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: Uuid,
    /// Logical file name.
    pub name: String,
    pub total_size: u64,
    /// Parts ordered by sequence index.
    pub parts: Vec<PartHandle>,
    /// `true` when the whole file fits in one part.
    pub single_part: bool,
    /// Percentage of bytes transferred, 0 to 100.
    pub progress: u8,
    pub state: TransferState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRecord {
    /// Starts an in-progress record for a file of `total_size` bytes.
    pub(crate) fn begin(name: impl Into<String>, total_size: u64, part_size: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            total_size,
            parts: Vec::new(),
            single_part: total_size <= part_size,
            progress: 0,
            state: TransferState::InProgress,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Appends an acknowledged part and raises the progress accordingly.
    pub(crate) fn push_part(&mut self, handle: PartHandle) {
        self.parts.push(handle);
        let pct = percent(self.uploaded_bytes(), self.total_size);
        self.progress = self.progress.max(pct);
        self.updated_at = Utc::now();
    }

    pub(crate) fn complete(&mut self) {
        self.state = TransferState::Complete;
        self.progress = 100;
        self.error = None;
        self.updated_at = Utc::now();
    }

    /// Marks the record failed. Parts are dropped: after rollback nothing
    /// in the record is reachable on the backend anymore.
    pub(crate) fn fail(&mut self, error: &str) {
        self.state = TransferState::Failed;
        self.parts.clear();
        self.error = Some(error.to_string());
        self.updated_at = Utc::now();
    }

    /// Sum of the part sizes.
    pub fn uploaded_bytes(&self) -> u64 {
        self.parts.iter().map(PartHandle::size).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.state == TransferState::Complete
    }

    /// Parts sorted by sequence index.
    pub fn ordered_parts(&self) -> Vec<&PartHandle> {
        let mut parts: Vec<&PartHandle> = self.parts.iter().collect();
        parts.sort_by_key(|p| p.index());
        parts
    }

    /// Checks the structural invariants of a complete record.
    ///
    /// Indices must be dense from 0, sizes must add up to `total_size`
    /// and `single_part` must agree with the part count.
    pub fn validate(&self) -> Result<(), TransferError> {
        let invalid = |msg: String| Err(TransferError::InvalidRecord(msg));

        if self.total_size == 0 {
            return invalid("total size is zero".into());
        }
        if self.parts.is_empty() {
            return invalid("record has no parts".into());
        }
        if self.progress > 100 {
            return invalid(format!("progress {} above 100", self.progress));
        }

        let indices: BTreeSet<u32> = self.parts.iter().map(PartHandle::index).collect();
        if indices.len() != self.parts.len() {
            return invalid("duplicate part index".into());
        }
        let expected_last = (self.parts.len() - 1) as u64;
        if indices.last().map(|i| u64::from(*i)) != Some(expected_last) {
            return invalid(format!(
                "part indices are not dense: expected 0..={expected_last}"
            ));
        }

        let sum = self.uploaded_bytes();
        if sum != self.total_size {
            return invalid(format!(
                "part sizes add up to {sum}, total size is {}",
                self.total_size
            ));
        }

        if self.single_part != (self.parts.len() == 1) {
            return invalid(format!(
                "single-part flag is {} with {} parts",
                self.single_part,
                self.parts.len()
            ));
        }

        if self.state == TransferState::Complete && self.progress != 100 {
            return invalid(format!("complete record at {}%", self.progress));
        }
        Ok(())
    }
}

/// Percentage of `done` over `total`, clamped to 100.
pub fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (u128::from(done) * 100 / u128::from(total)).min(100);
    pct as u8
}

/// Direction of a running transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Point-in-time view of a running transfer, for polling UIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub id: Uuid,
    pub name: String,
    pub direction: TransferDirection,
    pub state: TransferState,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub percent: u8,
    pub parts_done: u32,
    pub part_count: u32,
    pub bytes_per_second: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Live progress of one transfer (thread-safe).
///
/// Written by the pipeline that owns the transfer, read by anyone.
pub struct TransferProgress {
    inner: RwLock<ProgressInner>,
    speed: SpeedCalculator,
}

struct ProgressInner {
    id: Uuid,
    name: String,
    direction: TransferDirection,
    state: TransferState,
    total_bytes: u64,
    transferred_bytes: u64,
    parts_done: u32,
    part_count: u32,
    started_at: Instant,
    updated_at: Instant,
    completed_at: Option<Instant>,
    error: Option<String>,
}

impl TransferProgress {
    /// Creates an in-progress entry.
    pub fn new(
        id: Uuid,
        name: impl Into<String>,
        direction: TransferDirection,
        total_bytes: u64,
        part_count: u32,
    ) -> Self {
        let now = Instant::now();
        Self {
            inner: RwLock::new(ProgressInner {
                id,
                name: name.into(),
                direction,
                state: TransferState::InProgress,
                total_bytes,
                transferred_bytes: 0,
                parts_done: 0,
                part_count,
                started_at: now,
                updated_at: now,
                completed_at: None,
                error: None,
            }),
            speed: SpeedCalculator::new(None, None),
        }
    }

    /// Records one finished part of `bytes` bytes.
    pub fn add_part(&self, bytes: u64) {
        let mut s = self.inner.write().unwrap();
        s.transferred_bytes = (s.transferred_bytes + bytes).min(s.total_bytes);
        s.parts_done += 1;
        s.updated_at = Instant::now();
        drop(s);
        self.speed.add_sample(bytes);
    }

    /// Marks the transfer complete.
    pub fn complete(&self) {
        let mut s = self.inner.write().unwrap();
        s.state = TransferState::Complete;
        s.transferred_bytes = s.total_bytes;
        let now = Instant::now();
        s.completed_at = Some(now);
        s.updated_at = now;
    }

    /// Marks the transfer failed with an error message.
    pub fn fail(&self, err: &str) {
        let mut s = self.inner.write().unwrap();
        s.state = TransferState::Failed;
        s.error = Some(err.to_string());
        let now = Instant::now();
        s.completed_at = Some(now);
        s.updated_at = now;
    }

    /// Current progress.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let s = self.inner.read().unwrap();
        let percent = match s.state {
            TransferState::Complete => 100,
            _ => percent(s.transferred_bytes, s.total_bytes),
        };
        ProgressSnapshot {
            id: s.id,
            name: s.name.clone(),
            direction: s.direction,
            state: s.state,
            total_bytes: s.total_bytes,
            transferred_bytes: s.transferred_bytes,
            percent,
            parts_done: s.parts_done,
            part_count: s.part_count,
            bytes_per_second: self.speed.bytes_per_second(),
            error: s.error.clone(),
        }
    }

    /// Returns `true` while the transfer is running.
    pub fn is_active(&self) -> bool {
        let s = self.inner.read().unwrap();
        s.state == TransferState::InProgress
    }

    pub fn id(&self) -> Uuid {
        self.inner.read().unwrap().id
    }

    pub fn state(&self) -> TransferState {
        self.inner.read().unwrap().state
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.inner.read().unwrap().transferred_bytes
    }

    /// Time since the transfer started, up to its completion.
    pub fn elapsed(&self) -> std::time::Duration {
        let s = self.inner.read().unwrap();
        s.completed_at.unwrap_or_else(Instant::now) - s.started_at
    }

    /// Estimated time left, if any throughput was measured.
    pub fn eta(&self) -> Option<std::time::Duration> {
        let remaining = {
            let s = self.inner.read().unwrap();
            if s.state != TransferState::InProgress {
                return None;
            }
            s.total_bytes - s.transferred_bytes
        };
        self.speed.eta(remaining)
    }
}
