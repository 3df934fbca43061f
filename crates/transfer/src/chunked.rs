use std::io::SeekFrom;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

use crate::TransferError;
use crate::config::DEFAULT_PART_SIZE;

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// PartSplitter
// ---------------------------------------------------------------------------

/// One part-sized slice of the source.
#[derive(Debug, Clone)]
pub struct Segment {
    /// 0-based sequence index.
    pub index: u32,
    /// Byte offset within the source.
    pub offset: u64,
    pub data: Vec<u8>,
    /// SHA-256 hex checksum of `data`.
    pub checksum: String,
}

impl Segment {
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Splits a source of known length into ordered segments of `part_size`
/// bytes, the last one holding the remainder.
///
/// Segments are read lazily; only the one being returned is buffered.
/// Bytes past the declared length are never read.
pub struct PartSplitter<R> {
    reader: R,
    part_size: u64,
    total_size: u64,
    offset: u64,
    next_index: u32,
}

impl<R: AsyncRead + Unpin> PartSplitter<R> {
    /// Wraps `reader`, which must yield at least `total_size` bytes.
    ///
    /// If `part_size` is 0, [`DEFAULT_PART_SIZE`] is used.
    pub fn new(reader: R, total_size: u64, part_size: u64) -> Self {
        let part_size = if part_size == 0 {
            DEFAULT_PART_SIZE
        } else {
            part_size
        };
        Self {
            reader,
            part_size,
            total_size,
            offset: 0,
            next_index: 0,
        }
    }

    /// Number of segments the source splits into.
    pub fn part_count(&self) -> u32 {
        let count = self.total_size.div_ceil(self.part_size);
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Returns `true` if the whole source fits in one part.
    pub fn is_single_part(&self) -> bool {
        self.total_size <= self.part_size
    }

    /// Reads the next segment. Returns `None` once `total_size` bytes
    /// have been produced.
    pub async fn next_segment(&mut self) -> Result<Option<Segment>, TransferError> {
        let remaining = self.remaining();
        if remaining == 0 {
            return Ok(None);
        }

        // Bounded by part_size, which config validation keeps addressable.
        let want = remaining.min(self.part_size) as usize;
        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(TransferError::ShortRead {
                    expected: self.total_size,
                    actual: self.offset + filled as u64,
                });
            }
            filled += n;
        }

        let segment = Segment {
            index: self.next_index,
            offset: self.offset,
            checksum: checksum_bytes(&buf),
            data: buf,
        };
        self.offset += want as u64;
        self.next_index += 1;
        Ok(Some(segment))
    }

    /// Current byte offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Declared source length in bytes.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// Bytes remaining to read.
    pub fn remaining(&self) -> u64 {
        self.total_size - self.offset
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: AsyncRead + AsyncSeek + Unpin> PartSplitter<R> {
    /// Restarts the sequence at part `index`.
    ///
    /// The built-in pipelines always read from the start. This is for
    /// callers driving a splitter themselves over a seekable source, for
    /// example to re-send one part of an existing record.
    pub async fn seek_to_part(&mut self, index: u32) -> Result<(), TransferError> {
        let offset = u64::from(index) * self.part_size;
        if offset > self.total_size {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("part {index} starts past the end of the source"),
            )));
        }
        self.reader.seek(SeekFrom::Start(offset)).await?;
        self.offset = offset;
        self.next_index = index;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn create_test_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    async fn collect<R: AsyncRead + Unpin>(splitter: &mut PartSplitter<R>) -> Vec<Segment> {
        let mut segments = Vec::new();
        while let Some(segment) = splitter.next_segment().await.unwrap() {
            segments.push(segment);
        }
        segments
    }

    #[test]
    fn checksum_bytes_deterministic() {
        let c1 = checksum_bytes(b"hello world");
        let c2 = checksum_bytes(b"hello world");
        assert_eq!(c1, c2);
        assert_eq!(c1.len(), 64); // SHA-256 = 64 hex chars.
    }

    #[test]
    fn checksum_bytes_different_data() {
        assert_ne!(checksum_bytes(b"hello"), checksum_bytes(b"world"));
    }

    #[tokio::test]
    async fn splits_with_remainder() {
        let data = b"AABBCCDDEE"; // 10 bytes.
        let mut splitter = PartSplitter::new(&data[..], 10, 4);
        assert_eq!(splitter.part_count(), 3);
        assert!(!splitter.is_single_part());

        let segments = collect(&mut splitter).await;
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].data, b"AABB");
        assert_eq!(segments[1].data, b"CCDD");
        assert_eq!(segments[2].data, b"EE");
        assert_eq!(segments[2].offset, 8);
        assert_eq!(
            segments.iter().map(|s| s.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(segments[1].checksum, checksum_bytes(b"CCDD"));
        assert_eq!(splitter.remaining(), 0);
    }

    #[tokio::test]
    async fn exact_multiple_has_full_last_part() {
        let data = [7u8; 20];
        let mut splitter = PartSplitter::new(&data[..], 20, 10);
        let segments = collect(&mut splitter).await;
        assert_eq!(segments.len(), 2);
        assert!(segments.iter().all(|s| s.len() == 10));
    }

    #[tokio::test]
    async fn small_source_is_single_part() {
        let data = b"12345";
        let mut splitter = PartSplitter::new(&data[..], 5, 10);
        assert!(splitter.is_single_part());
        assert_eq!(splitter.part_count(), 1);

        let segments = collect(&mut splitter).await;
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].data, b"12345");
    }

    #[tokio::test]
    async fn segments_concatenate_to_source() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        for part_size in [1u64, 7, 64, 999, 1000, 4096] {
            let mut splitter = PartSplitter::new(&data[..], 1000, part_size);
            let expected = 1000u64.div_ceil(part_size);
            let segments = collect(&mut splitter).await;

            assert_eq!(segments.len() as u64, expected, "part_size {part_size}");
            assert!(segments.iter().all(|s| s.len() <= part_size));
            let joined: Vec<u8> = segments.into_iter().flat_map(|s| s.data).collect();
            assert_eq!(joined, data);
        }
    }

    #[tokio::test]
    async fn short_source_reports_counts() {
        let data = b"only-twelve!";
        let mut splitter = PartSplitter::new(&data[..], 20, 8);

        let first = splitter.next_segment().await.unwrap().unwrap();
        assert_eq!(first.len(), 8);

        let err = splitter.next_segment().await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::ShortRead {
                expected: 20,
                actual: 12
            }
        ));
    }

    #[tokio::test]
    async fn bytes_past_declared_size_are_ignored() {
        let data = b"0123456789EXTRA";
        let mut splitter = PartSplitter::new(&data[..], 10, 4);
        let segments = collect(&mut splitter).await;
        let joined: Vec<u8> = segments.into_iter().flat_map(|s| s.data).collect();
        assert_eq!(joined, b"0123456789");
    }

    #[tokio::test]
    async fn seek_restarts_from_part() {
        let data = b"0123456789".to_vec();
        let mut splitter = PartSplitter::new(Cursor::new(data), 10, 4);
        collect(&mut splitter).await;

        splitter.seek_to_part(1).await.unwrap();
        assert_eq!(splitter.offset(), 4);
        let segments = collect(&mut splitter).await;
        assert_eq!(segments[0].index, 1);
        assert_eq!(segments[0].data, b"4567");
        assert_eq!(segments[1].data, b"89");

        assert!(splitter.seek_to_part(4).await.is_err());
    }

    #[tokio::test]
    async fn default_part_size_when_zero() {
        let splitter = PartSplitter::new(&b"x"[..], 1, 0);
        assert_eq!(splitter.part_size(), DEFAULT_PART_SIZE);
    }

    #[tokio::test]
    async fn reads_from_file() {
        let dir = TempDir::new().unwrap();
        let data = b"The quick brown fox jumps over the lazy dog";
        let path = create_test_file(dir.path(), "fox.txt", data);

        let file = tokio::fs::File::open(&path).await.unwrap();
        let size = file.metadata().await.unwrap().len();
        let mut splitter = PartSplitter::new(file, size, 10);
        let segments = collect(&mut splitter).await;

        assert_eq!(segments.len(), 5);
        let joined: Vec<u8> = segments.into_iter().flat_map(|s| s.data).collect();
        assert_eq!(&joined, data);
    }
}
