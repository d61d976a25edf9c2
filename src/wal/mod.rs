//! Write-ahead log for partition op-logs.
//!
//! One append-only segment per partition. Owners and backups append every record
//! before applying it; a node replays its segments on start. Replay is idempotent
//! because every op carries the sequence it was produced at.
//!
//! Frame format of [`FileWal`] (little-endian):
//!
//! ```text
//! +----------+----------+-----------------+
//! |  CRC32   |  Length  |  JSON payload   |
//! | (4 bytes)| (4 bytes)|   (N bytes)     |
//! +----------+----------+-----------------+
//! ```
//!
//! The CRC covers length and payload. A frame that is cut short or fails its
//! checksum ends the segment: everything before it is replayed, the tail is dropped.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{GridError, GridResult};
use crate::partition::PartitionId;
use crate::storage::types::{PartitionOp, PartitionSnapshot};

const FRAME_HEADER_SIZE: usize = 8;
const FRAME_PAYLOAD_MAX: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalFrame {
    /// Full partition state; records after it apply on top.
    Snapshot(PartitionSnapshot),
    Record { seq: u64, op: PartitionOp },
}

/// What a segment holds, in append order.
#[derive(Debug, Clone, Default)]
pub struct WalReplay {
    pub snapshot: Option<PartitionSnapshot>,
    pub records: Vec<(u64, PartitionOp)>,
}

pub trait WriteAheadLog: Send + Sync {
    fn append(&self, partition: PartitionId, seq: u64, op: &PartitionOp) -> GridResult<()>;

    /// Replaces the segment with a single snapshot frame.
    fn reset(&self, partition: PartitionId, snapshot: &PartitionSnapshot) -> GridResult<()>;

    fn replay(&self, partition: PartitionId) -> GridResult<WalReplay>;

    fn truncate(&self, partition: PartitionId) -> GridResult<()>;

    /// Partitions with a segment.
    fn partitions(&self) -> GridResult<Vec<PartitionId>>;
}

fn collect(frames: Vec<WalFrame>) -> WalReplay {
    let mut replay = WalReplay::default();
    for frame in frames {
        match frame {
            WalFrame::Snapshot(snapshot) => {
                replay.records.clear();
                replay.snapshot = Some(snapshot);
            }
            WalFrame::Record { seq, op } => replay.records.push((seq, op)),
        }
    }
    replay
}

/// In-memory log, for tests and embedded clusters.
#[derive(Default)]
pub struct MemoryWal {
    segments: DashMap<PartitionId, Vec<WalFrame>>,
}

impl MemoryWal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WriteAheadLog for MemoryWal {
    fn append(&self, partition: PartitionId, seq: u64, op: &PartitionOp) -> GridResult<()> {
        self.segments
            .entry(partition)
            .or_default()
            .push(WalFrame::Record {
                seq,
                op: op.clone(),
            });
        Ok(())
    }

    fn reset(&self, partition: PartitionId, snapshot: &PartitionSnapshot) -> GridResult<()> {
        self.segments
            .insert(partition, vec![WalFrame::Snapshot(snapshot.clone())]);
        Ok(())
    }

    fn replay(&self, partition: PartitionId) -> GridResult<WalReplay> {
        let frames = self
            .segments
            .get(&partition)
            .map(|s| s.value().clone())
            .unwrap_or_default();
        Ok(collect(frames))
    }

    fn truncate(&self, partition: PartitionId) -> GridResult<()> {
        self.segments.remove(&partition);
        Ok(())
    }

    fn partitions(&self) -> GridResult<Vec<PartitionId>> {
        let mut partitions: Vec<PartitionId> = self.segments.iter().map(|e| *e.key()).collect();
        partitions.sort_unstable();
        Ok(partitions)
    }
}

/// One file per partition under `dir`.
pub struct FileWal {
    dir: PathBuf,
    files: DashMap<PartitionId, File>,
}

impl FileWal {
    pub fn open(dir: &Path) -> GridResult<Self> {
        std::fs::create_dir_all(dir)?;
        tracing::info!("Write-ahead log at {}", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            files: DashMap::new(),
        })
    }

    fn segment_path(&self, partition: PartitionId) -> PathBuf {
        self.dir.join(format!("partition-{:05}.wal", partition))
    }

    fn write_frame(&self, partition: PartitionId, frame: &WalFrame) -> GridResult<()> {
        let encoded = encode_frame(frame)?;
        let mut file = match self.files.get_mut(&partition) {
            Some(file) => file,
            None => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.segment_path(partition))?;
                self.files.entry(partition).or_insert(file)
            }
        };
        file.write_all(&encoded)?;
        file.flush()?;
        Ok(())
    }
}

fn encode_frame(frame: &WalFrame) -> GridResult<Vec<u8>> {
    let payload = serde_json::to_vec(frame)?;
    if payload.len() > FRAME_PAYLOAD_MAX as usize {
        return Err(GridError::Wal(format!(
            "frame of {} bytes exceeds {}",
            payload.len(),
            FRAME_PAYLOAD_MAX
        )));
    }
    let length = payload.len() as u32;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&length.to_le_bytes());
    hasher.update(&payload);
    let crc = hasher.finalize();

    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decodes frames until the end of `bytes` or the first damaged frame.
fn decode_frames(bytes: &[u8], segment: &Path) -> Vec<WalFrame> {
    let mut frames = Vec::new();
    let mut offset = 0usize;

    while offset < bytes.len() {
        if bytes.len() - offset < FRAME_HEADER_SIZE {
            tracing::warn!("{}: torn frame header at {}", segment.display(), offset);
            break;
        }
        let crc = u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]);
        let length = u32::from_le_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]);
        let start = offset + FRAME_HEADER_SIZE;
        let end = start + length as usize;
        if length > FRAME_PAYLOAD_MAX || end > bytes.len() {
            tracing::warn!("{}: torn frame at {}", segment.display(), offset);
            break;
        }
        let payload = &bytes[start..end];

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&length.to_le_bytes());
        hasher.update(payload);
        if hasher.finalize() != crc {
            tracing::warn!("{}: checksum mismatch at {}", segment.display(), offset);
            break;
        }
        match serde_json::from_slice::<WalFrame>(payload) {
            Ok(frame) => frames.push(frame),
            Err(e) => {
                tracing::warn!("{}: undecodable frame at {}: {}", segment.display(), offset, e);
                break;
            }
        }
        offset = end;
    }
    frames
}

impl WriteAheadLog for FileWal {
    fn append(&self, partition: PartitionId, seq: u64, op: &PartitionOp) -> GridResult<()> {
        self.write_frame(
            partition,
            &WalFrame::Record {
                seq,
                op: op.clone(),
            },
        )
    }

    fn reset(&self, partition: PartitionId, snapshot: &PartitionSnapshot) -> GridResult<()> {
        self.files.remove(&partition);
        let path = self.segment_path(partition);
        let tmp = path.with_extension("wal.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&encode_frame(&WalFrame::Snapshot(snapshot.clone()))?)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn replay(&self, partition: PartitionId) -> GridResult<WalReplay> {
        let path = self.segment_path(partition);
        let mut bytes = Vec::new();
        match File::open(&path) {
            Ok(mut file) => {
                file.read_to_end(&mut bytes)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(WalReplay::default());
            }
            Err(e) => return Err(e.into()),
        }
        Ok(collect(decode_frames(&bytes, &path)))
    }

    fn truncate(&self, partition: PartitionId) -> GridResult<()> {
        self.files.remove(&partition);
        match std::fs::remove_file(self.segment_path(partition)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn partitions(&self) -> GridResult<Vec<PartitionId>> {
        let mut partitions = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(id) = name
                .strip_prefix("partition-")
                .and_then(|rest| rest.strip_suffix(".wal"))
                .and_then(|id| id.parse::<PartitionId>().ok())
            {
                partitions.push(id);
            }
        }
        partitions.sort_unstable();
        Ok(partitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::container::PartitionContainer;
    use serde_json::json;

    fn put(key: &str, value: i64) -> PartitionOp {
        PartitionOp::MapPut {
            map: "m".to_string(),
            key: key.to_string(),
            value: json!(value),
            ttl_ms: None,
            created_at_ms: 0,
        }
    }

    #[test]
    fn test_file_wal_replays_in_append_order() {
        let dir = tempfile::tempdir().unwrap();
        let wal = FileWal::open(dir.path()).unwrap();
        wal.append(3, 1, &put("a", 1)).unwrap();
        wal.append(3, 2, &put("b", 2)).unwrap();
        wal.append(7, 1, &put("c", 3)).unwrap();

        let replay = wal.replay(3).unwrap();
        assert!(replay.snapshot.is_none());
        assert_eq!(replay.records.len(), 2);
        assert_eq!(replay.records[0].0, 1);
        assert_eq!(replay.records[1].1, put("b", 2));
        assert_eq!(wal.partitions().unwrap(), vec![3, 7]);
    }

    #[test]
    fn test_file_wal_survives_reopen_and_drops_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        {
            let wal = FileWal::open(dir.path()).unwrap();
            wal.append(0, 1, &put("a", 1)).unwrap();
            wal.append(0, 2, &put("b", 2)).unwrap();
        }
        // Simulate a crash in the middle of a write.
        let path = dir.path().join("partition-00000.wal");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xde, 0xad, 0xbe]).unwrap();
        drop(file);

        let wal = FileWal::open(dir.path()).unwrap();
        let replay = wal.replay(0).unwrap();
        assert_eq!(replay.records.len(), 2);
    }

    #[test]
    fn test_file_wal_reset_keeps_only_snapshot_and_later_records() {
        let dir = tempfile::tempdir().unwrap();
        let wal = FileWal::open(dir.path()).unwrap();
        wal.append(1, 1, &put("a", 1)).unwrap();

        let snapshot = PartitionSnapshot {
            partition: 1,
            seq: 10,
            container: PartitionContainer::default(),
        };
        wal.reset(1, &snapshot).unwrap();
        wal.append(1, 11, &put("z", 26)).unwrap();

        let replay = wal.replay(1).unwrap();
        assert_eq!(replay.snapshot.map(|s| s.seq), Some(10));
        assert_eq!(replay.records.len(), 1);
        assert_eq!(replay.records[0].0, 11);
    }

    #[test]
    fn test_truncate_removes_segment() {
        let wal = MemoryWal::new();
        wal.append(5, 1, &put("a", 1)).unwrap();
        wal.truncate(5).unwrap();
        assert!(wal.replay(5).unwrap().records.is_empty());
        assert!(wal.partitions().unwrap().is_empty());
    }
}
