//! Durable store of positioned derived artifacts for one timeline.
//!
//! The store is an append-only log of `Created`/`Retired` events with a
//! derived in-memory index of current artifact state. Retirement never
//! destroys history in place, so `snapshot_as_of` stays answerable for any
//! position at or after the store's horizon; compaction is what forgets,
//! raising the horizon.

use crate::error::{Result, StoreError};
use crate::types::{DerivedArtifact, Lsn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the artifact log file.
const ARTIFACT_LOG_MAGIC: &[u8; 4] = b"ARL\0";

/// Current artifact log format version.
const ARTIFACT_LOG_VERSION: u8 = 1;

/// Header size: magic + version + horizon.
const HEADER_SIZE: u64 = 4 + 1 + 8;

/// Upper bound on a single encoded event. A length prefix above this is
/// corruption, not a real frame, and must not drive an allocation.
const MAX_EVENT_SIZE: usize = 16 * 1024 * 1024;

/// A single event in the artifact log.
#[derive(Clone, Debug, Serialize, Deserialize)]
enum ArtifactEvent {
    Created {
        id: String,
        lsn: Lsn,
        payload: Vec<u8>,
    },
    Retired {
        id: String,
        lsn: Lsn,
    },
}

/// Result of compacting retired-artifact history.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompactionStats {
    /// Artifacts still present after compaction.
    pub kept: usize,
    /// Retired artifacts dropped from history.
    pub dropped: usize,
    /// The store's horizon after compaction.
    pub new_horizon: Lsn,
}

struct StoreInner {
    writer: BufWriter<File>,
    /// Incarnation history per artifact id, derived from the event log.
    /// The last element is the current incarnation; earlier ones are
    /// retired but still answer `snapshot_as_of` for past positions.
    index: HashMap<String, Vec<DerivedArtifact>>,
    /// Oldest position at which `snapshot_as_of` is answerable.
    horizon: Lsn,
    /// Highest event position seen (used for head recovery on open).
    max_lsn: Lsn,
}

/// Derived-artifact store for a single timeline.
pub struct ArtifactStore {
    path: PathBuf,
    inner: Mutex<StoreInner>,
}

impl ArtifactStore {
    /// Create a fresh, empty store with the given horizon.
    pub fn create(path: impl AsRef<Path>, horizon: Lsn) -> Result<Self> {
        Self::create_seeded(path, horizon, &[])
    }

    /// Create a store seeded with a fork snapshot.
    ///
    /// Each seeded artifact keeps its original `created_at` and payload and
    /// starts out pending on the new timeline, regardless of what later
    /// happened to it on the fork source.
    pub fn create_seeded(
        path: impl AsRef<Path>,
        horizon: Lsn,
        snapshot: &[DerivedArtifact],
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Self::write_header(&mut file, horizon)?;

        let mut writer = BufWriter::new(file);
        let mut index = HashMap::new();
        let mut max_lsn = Lsn(0);

        for artifact in snapshot {
            let event = ArtifactEvent::Created {
                id: artifact.id.clone(),
                lsn: artifact.created_at,
                payload: artifact.payload.clone(),
            };
            Self::write_event(&mut writer, &event)?;
            max_lsn = max_lsn.max(artifact.created_at);
            index.insert(
                artifact.id.clone(),
                vec![DerivedArtifact {
                    id: artifact.id.clone(),
                    created_at: artifact.created_at,
                    retired_at: None,
                    payload: artifact.payload.clone(),
                }],
            );
        }

        writer.flush()?;
        writer.get_ref().sync_all()?;

        Ok(Self {
            path,
            inner: Mutex::new(StoreInner {
                writer,
                index,
                horizon,
                max_lsn,
            }),
        })
    }

    /// Open an existing store, replaying the event log.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = File::open(&path)?;
        let mut reader = BufReader::new(file);

        let horizon = Self::read_header(&mut reader)?;

        let mut index = HashMap::new();
        let mut max_lsn = Lsn(0);
        while let Some(event) = Self::read_event(&mut reader)? {
            max_lsn = max_lsn.max(event.lsn());
            Self::apply(&mut index, event);
        }

        let file = OpenOptions::new().append(true).open(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(StoreInner {
                writer: BufWriter::new(file),
                index,
                horizon,
                max_lsn,
            }),
        })
    }

    /// Record a new pending artifact at `lsn`.
    ///
    /// Re-putting an id that is still pending is an idempotent no-op
    /// (returns `false`). An id whose previous incarnation was retired may
    /// be created again at or after the retirement position; the retired
    /// incarnation stays in history so past snapshots keep answering.
    pub fn put(&self, id: &str, lsn: Lsn, payload: &[u8]) -> Result<bool> {
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.index.get(id).and_then(|history| history.last()) {
            if existing.is_pending() {
                tracing::warn!(artifact = id, %lsn, "put of already-pending artifact ignored");
                return Ok(false);
            }
            if let Some(retired_at) = existing.retired_at {
                if lsn < retired_at {
                    tracing::warn!(
                        artifact = id,
                        %lsn,
                        %retired_at,
                        "re-creation position precedes prior retirement, ignored"
                    );
                    return Ok(false);
                }
            }
        }

        let event = ArtifactEvent::Created {
            id: id.to_string(),
            lsn,
            payload: payload.to_vec(),
        };
        inner.append(&event)?;
        inner.max_lsn = inner.max_lsn.max(lsn);
        inner
            .index
            .entry(id.to_string())
            .or_default()
            .push(DerivedArtifact {
                id: id.to_string(),
                created_at: lsn,
                retired_at: None,
                payload: payload.to_vec(),
            });
        Ok(true)
    }

    /// Retire (commit/abort) a pending artifact at `lsn`.
    ///
    /// Retiring an unknown or already-retired artifact is a reported no-op,
    /// never fatal.
    pub fn retire(&self, id: &str, lsn: Lsn) -> Result<bool> {
        let mut inner = self.inner.lock();

        match inner.index.get(id).and_then(|history| history.last()) {
            None => {
                tracing::warn!(artifact = id, %lsn, "retire of unknown artifact ignored");
                return Ok(false);
            }
            Some(existing) if !existing.is_pending() => {
                tracing::warn!(artifact = id, %lsn, "retire of already-retired artifact ignored");
                return Ok(false);
            }
            Some(existing) if lsn < existing.created_at => {
                tracing::warn!(
                    artifact = id,
                    %lsn,
                    created_at = %existing.created_at,
                    "retire position precedes creation, ignored"
                );
                return Ok(false);
            }
            Some(_) => {}
        }

        let event = ArtifactEvent::Retired {
            id: id.to_string(),
            lsn,
        };
        inner.append(&event)?;
        inner.max_lsn = inner.max_lsn.max(lsn);
        if let Some(artifact) = inner.index.get_mut(id).and_then(|history| history.last_mut()) {
            artifact.retired_at = Some(lsn);
        }
        Ok(true)
    }

    /// All artifacts visible at position `at`, ordered by creation position.
    ///
    /// This is exactly the set a fork at `at` copies into the child.
    pub fn snapshot_as_of(&self, at: Lsn) -> Result<Vec<DerivedArtifact>> {
        let inner = self.inner.lock();

        if at < inner.horizon {
            return Err(StoreError::InvalidForkPoint {
                requested: at,
                horizon: inner.horizon,
                head: inner.max_lsn,
            });
        }

        // At most one incarnation of an id is visible at any position: a
        // re-creation never precedes the prior retirement.
        let mut snapshot: Vec<DerivedArtifact> = inner
            .index
            .values()
            .flatten()
            .filter(|a| a.visible_at(at))
            .cloned()
            .collect();
        snapshot.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(snapshot)
    }

    /// Currently pending artifacts, ordered by creation position.
    pub fn pending(&self) -> Vec<DerivedArtifact> {
        let inner = self.inner.lock();
        let mut pending: Vec<DerivedArtifact> = inner
            .index
            .values()
            .filter_map(|history| history.last())
            .filter(|a| a.is_pending())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        pending
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .index
            .values()
            .filter_map(|history| history.last())
            .filter(|a| a.is_pending())
            .count()
    }

    pub fn horizon(&self) -> Lsn {
        self.inner.lock().horizon
    }

    /// Highest event position recorded in this store.
    pub fn max_lsn(&self) -> Lsn {
        self.inner.lock().max_lsn
    }

    /// Drop artifacts fully retired before `cutoff` and raise the horizon.
    ///
    /// Snapshot answers for positions at or after the new horizon are
    /// unchanged: a dropped artifact was retired before the cutoff and is
    /// therefore invisible at every still-answerable position. The log is
    /// rewritten to a temp file and renamed into place.
    pub fn compact(&self, cutoff: Lsn) -> Result<CompactionStats> {
        let mut inner = self.inner.lock();

        if cutoff <= inner.horizon {
            return Ok(CompactionStats {
                kept: inner.index.values().map(Vec::len).sum(),
                dropped: 0,
                new_horizon: inner.horizon,
            });
        }
        let new_horizon = cutoff;

        // The sort is stable, so incarnations of one id keep their creation
        // order and replay re-links each retirement to the right one.
        let mut kept: Vec<DerivedArtifact> = inner
            .index
            .values()
            .flatten()
            .filter(|a| a.retired_at.map_or(true, |r| r >= new_horizon))
            .cloned()
            .collect();
        kept.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let tmp_path = self.path.with_extension("log.tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        Self::write_header(&mut file, new_horizon)?;

        let mut writer = BufWriter::new(file);
        for artifact in &kept {
            Self::write_event(
                &mut writer,
                &ArtifactEvent::Created {
                    id: artifact.id.clone(),
                    lsn: artifact.created_at,
                    payload: artifact.payload.clone(),
                },
            )?;
            if let Some(retired_at) = artifact.retired_at {
                Self::write_event(
                    &mut writer,
                    &ArtifactEvent::Retired {
                        id: artifact.id.clone(),
                        lsn: retired_at,
                    },
                )?;
            }
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&tmp_path, &self.path)?;

        let kept_count = kept.len();
        let total: usize = inner.index.values().map(Vec::len).sum();
        let dropped = total - kept_count;
        for history in inner.index.values_mut() {
            history.retain(|a| a.retired_at.map_or(true, |r| r >= new_horizon));
        }
        inner.index.retain(|_, history| !history.is_empty());
        inner.horizon = new_horizon;
        inner.writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);

        tracing::debug!(
            path = %self.path.display(),
            kept = kept_count,
            dropped,
            horizon = %new_horizon,
            "compacted artifact log"
        );

        Ok(CompactionStats {
            kept: kept_count,
            dropped,
            new_horizon,
        })
    }

    // --- Framing ---

    fn write_header(file: &mut File, horizon: Lsn) -> Result<()> {
        file.seek(SeekFrom::Start(0))?;
        file.write_all(ARTIFACT_LOG_MAGIC)?;
        file.write_all(&[ARTIFACT_LOG_VERSION])?;
        file.write_all(&horizon.0.to_le_bytes())?;
        debug_assert_eq!(file.stream_position()?, HEADER_SIZE);
        Ok(())
    }

    fn read_header(reader: &mut impl Read) -> Result<Lsn> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != ARTIFACT_LOG_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid artifact log magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != ARTIFACT_LOG_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported artifact log version: {}",
                version[0]
            )));
        }

        let mut horizon_bytes = [0u8; 8];
        reader.read_exact(&mut horizon_bytes)?;
        Ok(Lsn(u64::from_le_bytes(horizon_bytes)))
    }

    fn write_event(writer: &mut impl Write, event: &ArtifactEvent) -> Result<()> {
        let encoded = rmp_serde::to_vec(event)?;
        let checksum = crc32fast::hash(&encoded);
        writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
        writer.write_all(&checksum.to_le_bytes())?;
        writer.write_all(&encoded)?;
        Ok(())
    }

    /// Read the next event, or `None` at end of log. A torn frame at the
    /// very end of the file is treated as the end of the log.
    fn read_event(reader: &mut impl Read) -> Result<Option<ArtifactEvent>> {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_EVENT_SIZE {
            return Err(StoreError::Corruption(format!(
                "Event frame length {len} exceeds maximum {MAX_EVENT_SIZE}"
            )));
        }

        let mut checksum_bytes = [0u8; 4];
        let mut encoded = vec![0u8; len];
        match reader
            .read_exact(&mut checksum_bytes)
            .and_then(|()| reader.read_exact(&mut encoded))
        {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                tracing::warn!("torn frame at end of artifact log, ignoring");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&encoded);
        if expected != got {
            return Err(StoreError::ChecksumMismatch { expected, got });
        }

        Ok(Some(rmp_serde::from_slice(&encoded)?))
    }

    fn apply(index: &mut HashMap<String, Vec<DerivedArtifact>>, event: ArtifactEvent) {
        match event {
            ArtifactEvent::Created { id, lsn, payload } => {
                index.entry(id.clone()).or_default().push(DerivedArtifact {
                    id,
                    created_at: lsn,
                    retired_at: None,
                    payload,
                });
            }
            ArtifactEvent::Retired { id, lsn } => {
                if let Some(artifact) = index.get_mut(&id).and_then(|history| history.last_mut()) {
                    artifact.retired_at = Some(lsn);
                }
            }
        }
    }
}

impl ArtifactEvent {
    fn lsn(&self) -> Lsn {
        match *self {
            ArtifactEvent::Created { lsn, .. } | ArtifactEvent::Retired { lsn, .. } => lsn,
        }
    }
}

impl StoreInner {
    fn append(&mut self, event: &ArtifactEvent) -> Result<()> {
        ArtifactStore::write_event(&mut self.writer, event)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}
