//! Segmented write-ahead log.
//!
//! The log is a directory of `\n`-terminated JSON records split across
//! size-rolled segment files named `<base>.segment.<N>`. At most one segment
//! (the highest `N`) is active; the rest are sealed and immutable except for
//! compaction, which replaces them atomically via rename.
//!
//! Replay is integrity-filtered rather than strict: records with a CRC that
//! does not match are dropped, malformed lines are skipped, and records
//! without any CRC are accepted for id tracking (older logs predate the
//! checksum). A single corrupted record never halts recovery.

pub mod entry;


use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{KvError, Result};

pub use entry::{LogEntry, Operation};

/// Append-only, size-rolled, CRC-protected operation log.
///
/// Single-writer: all mutations go through one internal lock. Readers
/// snapshot the segment list and then work off the filesystem, so they see
/// either the pre- or post-compaction layout, never a mix.
pub struct SegmentedWal {
    base_path: PathBuf,
    max_segment_size: u64,
    inner: Mutex<WalInner>,
}

struct WalInner {
    /// Segment paths in ascending `N`; the last one is active.
    segments: Vec<PathBuf>,
    /// Number of the active segment.
    active_number: u64,
    /// Append handle to the active segment.
    writer: BufWriter<File>,
    /// In-memory write position of the active segment, so rollover checks do
    /// not need a metadata syscall per append.
    active_size: u64,
    /// Highest id ever observed (appended or replayed).
    current_id: u64,
    /// Every id present in the log, for idempotent replication appends.
    existing_ids: HashSet<u64>,
}

impl SegmentedWal {
    /// Open (or create) the WAL rooted at `base_path`.
    ///
    /// Scans the directory for `<base>.segment.<N>` files, picks the highest
    /// `N` as the active segment (creating `segment.1` when none exist) and
    /// replays every segment to rebuild the id set.
    pub fn open(base_path: impl Into<PathBuf>, max_segment_size: u64) -> Result<Self> {
        let base_path = base_path.into();
        if let Some(parent) = base_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut segments = Self::discover_segments(&base_path)?;
        if segments.is_empty() {
            let first = Self::segment_path(&base_path, 1);
            File::create(&first)?;
            segments.push(first);
        }

        let (current_id, existing_ids) = Self::replay_ids(&segments);

        let active = segments.last().expect("at least one segment").clone();
        let active_number = Self::segment_number(&base_path, &active)
            .ok_or_else(|| KvError::Internal(format!("bad segment name: {}", active.display())))?;
        let file = OpenOptions::new().create(true).append(true).open(&active)?;
        let active_size = file.metadata().map(|m| m.len()).unwrap_or(0);

        info!(
            segments = segments.len(),
            last_id = current_id,
            "opened WAL at {}",
            base_path.display()
        );

        Ok(Self {
            base_path,
            max_segment_size,
            inner: Mutex::new(WalInner {
                segments,
                active_number,
                writer: BufWriter::new(file),
                active_size,
                current_id,
                existing_ids,
            }),
        })
    }

    /// Append a new operation, assigning it the next id and a CRC.
    pub fn append(
        &self,
        operation: Operation,
        key: impl Into<String>,
        value: Option<Value>,
        version: Option<u64>,
    ) -> Result<LogEntry> {
        if operation == Operation::Get {
            return Err(KvError::InvalidRequest(
                "GET operations are never logged".to_string(),
            ));
        }
        let mut inner = self.inner.lock();
        let id = inner.current_id + 1;
        let entry = LogEntry::sealed(id, operation, key, value, version);
        self.write_record(&mut inner, &entry)?;
        inner.current_id = id;
        inner.existing_ids.insert(id);
        Ok(entry)
    }

    /// Append a pre-created entry, preserving its id. Used for replication.
    ///
    /// If the id is already present this is a no-op. A missing or invalid CRC
    /// is recomputed before the entry hits disk.
    pub fn append_entry(&self, mut entry: LogEntry) -> Result<LogEntry> {
        if entry.operation == Operation::Get {
            return Err(KvError::InvalidRequest(
                "GET operations are never logged".to_string(),
            ));
        }
        let mut inner = self.inner.lock();
        if inner.existing_ids.contains(&entry.id) {
            return Ok(entry);
        }
        if entry.id > inner.current_id {
            inner.current_id = entry.id;
        }
        if !entry.validate_crc() {
            entry.crc = Some(entry.compute_crc());
        }
        self.write_record(&mut inner, &entry)?;
        inner.existing_ids.insert(entry.id);
        Ok(entry)
    }

    /// Whether an entry with this id is already in the log.
    #[must_use]
    pub fn has_entry(&self, id: u64) -> bool {
        self.inner.lock().existing_ids.contains(&id)
    }

    /// Highest id ever appended or replayed; 0 for an empty log.
    #[must_use]
    pub fn last_id(&self) -> u64 {
        self.inner.lock().current_id
    }

    /// All entries with `id >= start_id` that pass CRC validation, sorted by
    /// id.
    ///
    /// Non-strict: malformed records and CRC mismatches are logged and
    /// skipped, and an unreadable segment only costs its own entries.
    #[must_use]
    pub fn read_from(&self, start_id: u64) -> Vec<LogEntry> {
        let segments = self.inner.lock().segments.clone();
        let mut entries = Vec::new();
        for path in segments {
            let file = match File::open(&path) {
                Ok(f) => f,
                Err(e) => {
                    warn!("skipping unreadable segment {}: {e}", path.display());
                    continue;
                }
            };
            for line in BufReader::new(file).lines() {
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        warn!("read error in segment {}: {e}", path.display());
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let entry = match LogEntry::decode(&line) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("skipping malformed record in {}: {e}", path.display());
                        continue;
                    }
                };
                if !entry.validate_crc() {
                    warn!("skipping entry {} due to CRC validation failure", entry.id);
                    continue;
                }
                if entry.id >= start_id {
                    entries.push(entry);
                }
            }
        }
        entries.sort_by_key(|e| e.id);
        entries
    }

    /// Paths of all segments, ascending by segment number.
    #[must_use]
    pub fn segment_files(&self) -> Vec<PathBuf> {
        self.inner.lock().segments.clone()
    }

    /// Path of the active (appendable) segment.
    #[must_use]
    pub fn active_segment(&self) -> PathBuf {
        self.inner
            .lock()
            .segments
            .last()
            .expect("a WAL always has an active segment")
            .clone()
    }

    /// Configured rollover threshold in bytes.
    #[must_use]
    pub fn max_segment_size(&self) -> u64 {
        self.max_segment_size
    }

    /// Merge the sealed segments, keeping only the latest SET or DELETE per
    /// key. The active segment is never touched.
    ///
    /// A trailing DELETE is retained as a tombstone so that it still
    /// dominates earlier entries on replay. Returns
    /// `(segments_compacted, entries_removed)`.
    pub fn compact(&self) -> Result<(usize, u64)> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;

        let sealed: Vec<PathBuf> = inner.segments[..inner.segments.len() - 1].to_vec();
        if sealed.is_empty() {
            return Ok((0, 0));
        }

        // Read every sealed segment. A segment that cannot be read keeps its
        // content: it is renumbered back into the sequence untouched.
        let mut consumed: Vec<PathBuf> = Vec::new();
        let mut input_entries = 0u64;
        let mut latest: HashMap<String, LogEntry> = HashMap::new();
        for path in &sealed {
            match Self::read_segment_entries(path) {
                Ok(entries) => {
                    input_entries += entries.len() as u64;
                    for entry in entries {
                        match latest.get(&entry.key) {
                            Some(existing) if existing.id >= entry.id => {}
                            _ => {
                                latest.insert(entry.key.clone(), entry);
                            }
                        }
                    }
                    consumed.push(path.clone());
                }
                Err(e) => {
                    warn!(
                        "compaction: leaving unreadable segment {} in place: {e}",
                        path.display()
                    );
                }
            }
        }
        if consumed.is_empty() {
            return Ok((0, 0));
        }

        let mut retained: Vec<LogEntry> = latest.into_values().collect();
        retained.sort_by_key(|e| e.id);

        // The temp file name has no numeric suffix, so segment discovery
        // ignores it if we crash before the rename lands.
        let compacted_tmp = Self::with_suffix(&self.base_path, ".compacting.tmp");
        {
            let mut out = BufWriter::new(File::create(&compacted_tmp)?);
            for entry in &retained {
                out.write_all(entry.encode().as_bytes())?;
            }
            out.flush()?;
        }

        // Displace every sealed segment, land the compacted stream at
        // segment 1, then renumber the unconsumed survivors behind it.
        // Discovery ignores `.tmp` names, so a crash mid-sequence leaves a
        // replayable subset plus residue rather than a mixed layout.
        let mut displaced: Vec<(PathBuf, PathBuf)> = Vec::new();
        for path in &sealed {
            let tmp = Self::with_suffix(path, ".tmp");
            fs::rename(path, &tmp)?;
            displaced.push((path.clone(), tmp));
        }
        fs::rename(&compacted_tmp, Self::segment_path(&self.base_path, 1))?;
        let mut next_number = 2;
        for (original, tmp) in &displaced {
            if consumed.contains(original) {
                // Content now lives in the compacted segment.
                let _ = fs::remove_file(tmp);
            } else {
                fs::rename(tmp, Self::segment_path(&self.base_path, next_number))?;
                next_number += 1;
            }
        }

        // Re-scan; the active segment kept its number and its open handle.
        inner.segments = Self::discover_segments(&self.base_path)?;

        let entries_removed = input_entries - retained.len() as u64;
        info!(
            segments_compacted = consumed.len(),
            entries_removed, "compacted WAL at {}",
            self.base_path.display()
        );
        Ok((consumed.len(), entries_removed))
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Roll to a fresh segment when the active one is full, then write and
    /// flush one record.
    fn write_record(&self, inner: &mut WalInner, entry: &LogEntry) -> Result<()> {
        self.roll_if_needed(inner);
        let line = entry.encode();
        inner.writer.write_all(line.as_bytes())?;
        inner.writer.flush()?;
        inner.active_size += line.len() as u64;
        Ok(())
    }

    /// Checked before each append: once the active segment has reached the
    /// size limit the *next* record goes to a new segment, so a segment may
    /// exceed the limit by exactly one record. Failure to open the next
    /// segment is not fatal; we keep writing to the current one.
    fn roll_if_needed(&self, inner: &mut WalInner) {
        if inner.active_size < self.max_segment_size {
            return;
        }
        let next_number = inner.active_number + 1;
        let path = Self::segment_path(&self.base_path, next_number);
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                let _ = inner.writer.flush();
                inner.writer = BufWriter::new(file);
                inner.segments.push(path);
                inner.active_number = next_number;
                inner.active_size = 0;
            }
            Err(e) => {
                warn!(
                    "failed to roll to segment {next_number}: {e}; continuing with current segment"
                );
            }
        }
    }

    /// Rebuild `(current_id, existing_ids)` from disk.
    ///
    /// Entries without a CRC are legacy and accepted; entries with a CRC that
    /// does not match are rejected; malformed lines are skipped.
    fn replay_ids(segments: &[PathBuf]) -> (u64, HashSet<u64>) {
        let mut current_id = 0u64;
        let mut existing_ids = HashSet::new();
        for path in segments {
            let file = match File::open(path) {
                Ok(f) => f,
                Err(e) => {
                    warn!("cannot replay segment {}: {e}", path.display());
                    continue;
                }
            };
            for line in BufReader::new(file).lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let Ok(entry) = LogEntry::decode(&line) else {
                    continue;
                };
                if entry.crc.is_some() && !entry.validate_crc() {
                    warn!("entry {} has invalid CRC, skipping", entry.id);
                    continue;
                }
                existing_ids.insert(entry.id);
                if entry.id > current_id {
                    current_id = entry.id;
                }
            }
        }
        (current_id, existing_ids)
    }

    /// Entries of one segment for compaction: CRC mismatches are dropped,
    /// legacy CRC-less records ride along unchanged.
    fn read_segment_entries(path: &Path) -> std::io::Result<Vec<LogEntry>> {
        let file = File::open(path)?;
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let Ok(entry) = LogEntry::decode(&line) else {
                continue;
            };
            if entry.crc.is_some() && !entry.validate_crc() {
                continue;
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    fn segment_path(base_path: &Path, number: u64) -> PathBuf {
        Self::with_suffix(base_path, &format!(".segment.{number}"))
    }

    /// Segment number of `path`, or `None` for anything that is not a
    /// `<base>.segment.<N>` file - which is what keeps `.tmp` residue from a
    /// crashed compaction out of the replay set.
    fn segment_number(base_path: &Path, path: &Path) -> Option<u64> {
        let base_name = base_path.file_name()?.to_str()?;
        let file_name = path.file_name()?.to_str()?;
        file_name
            .strip_prefix(base_name)?
            .strip_prefix(".segment.")?
            .parse()
            .ok()
    }

    /// All `<base>.segment.<N>` files next to `base_path`, ascending by `N`.
    fn discover_segments(base_path: &Path) -> Result<Vec<PathBuf>> {
        let dir = match base_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut numbered: Vec<(u64, PathBuf)> = Vec::new();
        for dir_entry in fs::read_dir(&dir)? {
            let path = dir_entry?.path();
            if let Some(number) = Self::segment_number(base_path, &path) {
                numbered.push((number, path));
            }
        }
        numbered.sort_by_key(|(number, _)| *number);
        Ok(numbered.into_iter().map(|(_, path)| path).collect())
    }

    fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
        let mut os = path.to_path_buf().into_os_string();
        os.push(suffix);
        PathBuf::from(os)
    }
}
