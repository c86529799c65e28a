//! Write-Ahead Log (WAL)
//!
//! One append-only record stream per node. A write is first appended as a
//! pending entry; a later `Commit` record marks it committed. Replaying the
//! file forward therefore recovers both the entries and their commit state.
//!
//! Frame format: [MAGIC][LEN u32][PAYLOAD][CRC32 u32], payload is a bincode
//! encoded [`WalRecord`], CRC covers the payload.
//!
//! The [`WalManager`] owns the version counter. Assigning a version, checking
//! it against the cluster's commit pointer and appending the pending entry
//! happen in one critical section.

use crate::common::{crc32, Error, KVStore, Result, WalSyncPolicy};
use crate::coordination::{read_commit_pointer, write_commit_pointer, Coordination};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

const WAL_MAGIC: [u8; 4] = *b"QKW1";
const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Put,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Put => write!(f, "PUT"),
            Operation::Delete => write!(f, "DELETE"),
        }
    }
}

/// A write as requested by a client, before a version is assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteIntent {
    pub operation: Operation,
    pub key: String,
    pub value: String,
}

impl WriteIntent {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            operation: Operation::Put,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            operation: Operation::Delete,
            key: key.into(),
            value: String::new(),
        }
    }
}

/// The unit of replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    pub version: u64,
    pub operation: Operation,
    pub key: String,
    /// Ignored for `Delete`
    pub value: String,
    pub committed: bool,
}

impl WalEntry {
    /// Apply this entry to a key-value map.
    pub fn apply_to(&self, store: &dyn KVStore) {
        match self.operation {
            Operation::Put => store.put(&self.key, self.value.clone()),
            Operation::Delete => store.delete(&self.key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalRecord {
    Entry(WalEntry),
    Commit { version: u64 },
}

/// Raw record file.
pub struct Wal {
    path: PathBuf,
    /// `None` only while a failed append is being rolled back
    writer: Option<BufWriter<File>>,
    /// End of the last frame appended successfully
    len: u64,
    sync_policy: WalSyncPolicy,
}

impl Wal {
    /// Open or create the WAL file. A torn or corrupt tail left by a crash is
    /// cut off so new records stay reachable on replay.
    pub fn open(path: impl AsRef<Path>, sync_policy: WalSyncPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = Self::open_file(&path)?;
        let valid_len = Self::replay(&path, |_| Ok(()))?;
        let file_len = file.metadata()?.len();
        if valid_len < file_len {
            tracing::warn!(
                "truncating WAL {} from {} to {} bytes",
                path.display(),
                file_len,
                valid_len
            );
            file.set_len(valid_len)?;
        }

        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            len: valid_len,
            sync_policy,
        })
    }

    fn open_file(path: &Path) -> Result<File> {
        Ok(OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?)
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| Error::Wal(format!("WAL {} is not writable", self.path.display())))
    }

    fn encode(record: &WalRecord) -> Result<Vec<u8>> {
        let payload = bincode::serialize(record)?;
        let mut frame = Vec::with_capacity(payload.len() + 12);
        frame.extend_from_slice(&WAL_MAGIC);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&crc32(&payload).to_le_bytes());
        Ok(frame)
    }

    /// Append one frame. On failure nothing of the frame stays behind, in
    /// the buffer or in the file.
    pub fn append(&mut self, record: &WalRecord) -> Result<()> {
        let frame = Self::encode(record)?;
        let start = self.len;

        match self.write_frame(&frame) {
            Ok(()) => {
                self.len = start + frame.len() as u64;
                Ok(())
            }
            Err(e) => {
                tracing::error!(path = %self.path.display(), "WAL append failed: {}", e);
                if let Err(rollback) = self.rollback(start) {
                    tracing::error!(path = %self.path.display(), "WAL rollback failed: {}", rollback);
                }
                Err(e)
            }
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.writer()?.write_all(frame)?;
        self.maybe_sync()
    }

    /// Drop whatever is buffered, reopen the file and cut it back to the
    /// last frame known to be complete, never past `offset`.
    fn rollback(&mut self, offset: u64) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            // dropping the BufWriter itself would flush the stale bytes
            let (_file, _discarded) = writer.into_parts();
        }

        let file = Self::open_file(&self.path)?;
        let valid_len = Self::replay(&self.path, |_| Ok(()))?.min(offset);
        if file.metadata()?.len() > valid_len {
            file.set_len(valid_len)?;
        }
        self.len = valid_len;
        self.writer = Some(BufWriter::new(file));
        tracing::warn!(path = %self.path.display(), len = valid_len, "WAL rolled back");
        Ok(())
    }

    fn maybe_sync(&mut self) -> Result<()> {
        match self.sync_policy {
            WalSyncPolicy::Always => self.sync(),
            WalSyncPolicy::Interval => self.flush(),
            WalSyncPolicy::Never => Ok(()),
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer()?.flush()?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        let writer = self.writer()?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Replay records in append order. Returns the byte length of the valid
    /// prefix; replay stops at the first torn or corrupt frame.
    pub fn replay<F>(path: impl AsRef<Path>, mut callback: F) -> Result<u64>
    where
        F: FnMut(WalRecord) -> Result<()>,
    {
        let file = match File::open(path.as_ref()) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut offset = 0u64;

        loop {
            match Self::read_record(&mut reader) {
                Ok(Some((record, len))) => {
                    callback(record)?;
                    offset += len;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("WAL replay stopped at offset {}: {}", offset, e);
                    break;
                }
            }
        }

        Ok(offset)
    }

    fn read_record<R: Read>(reader: &mut R) -> Result<Option<(WalRecord, u64)>> {
        let mut magic = [0u8; 4];
        match reader.read_exact(&mut magic) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        if magic != WAL_MAGIC {
            return Err(Error::Wal("invalid WAL magic".into()));
        }

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_RECORD_LEN {
            return Err(Error::Wal(format!("record length {} out of range", len)));
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        if crc32(&payload) != u32::from_le_bytes(checksum_bytes) {
            return Err(Error::Wal("checksum mismatch".into()));
        }

        let record = bincode::deserialize(&payload)?;
        Ok(Some((record, (4 + 4 + len + 4) as u64)))
    }
}

/// State recovered by replaying a WAL file.
#[derive(Debug, Clone, Default)]
pub struct WalReplay {
    /// Entries in append order with their final commit state
    pub entries: Vec<WalEntry>,
    /// Version of the last entry appended
    pub last_version: u64,
    /// Highest committed version
    pub last_committed: u64,
}

impl WalReplay {
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let mut replay = WalReplay::default();
        let mut index: BTreeMap<u64, usize> = BTreeMap::new();

        Wal::replay(path, |record| {
            match record {
                WalRecord::Entry(entry) => {
                    replay.last_version = entry.version;
                    if entry.committed {
                        replay.last_committed = replay.last_committed.max(entry.version);
                    }
                    index.insert(entry.version, replay.entries.len());
                    replay.entries.push(entry);
                }
                WalRecord::Commit { version } => {
                    if let Some(&i) = index.get(&version) {
                        replay.entries[i].committed = true;
                        replay.last_committed = replay.last_committed.max(version);
                    } else {
                        tracing::warn!(version, "commit record without entry");
                    }
                }
            }
            Ok(())
        })?;

        Ok(replay)
    }
}

/// Summary for status reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WalStatus {
    pub last_version: u64,
    pub last_committed: u64,
    pub pending: usize,
}

struct WalState {
    wal: Wal,
    next_version: u64,
    last_version: u64,
    last_committed: u64,
    /// version -> committed
    versions: BTreeMap<u64, bool>,
}

impl WalState {
    fn append_entry(&mut self, entry: &WalEntry) -> Result<()> {
        // a version handed out once is burnt, even if the write fails
        self.next_version = self.next_version.max(entry.version + 1);
        self.wal.append(&WalRecord::Entry(entry.clone()))?;
        self.last_version = entry.version;
        self.versions.insert(entry.version, entry.committed);
        if entry.committed {
            self.last_committed = self.last_committed.max(entry.version);
        }
        Ok(())
    }

    /// Returns false when the version was already committed.
    fn commit(&mut self, version: u64) -> Result<bool> {
        match self.versions.get(&version) {
            None => Err(Error::Wal(format!("cannot commit unknown version {}", version))),
            Some(true) => Ok(false),
            Some(false) => {
                self.wal.append(&WalRecord::Commit { version })?;
                self.versions.insert(version, true);
                self.last_committed = self.last_committed.max(version);
                Ok(true)
            }
        }
    }
}

pub struct WalManager {
    path: PathBuf,
    coord: Arc<dyn Coordination>,
    state: Mutex<WalState>,
}

impl WalManager {
    /// Open the node's WAL and recover the version counter from it.
    pub fn open(
        path: impl AsRef<Path>,
        sync_policy: WalSyncPolicy,
        coord: Arc<dyn Coordination>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let wal = Wal::open(&path, sync_policy)?;
        let replay = WalReplay::read(&path)?;

        let versions: BTreeMap<u64, bool> = replay
            .entries
            .iter()
            .map(|entry| (entry.version, entry.committed))
            .collect();
        let next_version = versions.keys().next_back().map(|v| v + 1).unwrap_or(1);

        tracing::info!(
            path = %path.display(),
            entries = replay.entries.len(),
            last_version = replay.last_version,
            last_committed = replay.last_committed,
            "WAL recovered"
        );

        Ok(Self {
            path,
            coord,
            state: Mutex::new(WalState {
                wal,
                next_version,
                last_version: replay.last_version,
                last_committed: replay.last_committed,
                versions,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Leader append: assign the next version and append it as pending.
    ///
    /// Fails with `VersionConflict`, writing nothing, when the local latest
    /// committed version disagrees with the cluster commit pointer.
    pub async fn append(&self, intent: WriteIntent) -> Result<WalEntry> {
        let mut state = self.state.lock().await;

        let cluster = self.commit_pointer().await?;
        if state.last_committed != cluster {
            tracing::warn!(
                local = state.last_committed,
                cluster,
                "conflict detected: WAL entry not written"
            );
            return Err(Error::VersionConflict {
                local: state.last_committed,
                cluster,
            });
        }

        let version = state.next_version.max(cluster + 1);
        let value = match intent.operation {
            Operation::Put => intent.value,
            Operation::Delete => String::new(),
        };
        let entry = WalEntry {
            version,
            operation: intent.operation,
            key: intent.key,
            value,
            committed: false,
        };
        state.append_entry(&entry)?;
        tracing::debug!(version, op = %entry.operation, key = %entry.key, "appended pending entry");
        Ok(entry)
    }

    /// Follower append of a leader-versioned entry, as pending.
    ///
    /// Returns false for a version already in the log. Versions may arrive
    /// out of order while the leader has several writes in flight.
    pub async fn append_replicated(&self, entry: &WalEntry) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.versions.contains_key(&entry.version) {
            return Ok(false);
        }
        let pending = WalEntry {
            committed: false,
            ..entry.clone()
        };
        state.append_entry(&pending)?;
        Ok(true)
    }

    /// Mark a previously appended entry committed. Idempotent.
    pub async fn mark_committed(&self, version: u64) -> Result<bool> {
        self.state.lock().await.commit(version)
    }

    /// Follower commit. Appends the entry first if its prepare never arrived.
    /// Returns false when the version was already committed.
    pub async fn commit_replicated(&self, entry: &WalEntry) -> Result<bool> {
        let mut state = self.state.lock().await;
        if !state.versions.contains_key(&entry.version) {
            let pending = WalEntry {
                committed: false,
                ..entry.clone()
            };
            state.append_entry(&pending)?;
        }
        state.commit(entry.version)
    }

    /// Leader commit: advance `/version` to the highest committed version,
    /// then mark the entry committed locally. The pointer never moves
    /// backwards. If the pointer cannot be written the entry stays pending,
    /// so the local committed version keeps matching `/version`.
    pub async fn record_commit(&self, version: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.versions.get(&version) {
            None => {
                return Err(Error::Wal(format!("cannot commit unknown version {}", version)));
            }
            Some(true) => return Ok(()),
            Some(false) => {}
        }

        let pointer = state.last_committed.max(version);
        write_commit_pointer(self.coord.as_ref(), pointer).await?;
        state.commit(version)?;
        tracing::debug!(version, pointer, "commit pointer advanced");
        Ok(())
    }

    /// Cluster commit pointer, as recorded in the coordination service.
    pub async fn commit_pointer(&self) -> Result<u64> {
        read_commit_pointer(self.coord.as_ref())
            .await
            .map_err(|e| match e {
                Error::CoordinationUnavailable(_) => e,
                other => Error::CoordinationUnavailable(other.to_string()),
            })
    }

    /// Version of the last entry in the log, by replaying the file.
    pub async fn latest_version(&self) -> Result<u64> {
        Ok(self.replay().await?.last_version)
    }

    /// Highest committed version, by replaying the file.
    pub async fn latest_committed_version(&self) -> Result<u64> {
        Ok(self.replay().await?.last_committed)
    }

    /// Replay the file from the start.
    pub async fn replay(&self) -> Result<WalReplay> {
        let mut state = self.state.lock().await;
        state.wal.flush()?;
        WalReplay::read(&self.path)
    }

    /// Cached counters, no disk access.
    pub async fn status(&self) -> WalStatus {
        let state = self.state.lock().await;
        WalStatus {
            last_version: state.last_version,
            last_committed: state.last_committed,
            pending: state.versions.values().filter(|committed| !**committed).count(),
        }
    }

    /// Flush and fsync whatever the sync policy left buffered.
    pub async fn sync(&self) -> Result<()> {
        self.state.lock().await.wal.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{bootstrap, MemCoordination, MemSession};
    use tempfile::tempdir;

    async fn coordination() -> (MemCoordination, Arc<MemSession>) {
        let ensemble = MemCoordination::new();
        let session = Arc::new(ensemble.session());
        bootstrap(session.as_ref()).await.unwrap();
        (ensemble, session)
    }

    #[test]
    fn test_wal_records_replay_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        {
            let mut wal = Wal::open(&path, WalSyncPolicy::Always).unwrap();
            wal.append(&WalRecord::Entry(WalEntry {
                version: 1,
                operation: Operation::Put,
                key: "a".into(),
                value: "1".into(),
                committed: false,
            }))
            .unwrap();
            wal.append(&WalRecord::Commit { version: 1 }).unwrap();
        }

        let mut records = Vec::new();
        Wal::replay(&path, |record| {
            records.push(record);
            Ok(())
        })
        .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1], WalRecord::Commit { version: 1 });

        let replay = WalReplay::read(&path).unwrap();
        assert_eq!(replay.last_version, 1);
        assert_eq!(replay.last_committed, 1);
        assert!(replay.entries[0].committed);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("torn.wal");

        {
            let mut wal = Wal::open(&path, WalSyncPolicy::Always).unwrap();
            wal.append(&WalRecord::Commit { version: 1 }).unwrap();
        }
        let good_len = std::fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&WAL_MAGIC).unwrap();
            file.write_all(&[0xff, 0x00]).unwrap();
        }

        let mut wal = Wal::open(&path, WalSyncPolicy::Always).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);
        wal.append(&WalRecord::Commit { version: 2 }).unwrap();

        let mut count = 0;
        Wal::replay(&path, |_| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 2);
    }

    /// Swap in a writer on a read-only handle so the next flush fails.
    fn break_writer(wal: &mut Wal) {
        let read_only = File::open(&wal.path).unwrap();
        wal.writer = Some(BufWriter::new(read_only));
    }

    #[test]
    fn test_failed_append_leaves_no_partial_frame() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("failing.wal");
        let mut wal = Wal::open(&path, WalSyncPolicy::Always).unwrap();
        wal.append(&WalRecord::Commit { version: 1 }).unwrap();
        let good_len = std::fs::metadata(&path).unwrap().len();

        break_writer(&mut wal);
        assert!(wal.append(&WalRecord::Commit { version: 2 }).is_err());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);

        // the rolled back frame must not resurface with the next write
        wal.append(&WalRecord::Commit { version: 3 }).unwrap();
        wal.flush().unwrap();
        let mut records = Vec::new();
        Wal::replay(&path, |record| {
            records.push(record);
            Ok(())
        })
        .unwrap();
        assert_eq!(
            records,
            vec![WalRecord::Commit { version: 1 }, WalRecord::Commit { version: 3 }]
        );
    }

    #[tokio::test]
    async fn test_failed_append_burns_its_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let (_ensemble, session) = coordination().await;
        let wal = WalManager::open(&path, WalSyncPolicy::Always, session).unwrap();

        let first = wal.append(WriteIntent::put("a", "1")).await.unwrap();
        wal.record_commit(first.version).await.unwrap();

        break_writer(&mut wal.state.lock().await.wal);
        assert!(matches!(
            wal.append(WriteIntent::put("b", "2")).await,
            Err(Error::Io(_))
        ));

        let next = wal.append(WriteIntent::put("c", "3")).await.unwrap();
        assert_eq!(next.version, 3);

        let replay = wal.replay().await.unwrap();
        let versions: Vec<u64> = replay.entries.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 3]);
        assert_eq!(replay.entries[1].key, "c");
    }

    #[tokio::test]
    async fn test_pointer_outage_leaves_entry_pending() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let (ensemble, session) = coordination().await;
        let wal = WalManager::open(&path, WalSyncPolicy::Always, session).unwrap();

        let entry = wal.append(WriteIntent::put("a", "1")).await.unwrap();
        ensemble.set_available(false);
        assert!(matches!(
            wal.record_commit(entry.version).await,
            Err(Error::CoordinationUnavailable(_))
        ));
        ensemble.set_available(true);

        // local state still agrees with /version, so the leader can go on
        let status = wal.status().await;
        assert_eq!(status.last_committed, 0);
        assert_eq!(status.pending, 1);
        assert_eq!(wal.commit_pointer().await.unwrap(), 0);
        assert!(!WalReplay::read(&path).unwrap().entries[0].committed);

        let next = wal.append(WriteIntent::put("b", "2")).await.unwrap();
        wal.record_commit(next.version).await.unwrap();
        assert_eq!(wal.commit_pointer().await.unwrap(), 2);
        assert_eq!(wal.latest_committed_version().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sync_flushes_buffered_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let (_ensemble, session) = coordination().await;
        let wal = WalManager::open(&path, WalSyncPolicy::Never, session).unwrap();

        wal.append(WriteIntent::put("a", "1")).await.unwrap();
        wal.sync().await.unwrap();
        assert_eq!(WalReplay::read(&path).unwrap().entries.len(), 1);
    }

    #[tokio::test]
    async fn test_sequential_appends_have_no_gaps() {
        let dir = tempdir().unwrap();
        let (_ensemble, session) = coordination().await;
        let wal = WalManager::open(dir.path().join("wal.log"), WalSyncPolicy::Never, session)
            .unwrap();

        let mut versions = Vec::new();
        for i in 0..20 {
            let entry = wal
                .append(WriteIntent::put(format!("k{}", i), "v"))
                .await
                .unwrap();
            assert!(!entry.committed);
            wal.record_commit(entry.version).await.unwrap();
            versions.push(entry.version);
        }

        let expected: Vec<u64> = (1..=20).collect();
        assert_eq!(versions, expected);
        assert_eq!(wal.latest_version().await.unwrap(), 20);
        assert_eq!(wal.latest_committed_version().await.unwrap(), 20);
        assert_eq!(wal.commit_pointer().await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_conflict_refuses_append() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let (_ensemble, session) = coordination().await;
        let wal = WalManager::open(&path, WalSyncPolicy::Always, session.clone()).unwrap();

        let entry = wal.append(WriteIntent::put("a", "1")).await.unwrap();
        wal.record_commit(entry.version).await.unwrap();

        // another leader moved the cluster on
        write_commit_pointer(session.as_ref(), 5).await.unwrap();

        let err = wal.append(WriteIntent::put("b", "2")).await.unwrap_err();
        assert!(matches!(err, Error::VersionConflict { local: 1, cluster: 5 }));
        assert!(!err.is_retryable());

        let replay = WalReplay::read(&path).unwrap();
        assert_eq!(replay.entries.len(), 1);
        assert_eq!(replay.last_version, 1);
    }

    #[tokio::test]
    async fn test_abandoned_pending_entry_does_not_block_or_reuse_version() {
        let dir = tempdir().unwrap();
        let (_ensemble, session) = coordination().await;
        let wal = WalManager::open(dir.path().join("wal.log"), WalSyncPolicy::Always, session)
            .unwrap();

        let abandoned = wal.append(WriteIntent::put("a", "1")).await.unwrap();
        let next = wal.append(WriteIntent::put("a", "2")).await.unwrap();
        assert_eq!(abandoned.version, 1);
        assert_eq!(next.version, 2);

        wal.record_commit(next.version).await.unwrap();
        let status = wal.status().await;
        assert_eq!(status.last_committed, 2);
        assert_eq!(status.pending, 1);
    }

    #[tokio::test]
    async fn test_coordination_outage_fails_append() {
        let dir = tempdir().unwrap();
        let (ensemble, session) = coordination().await;
        let wal = WalManager::open(dir.path().join("wal.log"), WalSyncPolicy::Always, session)
            .unwrap();

        ensemble.set_available(false);
        let err = wal.append(WriteIntent::delete("a")).await.unwrap_err();
        assert!(matches!(err, Error::CoordinationUnavailable(_)));
        assert_eq!(wal.latest_version().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_follower_commit_is_idempotent() {
        let dir = tempdir().unwrap();
        let (_ensemble, session) = coordination().await;
        let wal = WalManager::open(dir.path().join("wal.log"), WalSyncPolicy::Always, session)
            .unwrap();

        let entry = WalEntry {
            version: 7,
            operation: Operation::Put,
            key: "a".into(),
            value: "1".into(),
            committed: false,
        };
        assert!(wal.append_replicated(&entry).await.unwrap());
        assert!(!wal.append_replicated(&entry).await.unwrap());

        assert!(wal.commit_replicated(&entry).await.unwrap());
        assert!(!wal.commit_replicated(&entry).await.unwrap());
        assert!(!wal.mark_committed(7).await.unwrap());

        // an older version overtaken by a newer commit is still accepted
        let older = WalEntry {
            version: 6,
            ..entry.clone()
        };
        assert!(wal.append_replicated(&older).await.unwrap());
        assert!(wal.commit_replicated(&older).await.unwrap());

        let status = wal.status().await;
        assert_eq!(status.last_committed, 7);
        assert_eq!(status.pending, 0);
    }

    #[tokio::test]
    async fn test_commit_without_prepare_appends_entry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let (_ensemble, session) = coordination().await;
        let wal = WalManager::open(&path, WalSyncPolicy::Always, session).unwrap();

        let entry = WalEntry {
            version: 4,
            operation: Operation::Delete,
            key: "gone".into(),
            value: String::new(),
            committed: false,
        };
        assert!(wal.commit_replicated(&entry).await.unwrap());

        let replay = wal.replay().await.unwrap();
        assert_eq!(replay.entries.len(), 1);
        assert!(replay.entries[0].committed);
    }

    #[tokio::test]
    async fn test_reopen_recovers_counter_and_commit_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let (_ensemble, session) = coordination().await;

        {
            let wal = WalManager::open(&path, WalSyncPolicy::Always, session.clone()).unwrap();
            for key in ["a", "b", "c"] {
                let entry = wal.append(WriteIntent::put(key, "v")).await.unwrap();
                wal.record_commit(entry.version).await.unwrap();
            }
            // pending, never committed
            wal.append(WriteIntent::put("d", "v")).await.unwrap();
        }

        let wal = WalManager::open(&path, WalSyncPolicy::Always, session).unwrap();
        let status = wal.status().await;
        assert_eq!(status.last_version, 4);
        assert_eq!(status.last_committed, 3);
        assert_eq!(status.pending, 1);

        let entry = wal.append(WriteIntent::put("e", "v")).await.unwrap();
        assert_eq!(entry.version, 5);
    }

    #[tokio::test]
    async fn test_concurrent_appends_get_unique_versions() {
        let dir = tempdir().unwrap();
        let (_ensemble, session) = coordination().await;
        let wal = Arc::new(
            WalManager::open(dir.path().join("wal.log"), WalSyncPolicy::Never, session).unwrap(),
        );

        let mut handles = Vec::new();
        for i in 0..16 {
            let wal = wal.clone();
            handles.push(tokio::spawn(async move {
                wal.append(WriteIntent::put(format!("k{}", i), "v"))
                    .await
                    .unwrap()
                    .version
            }));
        }
        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await.unwrap());
        }
        versions.sort_unstable();
        assert_eq!(versions, (1..=16).collect::<Vec<u64>>());
    }
}
