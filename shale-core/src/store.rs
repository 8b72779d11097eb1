use crate::aio::{DEFAULT_IO_WORKERS, DiskIo};
use crate::error::{Result, ShaleError};
use crate::index::{DATA_FILE_COUNT, INDEX_ENTRY_SIZE, IndexEntry, IndexSet};
use crate::key::ObjectKey;
use crate::sink::ByteSink;
use bytes::Bytes;
use futures_util::{Stream, StreamExt, pin_mut};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Read and stream-write granularity for `get` and compaction drains.
pub const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// One consistent-hash bucket is drawn per this many bytes of capacity.
const HASH_BUCKET_SIZE: u64 = 128 * 1024 * 1024;

const INDEX_REWRITE_BATCH: usize = 65536;

#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOptions {
    /// Refuse `get` and `list`; the node only accepts writes.
    pub disable_read: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub total: u64,
    pub available: u64,
    pub unreclaimed: u64,
    pub garbage: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// The key was already present; the incoming bytes were discarded.
    Existed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListMode {
    Default,
    Garbage,
}

impl FromStr for ListMode {
    type Err = ShaleError;

    fn from_str(text: &str) -> Result<Self> {
        match text {
            "default" => Ok(ListMode::Default),
            "garbage" => Ok(ListMode::Garbage),
            other => Err(ShaleError::InvalidRequest(format!(
                "unknown list mode '{}'",
                other
            ))),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ConfigDocument {
    buckets: Vec<ObjectKey>,
}

struct EngineState {
    index_file: Arc<File>,
    index: IndexSet,
    /// (length, file index) for every data file not currently being drained.
    /// The minimum is the append target for the next put.
    allocation: BinaryHeap<Reverse<(u64, usize)>>,
    utilization: [u64; DATA_FILE_COUNT],
    marks: HashSet<ObjectKey>,
    garbage_size: u64,
    gc_id: u64,
    index_dirty: bool,
    compacting: Option<usize>,
}

impl EngineState {
    fn unmark(&mut self, key: &ObjectKey, size: u32) {
        if self.marks.remove(key) {
            self.garbage_size -= size as u64;
        }
    }

    fn unreclaimed_space(&self) -> u64 {
        self.allocation
            .iter()
            .map(|Reverse((length, index))| length - self.utilization[*index])
            .sum()
    }
}

/// A single-node append-only object store.
///
/// On-disk truth is the `index` log plus the data files; everything in
/// memory is derived from replaying the log at open.
pub struct StoreEngine {
    dir: PathBuf,
    aio: DiskIo,
    data_files: Vec<Arc<File>>,
    buckets: Vec<ObjectKey>,
    config_bytes: Bytes,
    options: StoreOptions,
    state: Mutex<EngineState>,
}

impl StoreEngine {
    pub fn open(dir: impl Into<PathBuf>, options: StoreOptions) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let index_file = open_append(&dir.join("index"))?;
        truncate_partial_tail(&index_file)?;

        let mut data_files = Vec::with_capacity(DATA_FILE_COUNT);
        let mut allocation = BinaryHeap::with_capacity(DATA_FILE_COUNT);
        for file_index in 0..DATA_FILE_COUNT {
            let file = open_append(&dir.join(data_file_name(file_index)))?;
            allocation.push(Reverse((file.metadata()?.len(), file_index)));
            data_files.push(Arc::new(file));
        }

        let mut index = IndexSet::default();
        let mut utilization = [0u64; DATA_FILE_COUNT];
        let index_dirty = replay_index(&index_file, &mut index, &mut utilization)?;

        let buckets = load_or_create_buckets(&dir)?;
        let config_bytes = Bytes::from(serde_json::to_vec(&ConfigDocument {
            buckets: buckets.clone(),
        })?);

        tracing::info!(
            "opened repository at {:?}: {} objects, {} buckets",
            dir,
            index.len(),
            buckets.len()
        );

        Ok(Self {
            dir,
            aio: DiskIo::new(DEFAULT_IO_WORKERS),
            data_files,
            buckets,
            config_bytes,
            options,
            state: Mutex::new(EngineState {
                index_file: Arc::new(index_file),
                index,
                allocation,
                utilization,
                marks: HashSet::new(),
                garbage_size: 0,
                gc_id: 0,
                index_dirty,
                compacting: None,
            }),
        })
    }

    pub fn buckets(&self) -> &[ObjectKey] {
        &self.buckets
    }

    pub fn config_bytes(&self) -> Bytes {
        self.config_bytes.clone()
    }

    /// Stores `data` under `key`. The digest of `data` must equal `key`;
    /// a mismatch commits nothing. Storing an existing key discards the
    /// bytes and reports `Existed`.
    pub async fn put(&self, key: ObjectKey, data: Bytes, sync: bool) -> Result<PutOutcome> {
        {
            let mut state = self.state.lock().await;
            if let Some(entry) = state.index.get(&key).copied() {
                state.unmark(&key, entry.size);
                return Ok(PutOutcome::Existed);
            }
        }

        let digest = ObjectKey::digest_of(&data);
        if digest != key {
            return Err(ShaleError::DigestMismatch {
                expected: key.to_hex(),
                actual: digest.to_hex(),
            });
        }

        let (data_file, index_file) = {
            let mut state = self.state.lock().await;
            if state.index.contains(&key) {
                return Ok(PutOutcome::Existed);
            }
            let (file, _) = self.append_object(&mut state, key, &data)?;
            (file, state.index_file.clone())
        };

        if sync {
            self.aio.fsync(data_file).await?;
            self.aio.fsync(index_file).await?;
        }

        Ok(PutOutcome::Stored)
    }

    /// Appends to the shortest data file and records the new index entry.
    /// Must run with the state lock held; the allocation heap makes this
    /// non-reentrant by construction.
    fn append_object(
        &self,
        state: &mut EngineState,
        key: ObjectKey,
        data: &[u8],
    ) -> Result<(Arc<File>, IndexEntry)> {
        let Reverse((length, file_index)) = state
            .allocation
            .pop()
            .ok_or_else(|| ShaleError::Internal("no data file available for writes".to_string()))?;

        let file = self.data_files[file_index].clone();
        if let Err(error) = (&*file).write_all(data) {
            // A partial append leaves an orphan region; compaction reclaims it.
            let actual = file.metadata().map(|meta| meta.len()).unwrap_or(length);
            state.allocation.push(Reverse((actual, file_index)));
            return Err(error.into());
        }

        state
            .allocation
            .push(Reverse((length + data.len() as u64, file_index)));
        state.utilization[file_index] += data.len() as u64;

        let entry = IndexEntry::pack(file_index, length, data.len() as u32, key);
        (&*state.index_file).write_all(&entry.encode())?;
        state.index.insert(entry);

        Ok((file, entry))
    }

    /// Resolves a read of `size` bytes at `offset`, clamped to the object's
    /// length. Reading a GC-marked key un-marks it.
    pub async fn get(&self, key: ObjectKey, offset: u64, size: u64) -> Result<ObjectRead> {
        if self.options.disable_read {
            return Err(ShaleError::ReadDisabled);
        }

        let entry = {
            let mut state = self.state.lock().await;
            let entry = state
                .index
                .get(&key)
                .copied()
                .ok_or_else(|| ShaleError::ObjectNotFound(key.to_hex()))?;
            state.unmark(&key, entry.size);
            entry
        };

        let object_size = entry.size as u64;
        if offset > object_size {
            return Err(ShaleError::InvalidRequest(format!(
                "offset {} beyond object size {}",
                offset, object_size
            )));
        }
        let read_size = size.min(object_size - offset);

        Ok(ObjectRead {
            aio: self.aio.clone(),
            file: self.data_files[entry.data_file_index()].clone(),
            position: entry.byte_offset() + offset,
            remaining: read_size,
            size: read_size,
        })
    }

    /// Appends a tombstone and forgets the key. Returns whether the key was
    /// present.
    pub async fn remove(&self, key: ObjectKey) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.index.get(&key).copied() else {
            return Ok(false);
        };

        state.utilization[entry.data_file_index()] -= entry.size as u64;
        state.unmark(&key, entry.size);
        state.index.remove(&key);
        (&*state.index_file).write_all(&entry.tombstone().encode())?;
        state.index_dirty = true;

        Ok(true)
    }

    /// Snapshot of the live index, filtered by size range (and by the mark
    /// set in `Garbage` mode), ordered by packed offset for scan locality.
    pub async fn list(
        &self,
        mode: ListMode,
        min_size: u64,
        max_size: u64,
    ) -> Result<Vec<IndexEntry>> {
        if self.options.disable_read {
            return Err(ShaleError::ReadDisabled);
        }

        let state = self.state.lock().await;
        let mut entries: Vec<IndexEntry> = state
            .index
            .iter()
            .filter(|entry| {
                let size = entry.size as u64;
                size >= min_size && size < max_size
            })
            .filter(|entry| mode == ListMode::Default || state.marks.contains(&entry.key))
            .copied()
            .collect();
        entries.sort_by_key(|entry| entry.offset);

        Ok(entries)
    }

    pub async fn capacity(&self) -> Result<Capacity> {
        let (total, available) = filesystem_space(&self.dir)?;
        let state = self.state.lock().await;
        Ok(Capacity {
            total,
            available,
            unreclaimed: state.unreclaimed_space(),
            garbage: state.garbage_size,
        })
    }

    /// Starts a collection cycle: every live key becomes candidate garbage.
    pub async fn begin_gc(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        let state = &mut *state;
        state.gc_id = (state.gc_id + 1).max(wall_clock_usec());

        state.marks = state.index.iter().map(|entry| entry.key).collect();
        state.garbage_size = state.index.iter().map(|entry| entry.size as u64).sum();

        Ok(state.gc_id)
    }

    /// Un-marks keepers: each key named here is no longer candidate garbage.
    pub async fn mark_gc(&self, keys: &[ObjectKey]) -> Result<()> {
        let mut state = self.state.lock().await;
        for key in keys {
            if state.marks.remove(key) {
                let entry = state.index.get(key).copied().ok_or_else(|| {
                    ShaleError::Internal(format!("marked key {} missing from index", key))
                })?;
                state.garbage_size -= entry.size as u64;
            }
        }
        Ok(())
    }

    /// Sweeps every still-marked key. Fails if another cycle began after
    /// the one that produced `id`.
    pub async fn end_gc(&self, id: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        if id != state.gc_id {
            return Err(ShaleError::GcConflict {
                submitted: id,
                current: state.gc_id,
            });
        }

        let swept: Vec<IndexEntry> = state
            .marks
            .iter()
            .filter_map(|key| state.index.get(key).copied())
            .collect();

        let mut tombstones = Vec::with_capacity(swept.len() * INDEX_ENTRY_SIZE);
        for entry in &swept {
            state.utilization[entry.data_file_index()] -= entry.size as u64;
            state.index.remove(&entry.key);
            tombstones.extend_from_slice(&entry.tombstone().encode());
        }
        (&*state.index_file).write_all(&tombstones)?;

        tracing::info!("garbage collection {} swept {} objects", id, swept.len());

        state.gc_id = 0;
        state.marks = HashSet::new();
        state.garbage_size = 0;
        state.index_dirty = true;

        Ok(())
    }

    /// Reclaims space from the data file with the most dead bytes by moving
    /// its live entries into the other files and truncating it. When every
    /// data file is fully utilized, rewrites the index log instead. A no-op
    /// while another compaction is running.
    pub async fn compact(&self, sync: bool) -> Result<()> {
        let (file_index, keep_prefix, moves) = {
            let mut state = self.state.lock().await;
            if state.compacting.is_some() {
                return Ok(());
            }

            let mut selected: Option<(u64, usize)> = None;
            for Reverse((length, index)) in state.allocation.iter() {
                let unreclaimed = length - state.utilization[*index];
                if unreclaimed > selected.map_or(0, |(best, _)| best) {
                    selected = Some((unreclaimed, *index));
                }
            }

            let Some((_, file_index)) = selected else {
                return self.rewrite_index(&mut state, sync);
            };

            // Take the file out of the allocation heap so concurrent puts
            // cannot target it while it drains.
            state
                .allocation
                .retain(|Reverse((_, index))| *index != file_index);
            state.utilization[file_index] = 0;
            state.compacting = Some(file_index);

            let mut entries: Vec<IndexEntry> = state
                .index
                .iter()
                .filter(|entry| entry.data_file_index() == file_index)
                .copied()
                .collect();
            entries.sort_by_key(|entry| entry.byte_offset());

            let mut keep_prefix = 0u64;
            let mut moves = Vec::new();
            for entry in entries {
                if entry.byte_offset() == keep_prefix {
                    keep_prefix += entry.size as u64;
                } else {
                    moves.push(entry);
                }
            }

            (file_index, keep_prefix, moves)
        };

        let moved = moves.len();
        let result = self
            .drain_data_file(file_index, keep_prefix, moves, sync)
            .await;

        let mut state = self.state.lock().await;
        state.compacting = None;
        match result {
            Ok(()) => {
                state.allocation.push(Reverse((keep_prefix, file_index)));
                state.utilization[file_index] = keep_prefix;
                tracing::info!(
                    "compacted {}: kept {} bytes, moved {} objects",
                    data_file_name(file_index),
                    keep_prefix,
                    moved
                );
                Ok(())
            }
            Err(error) => {
                // Put the file back with whatever length it has now; its
                // remaining live entries are still valid.
                let length = self.data_files[file_index]
                    .metadata()
                    .map(|meta| meta.len())
                    .unwrap_or(keep_prefix);
                let live_bytes: u64 = state
                    .index
                    .iter()
                    .filter(|entry| entry.data_file_index() == file_index)
                    .map(|entry| entry.size as u64)
                    .sum();
                state.allocation.push(Reverse((length, file_index)));
                state.utilization[file_index] = live_bytes;
                Err(error)
            }
        }
    }

    async fn drain_data_file(
        &self,
        file_index: usize,
        keep_prefix: u64,
        moves: Vec<IndexEntry>,
        sync: bool,
    ) -> Result<()> {
        for entry in moves {
            let data = self
                .aio
                .pread(
                    self.data_files[file_index].clone(),
                    entry.byte_offset(),
                    entry.size as usize,
                )
                .await?;

            let mut state = self.state.lock().await;
            // The entry may have been removed or swept since selection.
            match state.index.get(&entry.key) {
                Some(current) if *current == entry => {}
                _ => continue,
            }
            state.index.remove(&entry.key);
            self.append_object(&mut state, entry.key, &data)?;
        }

        if sync {
            // Commit every move before truncating the drained file.
            for (index, file) in self.data_files.iter().enumerate() {
                if index != file_index {
                    self.aio.fsync(file.clone()).await?;
                }
            }
            let index_file = self.state.lock().await.index_file.clone();
            self.aio.fsync(index_file).await?;
        }

        self.data_files[file_index].set_len(keep_prefix)?;
        Ok(())
    }

    /// Rewrites the index log with only the live entries and renames it
    /// into place.
    fn rewrite_index(&self, state: &mut EngineState, sync: bool) -> Result<()> {
        if !state.index_dirty {
            return Ok(());
        }

        let rewrite_path = self.dir.join("index.rewrite");
        let mut rewrite = File::create(&rewrite_path)?;

        let mut buffer = Vec::with_capacity(INDEX_REWRITE_BATCH * INDEX_ENTRY_SIZE);
        for entry in state.index.iter() {
            buffer.extend_from_slice(&entry.encode());
            if buffer.len() == INDEX_REWRITE_BATCH * INDEX_ENTRY_SIZE {
                rewrite.write_all(&buffer)?;
                buffer.clear();
            }
        }
        if !buffer.is_empty() {
            rewrite.write_all(&buffer)?;
        }

        if sync {
            rewrite.sync_data()?;
        }

        let index_path = self.dir.join("index");
        std::fs::rename(&rewrite_path, &index_path)?;

        state.index_file = Arc::new(open_append(&index_path)?);
        state.index_dirty = false;

        tracing::info!("rewrote index with {} live entries", state.index.len());
        Ok(())
    }
}

/// An in-flight read: the resolved data-file window of one object.
pub struct ObjectRead {
    aio: DiskIo,
    file: Arc<File>,
    position: u64,
    remaining: u64,
    size: u64,
}

impl ObjectRead {
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Chunked stream over the object window. Each chunk is one pread; the
    /// next pread is not issued until the chunk has been consumed.
    pub fn into_stream(self) -> impl Stream<Item = std::io::Result<Bytes>> + Send {
        futures_util::stream::unfold(self, |mut read| async move {
            if read.remaining == 0 {
                return None;
            }
            let amount = read.remaining.min(CHUNK_SIZE as u64) as usize;
            match read
                .aio
                .pread(read.file.clone(), read.position, amount)
                .await
            {
                Ok(chunk) => {
                    read.position += amount as u64;
                    read.remaining -= amount as u64;
                    Some((Ok(chunk), read))
                }
                Err(error) => {
                    read.remaining = 0;
                    Some((Err(std::io::Error::other(error.to_string())), read))
                }
            }
        })
    }

    /// Drives the full window into `sink`.
    pub async fn write_into(self, sink: &mut dyn ByteSink) -> Result<()> {
        sink.expect_size(self.size).await?;
        let stream = self.into_stream();
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            sink.write(chunk?).await?;
        }
        sink.done().await
    }

    pub async fn read_all(self) -> Result<Bytes> {
        let mut buffer = Vec::with_capacity(self.size as usize);
        let stream = self.into_stream();
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(buffer))
    }
}

fn data_file_name(index: usize) -> String {
    if index == 0 {
        "data".to_string()
    } else {
        format!("data.{:02}", index)
    }
}

fn open_append(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)?)
}

fn truncate_partial_tail(index_file: &File) -> Result<()> {
    let length = index_file.metadata()?.len();
    let remainder = length % INDEX_ENTRY_SIZE as u64;
    if remainder != 0 {
        index_file.set_len(length - remainder)?;
    }
    Ok(())
}

/// Replays the index log into memory. Returns whether any tombstones were
/// seen, which marks the log as worth rewriting.
fn replay_index(
    index_file: &File,
    index: &mut IndexSet,
    utilization: &mut [u64; DATA_FILE_COUNT],
) -> Result<bool> {
    let length = index_file.metadata()?.len();
    let entry_count = (length / INDEX_ENTRY_SIZE as u64) as usize;
    let mut dirty = false;

    let mut buffer = vec![0u8; 1024 * INDEX_ENTRY_SIZE];
    let mut read_position = 0usize;

    while read_position < entry_count {
        let batch = (entry_count - read_position).min(1024);
        let bytes = &mut buffer[..batch * INDEX_ENTRY_SIZE];
        index_file.read_exact_at(bytes, (read_position * INDEX_ENTRY_SIZE) as u64)?;

        for record in bytes.chunks_exact(INDEX_ENTRY_SIZE) {
            let entry = IndexEntry::decode(record.try_into().expect("exact chunk"));

            if let Some(previous) = index.remove(&entry.key) {
                utilization[previous.data_file_index()] -= previous.size as u64;
            }

            if entry.is_tombstone() {
                dirty = true;
            } else {
                utilization[entry.data_file_index()] += entry.size as u64;
                index.insert(entry);
            }
        }

        read_position += batch;
    }

    Ok(dirty)
}

/// Creates the repository's bucket list on first open: one random 20-byte
/// key per 128 MiB of filesystem capacity, sorted, written exactly once.
fn load_or_create_buckets(dir: &Path) -> Result<Vec<ObjectKey>> {
    let config_path = dir.join("config");

    match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&config_path)
    {
        Ok(mut config_file) => {
            let (total, _) = filesystem_space(dir)?;
            let bucket_count = total.div_ceil(HASH_BUCKET_SIZE).max(1);

            let mut rng = rand::thread_rng();
            let mut buckets = Vec::with_capacity(bucket_count as usize);
            for _ in 0..bucket_count {
                let mut bytes = [0u8; 20];
                rng.fill_bytes(&mut bytes);
                buckets.push(ObjectKey::from_bytes(&bytes)?);
            }
            buckets.sort();

            config_file.write_all(&serde_json::to_vec(&ConfigDocument {
                buckets: buckets.clone(),
            })?)?;
            config_file.sync_data()?;

            tracing::info!("created {} hash buckets", buckets.len());
        }
        Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(error) => return Err(error.into()),
    }

    let document: ConfigDocument = serde_json::from_slice(&std::fs::read(&config_path)?)?;
    Ok(document.buckets)
}

fn filesystem_space(path: &Path) -> Result<(u64, u64)> {
    let path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| ShaleError::Internal("repository path contains NUL".to_string()))?;

    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(path.as_ptr(), &mut stats) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    let fragment = stats.f_frsize as u64;
    Ok((
        fragment * stats.f_blocks as u64,
        fragment * stats.f_bavail as u64,
    ))
}

fn wall_clock_usec() -> u64 {
    chrono::Utc::now().timestamp_micros().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_engine(dir: &TempDir) -> StoreEngine {
        StoreEngine::open(dir.path(), StoreOptions::default()).unwrap()
    }

    async fn put_bytes(engine: &StoreEngine, data: &[u8]) -> ObjectKey {
        let key = ObjectKey::digest_of(data);
        engine
            .put(key, Bytes::copy_from_slice(data), false)
            .await
            .unwrap();
        key
    }

    async fn get_bytes(engine: &StoreEngine, key: ObjectKey) -> Bytes {
        engine
            .get(key, 0, u64::MAX)
            .await
            .unwrap()
            .read_all()
            .await
            .unwrap()
    }

    fn index_length(dir: &TempDir) -> u64 {
        std::fs::metadata(dir.path().join("index")).unwrap().len()
    }

    #[tokio::test]
    async fn put_then_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(&dir);

        let data = b"the quick brown fox".to_vec();
        let key = put_bytes(&engine, &data).await;
        assert_eq!(get_bytes(&engine, key).await, data.as_slice());
    }

    #[tokio::test]
    async fn empty_object_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(&dir);

        let key = put_bytes(&engine, b"").await;
        assert_eq!(key.to_hex(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
        assert!(get_bytes(&engine, key).await.is_empty());
    }

    #[tokio::test]
    async fn ranged_get_clamps() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(&dir);

        let key = put_bytes(&engine, b"0123456789").await;

        let read = engine.get(key, 4, 3).await.unwrap();
        assert_eq!(read.read_all().await.unwrap(), Bytes::from_static(b"456"));

        let clamped = engine.get(key, 8, 100).await.unwrap();
        assert_eq!(clamped.size(), 2);
        assert_eq!(clamped.read_all().await.unwrap(), Bytes::from_static(b"89"));

        assert!(engine.get(key, 11, 1).await.is_err());
    }

    #[tokio::test]
    async fn duplicate_put_writes_no_index_record() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(&dir);

        let data = Bytes::from_static(b"only once");
        let key = ObjectKey::digest_of(&data);

        assert_eq!(
            engine.put(key, data.clone(), false).await.unwrap(),
            PutOutcome::Stored
        );
        let length_after_first = index_length(&dir);

        assert_eq!(
            engine.put(key, data, false).await.unwrap(),
            PutOutcome::Existed
        );
        assert_eq!(index_length(&dir), length_after_first);
    }

    #[tokio::test]
    async fn digest_mismatch_commits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(&dir);

        let wrong_key = ObjectKey::digest_of(b"something else");
        let result = engine
            .put(wrong_key, Bytes::from_static(b"payload"), true)
            .await;
        assert!(matches!(result, Err(ShaleError::DigestMismatch { .. })));

        assert_eq!(index_length(&dir), 0);
        let listed = engine.list(ListMode::Default, 0, u64::MAX).await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn remove_then_replay() {
        let dir = tempfile::tempdir().unwrap();

        let kept;
        let removed;
        {
            let engine = open_engine(&dir);
            kept = put_bytes(&engine, b"keep me").await;
            removed = put_bytes(&engine, b"drop me").await;
            assert!(engine.remove(removed).await.unwrap());
            assert!(!engine.remove(removed).await.unwrap());
        }

        // Three records: two entries and one tombstone.
        assert_eq!(index_length(&dir), 3 * INDEX_ENTRY_SIZE as u64);

        let engine = open_engine(&dir);
        assert_eq!(get_bytes(&engine, kept).await, Bytes::from_static(b"keep me"));
        assert!(matches!(
            engine.get(removed, 0, u64::MAX).await,
            Err(ShaleError::ObjectNotFound(_))
        ));

        let listed = engine.list(ListMode::Default, 0, u64::MAX).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, kept);
    }

    #[tokio::test]
    async fn list_filters_by_size() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(&dir);

        let small = put_bytes(&engine, b"ab").await;
        let large = put_bytes(&engine, &vec![7u8; 1000]).await;

        let all = engine.list(ListMode::Default, 0, u64::MAX).await.unwrap();
        assert_eq!(all.len(), 2);

        let only_small = engine.list(ListMode::Default, 0, 100).await.unwrap();
        assert_eq!(only_small.len(), 1);
        assert_eq!(only_small[0].key, small);

        let only_large = engine.list(ListMode::Default, 100, u64::MAX).await.unwrap();
        assert_eq!(only_large.len(), 1);
        assert_eq!(only_large[0].key, large);

        // max_size is exclusive.
        let none = engine.list(ListMode::Default, 1000, 1000).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn buckets_are_stable_across_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let first = open_engine(&dir).buckets().to_vec();
        assert!(!first.is_empty());
        assert!(first.windows(2).all(|pair| pair[0] < pair[1]));

        let second = open_engine(&dir).buckets().to_vec();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn gc_keeps_marked_objects() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(&dir);

        let keeper = put_bytes(&engine, b"keeper").await;
        let garbage = put_bytes(&engine, b"garbage").await;

        let id = engine.begin_gc().await.unwrap();

        let marked = engine.list(ListMode::Garbage, 0, u64::MAX).await.unwrap();
        assert_eq!(marked.len(), 2);

        engine.mark_gc(&[keeper]).await.unwrap();

        let still_marked = engine.list(ListMode::Garbage, 0, u64::MAX).await.unwrap();
        assert_eq!(still_marked.len(), 1);
        assert_eq!(still_marked[0].key, garbage);

        engine.end_gc(id).await.unwrap();

        let remaining = engine.list(ListMode::Default, 0, u64::MAX).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].key, keeper);
        assert!(matches!(
            engine.get(garbage, 0, u64::MAX).await,
            Err(ShaleError::ObjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn second_begin_gc_invalidates_first() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(&dir);

        put_bytes(&engine, b"survivor").await;

        let first = engine.begin_gc().await.unwrap();
        let second = engine.begin_gc().await.unwrap();
        assert_ne!(first, second);

        assert!(matches!(
            engine.end_gc(first).await,
            Err(ShaleError::GcConflict { .. })
        ));

        // The object survives the rejected sweep.
        let listed = engine.list(ListMode::Default, 0, u64::MAX).await.unwrap();
        assert_eq!(listed.len(), 1);

        engine.end_gc(second).await.unwrap();
    }

    #[tokio::test]
    async fn get_unmarks_candidate_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(&dir);

        let key = put_bytes(&engine, b"read during gc").await;
        let id = engine.begin_gc().await.unwrap();

        let before = engine.capacity().await.unwrap();
        assert!(before.garbage > 0);

        get_bytes(&engine, key).await;

        let after = engine.capacity().await.unwrap();
        assert_eq!(after.garbage, 0);

        engine.end_gc(id).await.unwrap();
        assert!(engine.get(key, 0, u64::MAX).await.is_ok());
    }

    #[tokio::test]
    async fn repeated_put_unmarks_candidate_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(&dir);

        let data = Bytes::from_static(b"written twice");
        let key = ObjectKey::digest_of(&data);
        engine.put(key, data.clone(), false).await.unwrap();

        let id = engine.begin_gc().await.unwrap();
        assert_eq!(
            engine.put(key, data, false).await.unwrap(),
            PutOutcome::Existed
        );
        engine.end_gc(id).await.unwrap();

        assert!(engine.get(key, 0, u64::MAX).await.is_ok());
    }

    #[tokio::test]
    async fn compaction_preserves_surviving_objects() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(&dir);

        let mut survivors = Vec::new();
        let mut victims = Vec::new();
        for i in 0..120u32 {
            let data = format!("object {:04} {}", i, "x".repeat(200));
            let key = put_bytes(&engine, data.as_bytes()).await;
            if i % 2 == 0 {
                survivors.push((key, data));
            } else {
                victims.push(key);
            }
        }

        for key in victims {
            assert!(engine.remove(key).await.unwrap());
        }

        let before = engine.capacity().await.unwrap();
        assert!(before.unreclaimed > 0);

        engine.compact(true).await.unwrap();

        for (key, data) in &survivors {
            assert_eq!(get_bytes(&engine, *key).await, data.as_bytes());
        }

        let after = engine.capacity().await.unwrap();
        assert!(after.unreclaimed < before.unreclaimed);

        // Repeated compaction keeps converging without losing anything.
        for _ in 0..DATA_FILE_COUNT {
            engine.compact(false).await.unwrap();
        }
        let settled = engine.capacity().await.unwrap();
        assert_eq!(settled.unreclaimed, 0);

        for (key, data) in &survivors {
            assert_eq!(get_bytes(&engine, *key).await, data.as_bytes());
        }
    }

    #[tokio::test]
    async fn interleaved_removes_and_compactions_stay_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(&dir);

        let mut objects: Vec<(ObjectKey, Vec<u8>)> = Vec::new();
        for i in 0..150u32 {
            let data =
                format!("{:03} {}", i, "y".repeat((i as usize * 37) % 400 + 1)).into_bytes();
            let key = put_bytes(&engine, &data).await;
            objects.push((key, data));

            if i > 50 {
                let victim = (i as usize * 13) % objects.len();
                let (removed, _) = objects.remove(victim);
                assert!(engine.remove(removed).await.unwrap());
                engine.compact(false).await.unwrap();

                let mut listed: Vec<ObjectKey> = engine
                    .list(ListMode::Default, 0, u64::MAX)
                    .await
                    .unwrap()
                    .iter()
                    .map(|entry| entry.key)
                    .collect();
                listed.sort();
                let mut expected: Vec<ObjectKey> =
                    objects.iter().map(|(key, _)| *key).collect();
                expected.sort();
                assert_eq!(listed, expected);
            }
        }

        for (key, data) in &objects {
            assert_eq!(get_bytes(&engine, *key).await, data.as_slice());
        }
    }

    #[tokio::test]
    async fn compaction_rewrites_dirty_index_when_nothing_to_drain() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(&dir);

        let keep = put_bytes(&engine, b"kept through rewrite").await;
        let drop_key = put_bytes(&engine, b"tombstoned").await;
        assert!(engine.remove(drop_key).await.unwrap());

        // Drain the dead bytes first, then the index rewrite pass.
        engine.compact(false).await.unwrap();
        engine.compact(false).await.unwrap();

        // Only live entries remain in the log.
        assert_eq!(index_length(&dir), INDEX_ENTRY_SIZE as u64);

        let engine = open_engine(&dir);
        assert_eq!(
            get_bytes(&engine, keep).await,
            Bytes::from_static(b"kept through rewrite")
        );
    }

    #[tokio::test]
    async fn partial_index_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let key;
        {
            let engine = open_engine(&dir);
            key = put_bytes(&engine, b"whole record").await;
        }

        // Simulate a crash mid-append: a torn trailing record.
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join("index"))
            .unwrap();
        file.write_all(&[0xab; 11]).unwrap();
        drop(file);

        let engine = open_engine(&dir);
        assert_eq!(index_length(&dir), INDEX_ENTRY_SIZE as u64);
        assert_eq!(
            get_bytes(&engine, key).await,
            Bytes::from_static(b"whole record")
        );
    }

    #[tokio::test]
    async fn disable_read_rejects_reads() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StoreEngine::open(
            dir.path(),
            StoreOptions {
                disable_read: true,
            },
        )
        .unwrap();

        let key = put_bytes(&engine, b"write only").await;
        assert!(matches!(
            engine.get(key, 0, u64::MAX).await,
            Err(ShaleError::ReadDisabled)
        ));
        assert!(matches!(
            engine.list(ListMode::Default, 0, u64::MAX).await,
            Err(ShaleError::ReadDisabled)
        ));
    }

    #[tokio::test]
    async fn capacity_reports_filesystem_figures() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(&dir);

        let capacity = engine.capacity().await.unwrap();
        assert!(capacity.total > 0);
        assert!(capacity.available <= capacity.total);
        assert_eq!(capacity.unreclaimed, 0);
        assert_eq!(capacity.garbage, 0);
    }
}
