use shale_core::{DATA_FILE_COUNT, INDEX_ENTRY_SIZE, IndexEntry, ObjectKey, Result, ShaleError};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// How many objects to digest-verify per repository. Entries are sampled,
/// so repeated runs improve coverage while the running time stays bounded.
const VERIFY_SAMPLE: usize = 10_000;

#[derive(Debug)]
struct Report {
    path: PathBuf,
    entries: usize,
    verified: usize,
}

/// Checks each repository on its own worker thread, bounded by the
/// machine's parallelism. Shared state is limited to the work queue and
/// the collected failures.
pub fn run(paths: &[PathBuf]) -> Result<()> {
    if paths.is_empty() {
        return Err(ShaleError::InvalidRequest(
            "the 'fsck' command takes at least one repository path".to_string(),
        ));
    }

    let queue: Mutex<VecDeque<PathBuf>> = Mutex::new(paths.iter().cloned().collect());
    let failures: Mutex<Vec<String>> = Mutex::new(Vec::new());

    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(paths.len());

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let path = {
                        let mut queue = queue.lock().expect("fsck queue poisoned");
                        queue.pop_front()
                    };
                    let Some(path) = path else { break };

                    match check_repository(&path) {
                        Ok(report) => {
                            println!(
                                "{}: {} entries, {} verified",
                                report.path.display(),
                                report.entries,
                                report.verified
                            );
                        }
                        Err(error) => {
                            let message = format!("{}: {}", path.display(), error);
                            eprintln!("{}", message);
                            failures
                                .lock()
                                .expect("fsck failure list poisoned")
                                .push(message);
                        }
                    }
                }
            });
        }
    });

    let failures = failures.into_inner().expect("fsck failure list poisoned");
    if failures.is_empty() {
        Ok(())
    } else {
        Err(ShaleError::Internal(format!(
            "{} repositories failed verification",
            failures.len()
        )))
    }
}

fn check_repository(path: &Path) -> Result<Report> {
    let index_bytes = std::fs::read(path.join("index"))?;

    // Replay the log: keep the last record per key, then drop tombstoned
    // objects.
    let mut live: HashMap<ObjectKey, IndexEntry> = HashMap::new();
    for record in index_bytes.chunks_exact(INDEX_ENTRY_SIZE) {
        let entry = IndexEntry::decode(record.try_into().expect("exact chunk"));
        if entry.is_tombstone() {
            live.remove(&entry.key);
        } else {
            live.insert(entry.key, entry);
        }
    }

    let mut data_files = Vec::with_capacity(DATA_FILE_COUNT);
    let mut data_sizes = Vec::with_capacity(DATA_FILE_COUNT);
    for file_index in 0..DATA_FILE_COUNT {
        let name = if file_index == 0 {
            "data".to_string()
        } else {
            format!("data.{:02}", file_index)
        };
        let file = File::open(path.join(name))?;
        data_sizes.push(file.metadata()?.len());
        data_files.push(file);
    }

    let mut entries: Vec<IndexEntry> = live.into_values().collect();
    for entry in &entries {
        let end = entry.byte_offset() + entry.size as u64;
        if end > data_sizes[entry.data_file_index()] {
            return Err(ShaleError::Internal(format!(
                "index entry for {} ends at {} beyond data file {} length {}",
                entry.key,
                end,
                entry.data_file_index(),
                data_sizes[entry.data_file_index()]
            )));
        }
    }

    let total = entries.len();

    // Order by offset to minimize seeks, then verify a bounded sample.
    entries.sort_by_key(|entry| entry.offset);
    let step = (total / VERIFY_SAMPLE).max(1);
    let mut verified = 0usize;

    for entry in entries.into_iter().step_by(step).take(VERIFY_SAMPLE) {
        let mut data = vec![0u8; entry.size as usize];
        data_files[entry.data_file_index()].read_exact_at(&mut data, entry.byte_offset())?;

        let digest = ObjectKey::digest_of(&data);
        if digest != entry.key {
            return Err(ShaleError::DigestMismatch {
                expected: entry.key.to_hex(),
                actual: digest.to_hex(),
            });
        }
        verified += 1;
    }

    Ok(Report {
        path: path.to_path_buf(),
        entries: total,
        verified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use shale_core::{StoreEngine, StoreOptions};

    #[tokio::test]
    async fn clean_repository_passes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = StoreEngine::open(dir.path(), StoreOptions::default()).unwrap();
            for i in 0..20u32 {
                let data = format!("fsck object {}", i);
                let key = ObjectKey::digest_of(data.as_bytes());
                engine
                    .put(key, Bytes::from(data.into_bytes()), false)
                    .await
                    .unwrap();
            }
            let dropped = ObjectKey::digest_of(b"fsck object 3");
            engine.remove(dropped).await.unwrap();
        }

        let report = check_repository(dir.path()).unwrap();
        assert_eq!(report.entries, 19);
        assert_eq!(report.verified, 19);

        run(&[dir.path().to_path_buf()]).unwrap();
    }

    #[tokio::test]
    async fn corrupted_object_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let key = ObjectKey::digest_of(b"soon to be flipped");
        {
            let engine = StoreEngine::open(dir.path(), StoreOptions::default()).unwrap();
            engine
                .put(key, Bytes::from_static(b"soon to be flipped"), true)
                .await
                .unwrap();
        }

        // Flip a byte in whichever data file holds the object.
        for file_index in 0..DATA_FILE_COUNT {
            let name = if file_index == 0 {
                "data".to_string()
            } else {
                format!("data.{:02}", file_index)
            };
            let path = dir.path().join(name);
            if std::fs::metadata(&path).unwrap().len() > 0 {
                let mut bytes = std::fs::read(&path).unwrap();
                bytes[0] ^= 0xff;
                std::fs::write(&path, bytes).unwrap();
            }
        }

        let error = check_repository(dir.path()).unwrap_err();
        assert!(matches!(error, ShaleError::DigestMismatch { .. }));
    }
}
