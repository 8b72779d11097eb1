use crate::progress::Progress;
use shale_core::{CasClient, ListMode, ObjectKey, Result, ShaleError, WriterSink};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Filters shared by the listing-driven verbs.
#[derive(Clone, Copy)]
pub struct ListFilter {
    pub mode: ListMode,
    pub min_size: u64,
    pub max_size: u64,
}

pub async fn get(client: &CasClient, keys: &[String]) -> Result<()> {
    if keys.is_empty() {
        return Err(ShaleError::InvalidRequest(
            "the 'get' command takes at least one key".to_string(),
        ));
    }

    let mut failed = false;
    for key in keys {
        let mut sink = WriterSink::new(tokio::io::stdout());
        if let Err(error) = client.get_stream(key, &mut sink).await {
            eprintln!("error retrieving {}: {}", key, error);
            failed = true;
        }
    }

    if failed {
        return Err(ShaleError::Internal(
            "some objects could not be retrieved".to_string(),
        ));
    }
    Ok(())
}

pub async fn put(client: &CasClient, paths: &[PathBuf]) -> Result<()> {
    if paths.is_empty() {
        let mut data = Vec::new();
        tokio::io::stdin().read_to_end(&mut data).await?;
        println!("{}", client.put(&data, true).await?);
        return Ok(());
    }

    for path in paths {
        let data = tokio::fs::read(path).await?;
        println!("{}", client.put(&data, true).await?);
    }
    Ok(())
}

pub async fn remove(client: &CasClient, keys: &[String]) -> Result<()> {
    if keys.is_empty() {
        return Err(ShaleError::InvalidRequest(
            "the 'rm' command takes at least one key".to_string(),
        ));
    }

    for key in keys {
        client.remove(ObjectKey::parse(key)?).await?;
    }
    Ok(())
}

pub async fn list(client: &CasClient, filter: ListFilter) -> Result<()> {
    client
        .list(filter.mode, filter.min_size, filter.max_size, |key| {
            println!("{}", key.to_hex());
        })
        .await
}

pub async fn capacity(client: &CasClient) -> Result<()> {
    let capacity = client.capacity().await?;
    println!(
        "total       {}\navailable   {}\nunreclaimed {}\ngarbage     {}",
        capacity.total, capacity.available, capacity.unreclaimed, capacity.garbage
    );
    Ok(())
}

pub async fn compact(client: &CasClient) -> Result<()> {
    client.compact(true).await
}

pub async fn begin_gc(client: &CasClient) -> Result<()> {
    println!("{}", client.begin_gc().await?);
    Ok(())
}

pub async fn mark_gc(client: &CasClient, keys: &[String]) -> Result<()> {
    let keys = keys
        .iter()
        .map(|key| ObjectKey::parse(key))
        .collect::<Result<Vec<_>>>()?;
    client.mark_gc(&keys).await
}

pub async fn end_gc(client: &CasClient, id: u64) -> Result<()> {
    client.end_gc(id).await
}

pub async fn ping(client: &CasClient) -> Result<()> {
    client.on_connect().await
}

/// Exports objects as length-framed records: 20 key bytes, a little-endian
/// u64 body length, then the body. Keys come from `list_path` (hex lines,
/// `-` for stdin) or from the server listing; `--exclude` files subtract
/// keys.
pub async fn export(
    client: &CasClient,
    list_path: Option<&Path>,
    filter: ListFilter,
    exclude: &[PathBuf],
) -> Result<()> {
    let mut objects: HashSet<ObjectKey> = HashSet::new();

    match list_path {
        Some(path) if path.as_os_str() == "-" => {
            let mut text = String::new();
            tokio::io::stdin().read_to_string(&mut text).await?;
            collect_keys(&text, &mut objects)?;
        }
        Some(path) => {
            let text = tokio::fs::read_to_string(path).await?;
            collect_keys(&text, &mut objects)?;
        }
        None => {
            client
                .list(filter.mode, filter.min_size, filter.max_size, |key| {
                    objects.insert(key);
                })
                .await?;
        }
    }

    for path in exclude {
        let text = tokio::fs::read_to_string(path).await?;
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            objects.remove(&ObjectKey::parse(line.trim())?);
        }
    }

    let mut queue: Vec<ObjectKey> = objects.into_iter().collect();
    queue.sort();

    let progress = Progress::new(queue.len(), "objects");
    let mut stdout = tokio::io::stdout();
    for key in queue {
        let data = client.get(&key.to_hex()).await?;
        stdout.write_all(key.as_bytes()).await?;
        stdout.write_all(&(data.len() as u64).to_le_bytes()).await?;
        stdout.write_all(&data).await?;
        progress.put(1);
    }
    stdout.flush().await?;

    Ok(())
}

fn collect_keys(text: &str, objects: &mut HashSet<ObjectKey>) -> Result<()> {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        objects.insert(ObjectKey::parse(line)?);
    }
    Ok(())
}
