use crate::progress::Progress;
use futures_util::StreamExt;
use futures_util::stream;
use shale_core::{
    BalancerConfig, CollectSink, ListMode, ObjectKey, Result, ShaleError, ShardingInfo,
};

/// Restores proper object placement after an outage or a topology change:
/// every object ends up on exactly its replica set, surplus copies are
/// removed.
pub async fn run(config_path: &str, min_size: u64, max_size: u64) -> Result<()> {
    let config = BalancerConfig::from_file(config_path)?;
    let sharding = ShardingInfo::from_config(&config).await?;
    let backends = sharding.backends();

    eprintln!(
        "got {} buckets in {} backends",
        sharding.bucket_count(),
        backends.len()
    );

    // Where every object currently lives: (key, holder index), sorted so
    // equal keys group together.
    let mut presence: Vec<(ObjectKey, usize)> = Vec::new();
    {
        let list_progress = Progress::new(backends.len(), "backends");
        for (index, backend) in backends.iter().enumerate() {
            backend
                .client
                .list(ListMode::Default, min_size, max_size, |key| {
                    presence.push((key, index));
                })
                .await?;
            list_progress.put(1);
        }
    }
    presence.sort();

    let mut moves: Vec<(ObjectKey, usize, usize)> = Vec::new();
    let mut removals: Vec<(ObjectKey, usize)> = Vec::new();
    let mut unique_objects = 0usize;

    let mut group_start = 0;
    while group_start < presence.len() {
        let key = presence[group_start].0;
        let mut group_end = group_start + 1;
        while group_end < presence.len() && presence[group_end].0 == key {
            group_end += 1;
        }
        let holders = &presence[group_start..group_end];
        unique_objects += 1;

        let mut desired = sharding.write_backend_indices_for_key(&key)?;
        desired.sort_unstable();

        let mut desired_iter = desired.iter().peekable();
        let mut holder_iter = holders.iter().peekable();
        loop {
            match (desired_iter.peek(), holder_iter.peek()) {
                (Some(&&target), Some(&&(_, holder))) if target < holder => {
                    let source = holders[moves.len() % holders.len()].1;
                    moves.push((key, source, target));
                    desired_iter.next();
                }
                (Some(&&target), Some(&&(_, holder))) if holder < target => {
                    removals.push((key, holder));
                    holder_iter.next();
                }
                (Some(_), Some(_)) => {
                    desired_iter.next();
                    holder_iter.next();
                }
                (Some(&&target), None) => {
                    let source = holders[moves.len() % holders.len()].1;
                    moves.push((key, source, target));
                    desired_iter.next();
                }
                (None, Some(&&(_, holder))) => {
                    removals.push((key, holder));
                    holder_iter.next();
                }
                (None, None) => break,
            }
        }

        group_start = group_end;
    }

    eprintln!(
        "{} objects ({} unique). {} moves and {} removals required",
        presence.len(),
        unique_objects,
        moves.len(),
        removals.len()
    );
    drop(presence);

    let move_progress = Progress::new(moves.len(), "moves");
    let move_concurrency = backends.len() * 2;
    let move_results: Vec<Result<()>> = stream::iter(moves.into_iter().map(
        |(key, source, target)| {
            let move_progress = &move_progress;
            async move {
                let mut sink = CollectSink::new();
                backends[source]
                    .client
                    .get_object(key, 0, u64::MAX, &mut sink)
                    .await?;
                backends[target]
                    .client
                    .put_object(key, sink.into_bytes().into(), false)
                    .await?;
                move_progress.put(1);
                Ok(())
            }
        },
    ))
    .buffer_unordered(move_concurrency.max(1))
    .collect()
    .await;
    drop(move_progress);
    move_results.into_iter().collect::<Result<Vec<()>>>()?;

    let removal_progress = Progress::new(removals.len(), "removals");
    let removal_concurrency = backends.len() * 10;
    let removal_results: Vec<Result<()>> = stream::iter(removals.into_iter().map(
        |(key, holder)| {
            let removal_progress = &removal_progress;
            async move {
                match backends[holder].client.remove(key).await {
                    Ok(()) | Err(ShaleError::ObjectNotFound(_)) => {
                        removal_progress.put(1);
                        Ok(())
                    }
                    Err(error) => Err(error),
                }
            }
        },
    ))
    .buffer_unordered(removal_concurrency.max(1))
    .collect()
    .await;
    drop(removal_progress);
    removal_results.into_iter().collect::<Result<Vec<()>>>()?;

    Ok(())
}
