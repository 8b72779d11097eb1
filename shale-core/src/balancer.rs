use crate::error::{Result, ShaleError};
use crate::key::ObjectKey;
use crate::sharding::ShardingInfo;
use crate::sink::CollectSink;
use crate::store::{Capacity, ListMode, PutOutcome};
use crate::wire::ListResponse;
use bytes::Bytes;
use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

struct GcState {
    id: u64,
    backend_ids: Vec<u64>,
}

/// Cluster-facing CAS: fans writes to a replica set, retries reads across
/// replicas, and coordinates cluster-wide garbage collection. Stateless
/// apart from the open GC cycle.
pub struct Balancer {
    sharding: ShardingInfo,
    gc: Mutex<GcState>,
}

impl Balancer {
    pub fn new(sharding: ShardingInfo) -> Self {
        Self {
            sharding,
            gc: Mutex::new(GcState {
                id: 0,
                backend_ids: Vec::new(),
            }),
        }
    }

    pub fn sharding(&self) -> &ShardingInfo {
        &self.sharding
    }

    /// Writes `data` to every backend of the replica set. All replicas must
    /// accept; a failed replica fails the put and the caller retries.
    pub async fn put(&self, key: ObjectKey, data: Bytes, sync: bool) -> Result<PutOutcome> {
        let replicas = self.sharding.write_backends_for_key(&key)?;

        // The shared buffer stays alive until the slowest replica write
        // resolves.
        let writes = join_all(
            replicas
                .iter()
                .map(|client| client.put_object(key, data.clone(), sync)),
        )
        .await;

        let mut existed_everywhere = true;
        for write in writes {
            existed_everywhere &= write?.existed;
        }

        Ok(if existed_everywhere {
            PutOutcome::Existed
        } else {
            PutOutcome::Stored
        })
    }

    /// Reads from the first viable replica, retrying across the ring until
    /// one succeeds or every replica has been tried.
    pub async fn get(&self, key: ObjectKey, offset: u64, size: u64) -> Result<Vec<u8>> {
        let mut done = HashSet::new();
        let mut last_error: Option<ShaleError> = None;

        loop {
            let (index, client) = match self.sharding.next_shard_for_key(&key, &done) {
                Ok(next) => next,
                Err(error) => return Err(last_error.unwrap_or(error)),
            };
            done.insert(index);

            let mut sink = CollectSink::new();
            match client.get_object(key, offset, size, &mut sink).await {
                Ok(()) => return Ok(sink.into_bytes()),
                Err(error) => {
                    tracing::warn!(
                        "get {} from backend {} failed: {}",
                        key,
                        client.addr(),
                        error
                    );
                    last_error = Some(error);
                }
            }
        }
    }

    /// Removes `key` from every backend. Requires the whole cluster to be
    /// reachable. Returns whether any backend held the object.
    pub async fn remove(&self, key: ObjectKey) -> Result<bool> {
        self.require_all_connected()?;

        let removals = join_all(
            self.sharding
                .backends()
                .iter()
                .map(|backend| backend.client.remove(key)),
        )
        .await;

        let mut removed_anywhere = false;
        for removal in removals {
            match removal {
                Ok(()) => removed_anywhere = true,
                // Replication puts each object on only a subset of backends.
                Err(ShaleError::ObjectNotFound(_)) => {}
                Err(error) => return Err(error),
            }
        }
        Ok(removed_anywhere)
    }

    pub async fn capacity(&self) -> Result<Capacity> {
        self.require_all_connected()?;

        let capacities = join_all(
            self.sharding
                .backends()
                .iter()
                .map(|backend| backend.client.capacity()),
        )
        .await;

        let mut sum = Capacity::default();
        for capacity in capacities {
            let capacity = capacity?;
            sum.total += capacity.total;
            sum.available += capacity.available;
            sum.unreclaimed += capacity.unreclaimed;
            sum.garbage += capacity.garbage;
        }
        Ok(sum)
    }

    /// One page of the cluster listing: every backend's listing concatenated
    /// in backend order. The cursor encodes (backend index, backend cursor).
    pub async fn list_page(
        &self,
        mode: ListMode,
        min_size: u64,
        max_size: u64,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ListResponse> {
        self.require_all_connected()?;

        let backends = self.sharding.backends();
        let (mut backend_index, mut inner) = parse_cluster_cursor(cursor)?;
        if backend_index > backends.len() {
            return Err(ShaleError::InvalidRequest(format!(
                "cursor names backend {} of {}",
                backend_index,
                backends.len()
            )));
        }

        let mut keys = Vec::new();
        while keys.len() < limit && backend_index < backends.len() {
            let page = backends[backend_index]
                .client
                .list_page(
                    mode,
                    min_size,
                    max_size,
                    inner.as_deref(),
                    limit - keys.len(),
                )
                .await?;

            keys.extend(page.keys);
            match page.next_cursor {
                Some(next) => inner = Some(next),
                None => {
                    backend_index += 1;
                    inner = None;
                }
            }
        }

        let next_cursor = (backend_index < backends.len())
            .then(|| format!("{}:{}", backend_index, inner.unwrap_or_default()));

        Ok(ListResponse { keys, next_cursor })
    }

    /// One serial compaction chain per failure domain, chains in parallel,
    /// so at most one replica per domain is degraded at a time.
    pub async fn compact(&self, sync: bool) -> Result<()> {
        let mut chains: HashMap<u8, Vec<Arc<crate::client::CasClient>>> = HashMap::new();
        for backend in self.sharding.backends() {
            if !backend.client.is_connected() {
                continue;
            }
            chains
                .entry(backend.failure_domain)
                .or_default()
                .push(backend.client.clone());
        }

        let runs = join_all(chains.into_values().map(|chain| async move {
            for client in chain {
                client.compact(sync).await?;
            }
            Ok::<(), ShaleError>(())
        }))
        .await;

        runs.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    /// Every backend's buckets concatenated: the cluster's hash-ring config.
    pub fn config_buckets(&self) -> Vec<ObjectKey> {
        self.sharding
            .backends()
            .iter()
            .flat_map(|backend| backend.buckets.iter().copied())
            .collect()
    }

    /// Starts a cluster-wide GC cycle and remembers each backend's own id.
    pub async fn begin_gc(&self) -> Result<u64> {
        self.require_all_connected()?;

        let begins = join_all(
            self.sharding
                .backends()
                .iter()
                .map(|backend| backend.client.begin_gc()),
        )
        .await;
        let backend_ids = begins.into_iter().collect::<Result<Vec<u64>>>()?;

        let mut gc = self.gc.lock().await;
        gc.id = (gc.id + 1).max(wall_clock_usec());
        gc.backend_ids = backend_ids;
        Ok(gc.id)
    }

    pub async fn mark_gc(&self, keys: &[ObjectKey]) -> Result<()> {
        self.require_all_connected()?;

        let marks = join_all(
            self.sharding
                .backends()
                .iter()
                .map(|backend| backend.client.mark_gc(keys)),
        )
        .await;
        marks.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    /// Finishes the cycle identified by `id`, forwarding each backend its
    /// own gc id. Fails if another cycle began in the meantime.
    pub async fn end_gc(&self, id: u64) -> Result<()> {
        self.require_all_connected()?;

        let backend_ids = {
            let gc = self.gc.lock().await;
            if id != gc.id {
                return Err(ShaleError::GcConflict {
                    submitted: id,
                    current: gc.id,
                });
            }
            if gc.backend_ids.len() != self.sharding.backends().len() {
                return Err(ShaleError::Internal(format!(
                    "gc cycle covers {} backends, cluster has {}",
                    gc.backend_ids.len(),
                    self.sharding.backends().len()
                )));
            }
            gc.backend_ids.clone()
        };

        let ends = join_all(
            self.sharding
                .backends()
                .iter()
                .zip(backend_ids)
                .map(|(backend, backend_id)| backend.client.end_gc(backend_id)),
        )
        .await;
        ends.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    fn require_all_connected(&self) -> Result<()> {
        let backends = self.sharding.backends();
        let connected = backends
            .iter()
            .filter(|backend| backend.client.is_connected())
            .count();
        if connected != backends.len() {
            return Err(ShaleError::InsufficientReplicas {
                required: backends.len(),
                found: connected,
            });
        }
        Ok(())
    }
}

fn parse_cluster_cursor(cursor: Option<&str>) -> Result<(usize, Option<String>)> {
    let Some(cursor) = cursor else {
        return Ok((0, None));
    };
    let (backend_index, inner) = cursor.split_once(':').ok_or_else(|| {
        ShaleError::InvalidRequest(format!("malformed cluster cursor '{}'", cursor))
    })?;
    let backend_index = backend_index.parse::<usize>().map_err(|_| {
        ShaleError::InvalidRequest(format!("malformed cluster cursor '{}'", cursor))
    })?;
    let inner = (!inner.is_empty()).then(|| inner.to_string());
    Ok((backend_index, inner))
}

fn wall_clock_usec() -> u64 {
    chrono::Utc::now().timestamp_micros().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_cursor_roundtrip() {
        assert_eq!(parse_cluster_cursor(None).unwrap(), (0, None));
        assert_eq!(parse_cluster_cursor(Some("2:")).unwrap(), (2, None));
        assert_eq!(
            parse_cluster_cursor(Some("1:12345")).unwrap(),
            (1, Some("12345".to_string()))
        );
        assert!(parse_cluster_cursor(Some("nope")).is_err());
        assert!(parse_cluster_cursor(Some("x:1")).is_err());
    }
}
