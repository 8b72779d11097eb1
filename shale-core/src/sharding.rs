use crate::client::CasClient;
use crate::config::BalancerConfig;
use crate::error::{Result, ShaleError};
use crate::key::ObjectKey;
use std::collections::HashSet;
use std::sync::Arc;

pub struct Backend {
    pub client: Arc<CasClient>,
    pub failure_domain: u8,
    pub buckets: Vec<ObjectKey>,
}

/// The cluster's consistent-hash ring: every backend's bucket list merged
/// into one sorted sequence of (bucket, backend index) pairs.
pub struct ShardingInfo {
    replicas: usize,
    backends: Vec<Backend>,
    ring: Vec<(ObjectKey, usize)>,
}

impl ShardingInfo {
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas: replicas.max(1),
            backends: Vec::new(),
            ring: Vec::new(),
        }
    }

    /// Connects to every backend in `config` and merges their buckets.
    pub async fn from_config(config: &BalancerConfig) -> Result<Self> {
        let mut info = Self::new(config.replicas);

        for backend in &config.backends {
            let client = Arc::new(CasClient::new(backend.addr.clone()));
            client.on_connect().await?;
            client.spawn_reconnect();
            info.add_backend(client, backend.failure_domain).await?;
        }

        Ok(info)
    }

    pub async fn add_backend(&mut self, client: Arc<CasClient>, failure_domain: u8) -> Result<()> {
        let buckets = client.get_buckets().await?;
        let index = self.backends.len();

        self.ring
            .extend(buckets.iter().map(|bucket| (*bucket, index)));
        self.ring.sort_unstable();

        tracing::info!(
            "added backend {} with {} buckets in failure domain {}",
            client.addr(),
            buckets.len(),
            failure_domain
        );

        self.backends.push(Backend {
            client,
            failure_domain,
            buckets,
        });
        Ok(())
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    pub fn bucket_count(&self) -> usize {
        self.ring.len()
    }

    fn first_position_for_key(&self, key: &ObjectKey) -> Result<usize> {
        if self.ring.is_empty() {
            return Err(ShaleError::Internal("hash ring is empty".to_string()));
        }
        Ok(ring_lower_bound(&self.ring, key))
    }

    /// The replica set for a write: walk the ring collecting connected
    /// backends until `replicas` distinct failure domains are covered.
    pub fn write_backends_for_key(&self, key: &ObjectKey) -> Result<Vec<Arc<CasClient>>> {
        Ok(self
            .write_backend_indices_for_key(key)?
            .into_iter()
            .map(|index| self.backends[index].client.clone())
            .collect())
    }

    /// Same selection as [`Self::write_backends_for_key`], as backend
    /// indices; placement planning compares these against current holders.
    pub fn write_backend_indices_for_key(&self, key: &ObjectKey) -> Result<Vec<usize>> {
        if self.backends.len() < self.replicas {
            return Err(ShaleError::InsufficientReplicas {
                required: self.replicas,
                found: self.backends.len(),
            });
        }

        let first = self.first_position_for_key(key)?;
        let candidates: Vec<(bool, u8)> = self
            .backends
            .iter()
            .map(|backend| (backend.client.is_connected(), backend.failure_domain))
            .collect();

        select_write_backends(&self.ring, &candidates, first, self.replicas)
    }

    /// The next connected backend for a read, skipping those already tried.
    pub fn next_shard_for_key(
        &self,
        key: &ObjectKey,
        done: &HashSet<usize>,
    ) -> Result<(usize, Arc<CasClient>)> {
        let first = self.first_position_for_key(key)?;

        let mut position = first;
        loop {
            let (_, index) = self.ring[position];
            if !done.contains(&index) && self.backends[index].client.is_connected() {
                return Ok((index, self.backends[index].client.clone()));
            }
            position = (position + 1) % self.ring.len();
            if position == first {
                break;
            }
        }

        Err(ShaleError::InsufficientReplicas {
            required: 1,
            found: 0,
        })
    }
}

/// Index of the first ring entry whose bucket is >= `key`, wrapping to 0.
fn ring_lower_bound(ring: &[(ObjectKey, usize)], key: &ObjectKey) -> usize {
    let position = ring.partition_point(|(bucket, _)| bucket < key);
    if position == ring.len() { 0 } else { position }
}

/// Walks the ring from `first` collecting backends that are connected, not
/// yet selected, and in a failure domain not yet consumed. Fails if a full
/// loop completes before `replicas` backends are found.
fn select_write_backends(
    ring: &[(ObjectKey, usize)],
    candidates: &[(bool, u8)],
    first: usize,
    replicas: usize,
) -> Result<Vec<usize>> {
    let mut domain_mask = u64::MAX;
    let mut selected = Vec::with_capacity(replicas);
    let mut taken = HashSet::new();

    let mut position = first;
    loop {
        let (_, index) = ring[position];
        let (connected, failure_domain) = candidates[index];
        let domain_bit = 1u64 << failure_domain;

        if domain_mask & domain_bit != 0 && connected && !taken.contains(&index) {
            selected.push(index);
            taken.insert(index);
            domain_mask &= !domain_bit;
        }

        if selected.len() == replicas {
            return Ok(selected);
        }

        position = (position + 1) % ring.len();
        if position == first {
            return Err(ShaleError::InsufficientReplicas {
                required: replicas,
                found: selected.len(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(byte: u8) -> ObjectKey {
        let mut bytes = [0u8; 20];
        bytes[0] = byte;
        ObjectKey::from_bytes(&bytes).unwrap()
    }

    fn ring_of(buckets: &[(u8, usize)]) -> Vec<(ObjectKey, usize)> {
        let mut ring: Vec<_> = buckets
            .iter()
            .map(|(byte, index)| (bucket(*byte), *index))
            .collect();
        ring.sort_unstable();
        ring
    }

    #[test]
    fn lower_bound_wraps_past_the_last_bucket() {
        let ring = ring_of(&[(10, 0), (20, 1), (30, 2)]);

        assert_eq!(ring_lower_bound(&ring, &bucket(5)), 0);
        assert_eq!(ring_lower_bound(&ring, &bucket(10)), 0);
        assert_eq!(ring_lower_bound(&ring, &bucket(11)), 1);
        assert_eq!(ring_lower_bound(&ring, &bucket(30)), 2);
        assert_eq!(ring_lower_bound(&ring, &bucket(31)), 0);
    }

    #[test]
    fn write_selection_spans_failure_domains() {
        let ring = ring_of(&[(10, 0), (20, 1), (30, 2)]);
        // Backends 0 and 1 share a failure domain.
        let candidates = [(true, 0), (true, 0), (true, 1)];

        let selected = select_write_backends(&ring, &candidates, 0, 2).unwrap();
        assert_eq!(selected, vec![0, 2]);
    }

    #[test]
    fn write_selection_skips_disconnected_backends() {
        let ring = ring_of(&[(10, 0), (20, 1), (30, 2)]);
        let candidates = [(false, 0), (true, 1), (true, 2)];

        let selected = select_write_backends(&ring, &candidates, 0, 2).unwrap();
        assert_eq!(selected, vec![1, 2]);
    }

    #[test]
    fn write_selection_fails_after_a_full_loop() {
        let ring = ring_of(&[(10, 0), (20, 1)]);
        // Only one distinct failure domain is reachable.
        let candidates = [(true, 3), (true, 3)];

        let error = select_write_backends(&ring, &candidates, 0, 2).unwrap_err();
        assert!(matches!(
            error,
            ShaleError::InsufficientReplicas {
                required: 2,
                found: 1
            }
        ));
    }

    #[test]
    fn write_selection_does_not_pick_a_backend_twice() {
        // One backend owns several ring positions.
        let ring = ring_of(&[(10, 0), (20, 0), (30, 1)]);
        let candidates = [(true, 0), (true, 1)];

        let selected = select_write_backends(&ring, &candidates, 0, 2).unwrap();
        assert_eq!(selected, vec![0, 1]);
    }
}
