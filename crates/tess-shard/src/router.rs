use std::sync::atomic::{AtomicU64, Ordering};

use tess_types::{AccountId, HostInfo, ShardId};
use xxhash_rust::xxh3::xxh3_64;

const JUMP_MULTIPLIER: u64 = 2_862_933_555_777_941_757;

/// Jump consistent hash: maps `key` onto `[0, buckets)`.
///
/// `buckets == 0` is treated as a single bucket.
pub fn jump_hash(mut key: u64, buckets: u64) -> u64 {
    let buckets = buckets.max(1) as i64;
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < buckets {
        b = j;
        key = key.wrapping_mul(JUMP_MULTIPLIER).wrapping_add(1);
        j = ((b + 1) as f64 * ((1u64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }
    b as u64
}

/// Maps keys and accounts to shards.
///
/// The live replica count is read lock-free on every lookup and replaced by
/// the membership listener whenever the host's view of the cluster changes.
/// Routing is advisory: a shard rejects proposals it does not own.
#[derive(Debug)]
pub struct ShardRouter {
    replicas: AtomicU64,
}

impl Default for ShardRouter {
    fn default() -> Self {
        ShardRouter::new(1)
    }
}

impl ShardRouter {
    pub fn new(replicas: u64) -> Self {
        ShardRouter { replicas: AtomicU64::new(replicas) }
    }

    pub fn replica_count(&self) -> u64 {
        self.replicas.load(Ordering::Acquire)
    }

    pub fn shard_for(&self, key: &[u8]) -> ShardId {
        let count = self.replica_count();
        if count == 0 {
            tracing::trace!("no live replicas known, routing to shard 0");
        }
        jump_hash(xxh3_64(key), count)
    }

    pub fn account_to_shard(&self, account: AccountId) -> ShardId {
        self.shard_for(&account.to_be_bytes())
    }

    /// Swaps in a new replica count. A concurrent update winning the race is
    /// logged and left in place; the next membership event converges it.
    pub fn update(&self, replicas: u64) {
        let current = self.replicas.load(Ordering::Acquire);
        if current == replicas {
            return;
        }
        match self
            .replicas
            .compare_exchange(current, replicas, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => tracing::debug!(from = current, to = replicas, "router replica count updated"),
            Err(actual) => tracing::warn!(
                expected = current,
                actual,
                wanted = replicas,
                "lost router update race"
            ),
        }
    }

    /// Recomputes the count from the host view: voting replicas only.
    pub fn refresh(&self, info: &HostInfo) {
        let voting = info.shards.iter().filter(|s| !s.is_observer && !s.is_witness).count();
        self.update(voting as u64);
    }
}
