use tess_types::{ReplicaId, ShardId, TessError};

use crate::traits::StateMachine;

/// In-memory state machine that counts applied entries.
///
/// `update` answers with the entry length, `lookup` with the count
/// (little-endian u64) regardless of the query.
pub struct CounterStateMachine {
    shard_id: ShardId,
    replica_id: ReplicaId,
    count: u64,
    last_applied: u64,
}

impl CounterStateMachine {
    pub fn new(shard_id: ShardId, replica_id: ReplicaId) -> Self {
        CounterStateMachine { shard_id, replica_id, count: 0, last_applied: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl StateMachine for CounterStateMachine {
    fn update(&mut self, index: u64, cmd: &[u8]) -> Result<Vec<u8>, TessError> {
        self.count += 1;
        self.last_applied = index;
        tracing::trace!(
            shard_id = self.shard_id,
            replica_id = self.replica_id,
            count = self.count,
            "counter updated"
        );
        Ok((cmd.len() as u64).to_le_bytes().to_vec())
    }

    fn lookup(&self, _query: &[u8]) -> Result<Vec<u8>, TessError> {
        Ok(self.count.to_le_bytes().to_vec())
    }

    fn last_applied(&self) -> Result<u64, TessError> {
        Ok(self.last_applied)
    }

    fn save_snapshot(&self) -> Result<Vec<u8>, TessError> {
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&self.count.to_le_bytes());
        buf.extend_from_slice(&self.last_applied.to_le_bytes());
        Ok(buf)
    }

    fn recover_from_snapshot(&mut self, snapshot: &[u8]) -> Result<(), TessError> {
        let (count, last) = snapshot
            .get(..16)
            .map(|b| b.split_at(8))
            .ok_or_else(|| TessError::Codec("short counter snapshot".into()))?;
        let to_u64 = |b: &[u8]| -> Result<u64, TessError> {
            let arr: [u8; 8] = b.try_into().map_err(|_| TessError::Codec("bad counter".into()))?;
            Ok(u64::from_le_bytes(arr))
        };
        self.count = to_u64(count)?;
        self.last_applied = to_u64(last)?;
        Ok(())
    }
}
