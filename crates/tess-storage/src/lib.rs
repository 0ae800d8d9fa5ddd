pub mod counter;
pub mod fjall;
pub mod keys;
pub mod kv;
pub mod mem;
pub mod shard_config;
pub mod traits;

pub use counter::CounterStateMachine;
pub use kv::KvStateMachine;
pub use shard_config::ShardConfigStore;
pub use traits::{BatchOp, BucketDump, BucketStore, StateMachine};

use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}
