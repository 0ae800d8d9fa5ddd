pub mod events;
pub mod host;
pub mod lifecycle;
pub mod router;
pub mod transactions;

pub use events::MembershipListener;
pub use host::HostManager;
pub use lifecycle::{RaftSettings, ShardManager};
pub use router::ShardRouter;
pub use transactions::TransactionManager;

use std::time::Duration;

/// `Duration::ZERO` selects the manager-wide default.
pub(crate) fn effective_timeout(timeout: Duration, default: Duration) -> Duration {
    if timeout.is_zero() {
        default
    } else {
        timeout
    }
}
