use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use tess_consensus::{ConsensusHost, MembershipEvent};
use tess_storage::ShardConfigStore;
use tess_types::{ShardId, ShardState, TessError};

use crate::lifecycle::now_ns;
use crate::router::ShardRouter;

const MEMBERSHIP_TIMEOUT: Duration = Duration::from_millis(100);

/// Keeps the router count and the persisted shard states in step with the
/// host's membership events.
pub struct MembershipListener<H> {
    host: Arc<H>,
    router: Arc<ShardRouter>,
    store: ShardConfigStore,
}

impl<H: ConsensusHost> MembershipListener<H> {
    pub fn new(host: Arc<H>, router: Arc<ShardRouter>, store: ShardConfigStore) -> Self {
        MembershipListener { host, router, store }
    }

    /// Subscribes immediately, then handles events on a background task until
    /// the host's event channel closes.
    pub fn spawn(self) -> JoinHandle<()> {
        let events = self.host.subscribe();
        self.router.refresh(&self.host.host_info());
        tokio::spawn(self.run(events))
    }

    async fn run(self, mut events: broadcast::Receiver<MembershipEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = self.handle(&event).await {
                        tracing::warn!(shard_id = event.shard_id(), error = %e, "membership event not applied");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "membership listener lagged");
                    self.router.refresh(&self.host.host_info());
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::debug!("membership listener stopped");
    }

    async fn handle(&self, event: &MembershipEvent) -> Result<(), TessError> {
        self.router.refresh(&self.host.host_info());
        match event {
            MembershipEvent::ReplicaDataRemoved { shard_id, .. } => self.store.delete(*shard_id).await,
            MembershipEvent::ReplicaStopped { .. } => Ok(()),
            MembershipEvent::ReplicaStarted { shard_id, .. }
            | MembershipEvent::MembershipChanged { shard_id, .. }
            | MembershipEvent::LeaderUpdated { shard_id, .. } => self.refresh_state(*shard_id).await,
        }
    }

    async fn refresh_state(&self, shard_id: ShardId) -> Result<(), TessError> {
        let mut state = match self.store.get(shard_id).await {
            Ok(state) => state,
            Err(TessError::ShardNotFound(_)) => {
                let Some(info) = self.host.host_info().shards.into_iter().find(|s| s.shard_id == shard_id)
                else {
                    return Ok(());
                };
                ShardState {
                    shard_id,
                    replica_id: info.replica_id,
                    state_machine_type: info.state_machine_type,
                    membership: Default::default(),
                    last_updated_ns: 0,
                }
            }
            Err(e) => return Err(e),
        };
        let membership = match self.host.sync_get_cluster_membership(shard_id, MEMBERSHIP_TIMEOUT).await {
            Ok(m) => m,
            // joining replicas have nothing to report until a leader appears
            Err(TessError::ShardNotReady(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if state.membership == membership {
            return Ok(());
        }
        state.membership = membership;
        state.last_updated_ns = now_ns();
        tracing::debug!(shard_id, config_change_id = state.membership.config_change_id, "shard state refreshed");
        self.store.put(state).await
    }
}
