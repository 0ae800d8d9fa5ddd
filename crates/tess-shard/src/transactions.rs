use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use tess_consensus::{ConsensusHost, Session};
use tess_types::{ClientId, ShardId, TessError, Transaction};

use crate::effective_timeout;

/// Per-client sequencing sessions, shared by every façade and manager.
///
/// Sessions stay cached until `close_transaction` evicts them; nothing expires
/// on its own.
pub struct TransactionManager<H> {
    host: Arc<H>,
    sessions: DashMap<ClientId, Arc<Mutex<Session>>>,
    default_timeout: Duration,
}

impl<H: ConsensusHost> TransactionManager<H> {
    pub fn new(host: Arc<H>, default_timeout: Duration) -> Self {
        TransactionManager { host, sessions: DashMap::new(), default_timeout }
    }

    /// Registers a fresh sequenced session against the shard.
    pub async fn get_transaction(
        &self,
        shard_id: ShardId,
        timeout: Duration,
    ) -> Result<Transaction, TessError> {
        let timeout = effective_timeout(timeout, self.default_timeout);
        let session = self.host.sync_get_session(shard_id, timeout).await?;
        let tx = session.descriptor();
        self.sessions.insert(session.client_id, Arc::new(Mutex::new(session)));
        tracing::debug!(shard_id, client_id = tx.client_id, "transaction opened");
        Ok(tx)
    }

    /// Unsequenced descriptor for single-shot proposals. Not cached: noop
    /// sessions carry fresh client ids and have nothing to commit or close.
    pub fn get_noop_transaction(&self, shard_id: ShardId) -> Transaction {
        self.host.get_noop_session(shard_id).descriptor()
    }

    /// Advances the session past its in-flight proposal. An unknown client
    /// yields `Transaction::default()` rather than an error.
    pub fn commit(&self, tx: &Transaction) -> Transaction {
        let Some(entry) = self.sessions.get(&tx.client_id) else {
            return Transaction::default();
        };
        let mut session = entry.lock();
        session.proposal_completed();
        session.descriptor()
    }

    pub async fn close_transaction(
        &self,
        tx: &Transaction,
        timeout: Duration,
    ) -> Result<(), TessError> {
        let (_, session) = self
            .sessions
            .remove(&tx.client_id)
            .ok_or(TessError::TransactionNotFound)?;
        let session = session.lock().clone();
        if session.is_noop() {
            return Ok(());
        }
        let timeout = effective_timeout(timeout, self.default_timeout);
        self.host.sync_close_session(&session, timeout).await?;
        tracing::debug!(shard_id = session.shard_id, client_id = session.client_id, "transaction closed");
        Ok(())
    }

    /// Snapshot of the cached session, if any.
    pub fn session_from_client_id(&self, client_id: ClientId) -> Option<Session> {
        self.sessions.get(&client_id).map(|s| s.lock().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tess_consensus::{LocalHost, StateMachineFactory};
    use tess_storage::{CounterStateMachine, StateMachine};
    use tess_types::{ReplicaConfig, StateMachineType};

    async fn host_with_shard(shard_id: ShardId) -> Arc<LocalHost> {
        let host = Arc::new(LocalHost::new("127.0.0.1:63001"));
        let factory: StateMachineFactory = Arc::new(|s, r| {
            Ok(Box::new(CounterStateMachine::new(s, r)) as Box<dyn StateMachine>)
        });
        host.start_replica(
            BTreeMap::from([(1, host.raft_address())]),
            false,
            StateMachineType::Test,
            factory,
            ReplicaConfig::new(shard_id, 1),
        )
        .await
        .unwrap();
        host
    }

    #[tokio::test]
    async fn commit_advances_series() {
        let host = host_with_shard(1).await;
        let tm = TransactionManager::new(host, Duration::from_secs(1));

        let tx = tm.get_transaction(1, Duration::ZERO).await.unwrap();
        assert!(!tx.is_noop());
        let next = tm.commit(&tx);
        assert!(next.transaction_id > tx.transaction_id);
        assert_eq!(next.responded_to, tx.transaction_id);
        let again = tm.commit(&next);
        assert!(again.transaction_id > next.transaction_id);

        let cached = tm.session_from_client_id(tx.client_id).unwrap();
        assert_eq!(cached.descriptor(), again);
    }

    #[tokio::test]
    async fn commit_unknown_is_default() {
        let host = host_with_shard(1).await;
        let tm = TransactionManager::new(host, Duration::from_secs(1));
        let unknown = Transaction { shard_id: 1, client_id: 99, transaction_id: 3, responded_to: 2 };
        assert_eq!(tm.commit(&unknown), Transaction::default());
        assert!(tm.session_from_client_id(99).is_none());
    }

    #[tokio::test]
    async fn close_succeeds_once() {
        let host = host_with_shard(1).await;
        let tm = TransactionManager::new(host, Duration::from_secs(1));

        let tx = tm.get_transaction(1, Duration::ZERO).await.unwrap();
        tm.close_transaction(&tx, Duration::ZERO).await.unwrap();
        assert!(matches!(
            tm.close_transaction(&tx, Duration::ZERO).await,
            Err(TessError::TransactionNotFound)
        ));
        assert!(tm.is_empty());
    }

    #[tokio::test]
    async fn noop_transactions_are_not_cached() {
        let host = host_with_shard(1).await;
        let tm = TransactionManager::new(host, Duration::from_secs(1));

        // shard 7 does not exist; the host is never asked
        for _ in 0..100 {
            assert!(tm.get_noop_transaction(7).is_noop());
        }
        assert!(tm.is_empty());

        let tx = tm.get_noop_transaction(7);
        assert!(tm.session_from_client_id(tx.client_id).is_none());
        assert_eq!(tm.commit(&tx), Transaction::default());
        assert!(matches!(
            tm.close_transaction(&tx, Duration::ZERO).await,
            Err(TessError::TransactionNotFound)
        ));
    }

    #[tokio::test]
    async fn unknown_shard_propagates() {
        let host = host_with_shard(1).await;
        let tm = TransactionManager::new(host, Duration::from_secs(1));
        assert!(matches!(
            tm.get_transaction(5, Duration::ZERO).await,
            Err(TessError::ShardNotFound(5))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_commits_are_serialised() {
        let host = host_with_shard(1).await;
        let tm = Arc::new(TransactionManager::new(host, Duration::from_secs(1)));
        let tx = tm.get_transaction(1, Duration::ZERO).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let tm = tm.clone();
            handles.push(tokio::spawn(async move { tm.commit(&tx) }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let session = tm.session_from_client_id(tx.client_id).unwrap();
        assert_eq!(session.series_id, tx.transaction_id + 50);
    }
}
