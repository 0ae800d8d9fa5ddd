use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use tess_storage::StateMachine;
use tess_types::{
    ClientId, HostInfo, MembershipEntry, ReplicaConfig, ReplicaId, ShardId, ShardInfo,
    SnapshotOption, StateMachineType, TessError,
};

use crate::{ConsensusHost, MembershipEvent, Session, StateMachineFactory};

const EVENT_CAPACITY: usize = 256;

type SharedStateMachine = Arc<Mutex<Box<dyn StateMachine>>>;

async fn with_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T, TessError>>,
) -> Result<T, TessError> {
    tokio::time::timeout(timeout, fut).await.map_err(|_| TessError::Timeout)?
}

fn join_err(e: tokio::task::JoinError) -> TessError {
    TessError::Consensus(e.to_string())
}

// ---------------------------------------------------------------------------
// Shard group state
// ---------------------------------------------------------------------------

struct SessionRecord {
    responded_to: u64,
    /// series id → reply, kept until the client acknowledges it
    results: BTreeMap<u64, Vec<u8>>,
}

struct GroupState {
    config: ReplicaConfig,
    sm_type: StateMachineType,
    sm: SharedStateMachine,
    membership: MembershipEntry,
    leader: Option<ReplicaId>,
    running: bool,
    log_index: u64,
    sessions: HashMap<ClientId, SessionRecord>,
    /// (index, bytes) of the latest internal snapshot
    snapshot: Option<(u64, Vec<u8>)>,
    compacted_to: u64,
}

impl GroupState {
    fn refresh_leader(&mut self) {
        if let Some(l) = self.leader {
            if !self.membership.replicas.contains_key(&l) {
                self.leader = None;
            }
        }
    }
}

struct ShardGroup {
    state: Mutex<GroupState>,
    /// Serialises log entries so the state machine sees them in index order.
    apply: tokio::sync::Mutex<()>,
}

enum ConfigChange {
    AddNode(ReplicaId, String),
    AddObserver(ReplicaId, String),
    AddWitness(ReplicaId, String),
    DeleteNode(ReplicaId),
}

impl ConfigChange {
    fn apply(self, shard_id: ShardId, m: &mut MembershipEntry) -> Result<ReplicaId, TessError> {
        let check_removed = |m: &MembershipEntry, id: ReplicaId| {
            if m.removed.contains(&id) {
                Err(TessError::ReplicaRemoved { shard_id, replica_id: id })
            } else {
                Ok(())
            }
        };
        match self {
            ConfigChange::AddNode(id, addr) => {
                check_removed(m, id)?;
                if m.replicas.contains_key(&id) || m.witnesses.contains_key(&id) {
                    return Err(TessError::Rejected(format!("replica {id} is already a member")));
                }
                // an existing observer is promoted
                m.observers.remove(&id);
                m.replicas.insert(id, addr);
                Ok(id)
            }
            ConfigChange::AddObserver(id, addr) => {
                check_removed(m, id)?;
                if m.contains(id) {
                    return Err(TessError::Rejected(format!("replica {id} is already a member")));
                }
                m.observers.insert(id, addr);
                Ok(id)
            }
            ConfigChange::AddWitness(id, addr) => {
                check_removed(m, id)?;
                if m.contains(id) {
                    return Err(TessError::Rejected(format!("replica {id} is already a member")));
                }
                m.witnesses.insert(id, addr);
                Ok(id)
            }
            ConfigChange::DeleteNode(id) => {
                m.replicas.remove(&id);
                m.observers.remove(&id);
                m.witnesses.remove(&id);
                m.removed.insert(id);
                Ok(id)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// LocalHost
// ---------------------------------------------------------------------------

struct HostInner {
    id: String,
    raft_address: String,
    groups: RwLock<HashMap<ShardId, Arc<ShardGroup>>>,
    events: broadcast::Sender<MembershipEvent>,
    stopped: AtomicBool,
}

/// In-process `ConsensusHost`.
///
/// Every shard has exactly one local replica, which leads the shard whenever
/// it is a voting member that bootstrapped the group. Remote members exist
/// only as membership entries. Entries are applied as soon as they are
/// proposed, in index order.
#[derive(Clone)]
pub struct LocalHost {
    inner: Arc<HostInner>,
}

impl LocalHost {
    pub fn new(raft_address: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        LocalHost {
            inner: Arc::new(HostInner {
                id: uuid::Uuid::new_v4().to_string(),
                raft_address: raft_address.into(),
                groups: RwLock::new(HashMap::new()),
                events,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    fn emit(&self, event: MembershipEvent) {
        // no subscribers is fine
        let _ = self.inner.events.send(event);
    }

    fn check_running(&self) -> Result<(), TessError> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(TessError::Consensus("host is stopped".into()));
        }
        Ok(())
    }

    fn group(&self, shard_id: ShardId) -> Result<Arc<ShardGroup>, TessError> {
        self.check_running()?;
        self.inner
            .groups
            .read()
            .get(&shard_id)
            .cloned()
            .ok_or(TessError::ShardNotFound(shard_id))
    }

    /// A group that is running and has a known leader.
    fn ready_group(&self, shard_id: ShardId) -> Result<Arc<ShardGroup>, TessError> {
        let group = self.group(shard_id)?;
        {
            let st = group.state.lock();
            if !st.running || st.leader.is_none() {
                return Err(TessError::ShardNotReady(shard_id));
            }
        }
        Ok(group)
    }

    async fn apply_entry(&self, group: &ShardGroup, cmd: Vec<u8>) -> Result<Vec<u8>, TessError> {
        let (index, sm) = {
            let mut st = group.state.lock();
            st.log_index += 1;
            (st.log_index, st.sm.clone())
        };
        let out = tokio::task::spawn_blocking(move || sm.lock().update(index, &cmd))
            .await
            .map_err(join_err)??;

        let due = {
            let st = group.state.lock();
            let last = st.snapshot.as_ref().map(|(i, _)| *i).unwrap_or(0);
            st.config.snapshot_entries > 0 && index - last >= st.config.snapshot_entries
        };
        if due {
            let overhead = group.state.lock().config.compaction_overhead;
            self.capture_snapshot(group, overhead).await?;
        }
        Ok(out)
    }

    /// Caller holds the apply lock.
    async fn capture_snapshot(&self, group: &ShardGroup, overhead: u64) -> Result<u64, TessError> {
        let (index, sm, shard_id) = {
            let st = group.state.lock();
            (st.log_index, st.sm.clone(), st.config.shard_id)
        };
        let bytes = tokio::task::spawn_blocking(move || sm.lock().save_snapshot())
            .await
            .map_err(join_err)??;
        let mut st = group.state.lock();
        st.snapshot = Some((index, bytes));
        st.compacted_to = st.compacted_to.max(index.saturating_sub(overhead));
        tracing::debug!(shard_id, index, compacted_to = st.compacted_to, "snapshot captured");
        Ok(index)
    }

    async fn request_config_change(
        &self,
        shard_id: ShardId,
        config_change_id: u64,
        change: ConfigChange,
        timeout: Duration,
    ) -> Result<(), TessError> {
        let group = self.ready_group(shard_id)?;
        let (replica_id, local) = with_timeout(timeout, async {
            let _order = group.apply.lock().await;
            let mut st = group.state.lock();
            if st.config.ordered_config_change
                && config_change_id != 0
                && config_change_id != st.membership.config_change_id
            {
                return Err(TessError::Rejected(format!(
                    "stale config change id {config_change_id}, current is {}",
                    st.membership.config_change_id
                )));
            }
            let mut membership = st.membership.clone();
            let replica_id = change.apply(shard_id, &mut membership)?;
            st.log_index += 1;
            membership.config_change_id = st.log_index;
            st.membership = membership;
            st.refresh_leader();
            Ok((replica_id, st.config.replica_id))
        })
        .await?;

        tracing::debug!(shard_id, replica_id, "membership changed");
        self.emit(MembershipEvent::MembershipChanged { shard_id, replica_id: local });
        Ok(())
    }
}

impl ConsensusHost for LocalHost {
    fn id(&self) -> String {
        self.inner.id.clone()
    }

    fn raft_address(&self) -> String {
        self.inner.raft_address.clone()
    }

    async fn sync_propose(
        &self,
        session: &Session,
        cmd: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TessError> {
        let group = self.ready_group(session.shard_id)?;
        let session = session.clone();
        with_timeout(timeout, async {
            let _order = group.apply.lock().await;
            if !session.is_noop() {
                let st = group.state.lock();
                let rec = st.sessions.get(&session.client_id).ok_or_else(|| {
                    TessError::Rejected(format!("session {} is not registered", session.client_id))
                })?;
                if let Some(cached) = rec.results.get(&session.series_id) {
                    return Ok(cached.clone());
                }
                if session.series_id <= rec.responded_to {
                    return Err(TessError::Rejected(format!(
                        "series {} was already answered",
                        session.series_id
                    )));
                }
            }

            let out = self.apply_entry(&group, cmd).await?;

            if !session.is_noop() {
                let mut st = group.state.lock();
                if let Some(rec) = st.sessions.get_mut(&session.client_id) {
                    rec.responded_to = rec.responded_to.max(session.responded_to);
                    let acked = rec.responded_to;
                    rec.results.retain(|series, _| *series > acked);
                    rec.results.insert(session.series_id, out.clone());
                }
            }
            Ok(out)
        })
        .await
    }

    async fn sync_read(
        &self,
        shard_id: ShardId,
        query: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TessError> {
        let group = self.ready_group(shard_id)?;
        with_timeout(timeout, async {
            let sm = group.state.lock().sm.clone();
            tokio::task::spawn_blocking(move || sm.lock().lookup(&query)).await.map_err(join_err)?
        })
        .await
    }

    async fn sync_get_session(
        &self,
        shard_id: ShardId,
        timeout: Duration,
    ) -> Result<Session, TessError> {
        let group = self.ready_group(shard_id)?;
        with_timeout(timeout, async {
            let _order = group.apply.lock().await;
            let mut st = group.state.lock();
            let mut client_id = rand::random::<u64>();
            while client_id == 0 || st.sessions.contains_key(&client_id) {
                client_id = rand::random::<u64>();
            }
            st.log_index += 1;
            st.sessions.insert(client_id, SessionRecord { responded_to: 0, results: BTreeMap::new() });
            Ok(Session { shard_id, client_id, series_id: 1, responded_to: 0 })
        })
        .await
    }

    fn get_noop_session(&self, shard_id: ShardId) -> Session {
        Session::noop(shard_id, rand::random::<u64>())
    }

    async fn sync_close_session(&self, session: &Session, timeout: Duration) -> Result<(), TessError> {
        if session.is_noop() {
            return Err(TessError::Rejected("no-op sessions can't be closed".into()));
        }
        let group = self.ready_group(session.shard_id)?;
        let client_id = session.client_id;
        with_timeout(timeout, async {
            let _order = group.apply.lock().await;
            let mut st = group.state.lock();
            if st.sessions.remove(&client_id).is_none() {
                return Err(TessError::Rejected(format!("session {client_id} is not registered")));
            }
            st.log_index += 1;
            Ok(())
        })
        .await
    }

    async fn sync_request_add_node(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        address: String,
        config_change_id: u64,
        timeout: Duration,
    ) -> Result<(), TessError> {
        let change = ConfigChange::AddNode(replica_id, address);
        self.request_config_change(shard_id, config_change_id, change, timeout).await
    }

    async fn sync_request_add_observer(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        address: String,
        config_change_id: u64,
        timeout: Duration,
    ) -> Result<(), TessError> {
        let change = ConfigChange::AddObserver(replica_id, address);
        self.request_config_change(shard_id, config_change_id, change, timeout).await
    }

    async fn sync_request_add_witness(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        address: String,
        config_change_id: u64,
        timeout: Duration,
    ) -> Result<(), TessError> {
        let change = ConfigChange::AddWitness(replica_id, address);
        self.request_config_change(shard_id, config_change_id, change, timeout).await
    }

    async fn sync_request_delete_node(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        config_change_id: u64,
        timeout: Duration,
    ) -> Result<(), TessError> {
        let change = ConfigChange::DeleteNode(replica_id);
        self.request_config_change(shard_id, config_change_id, change, timeout).await
    }

    async fn sync_get_cluster_membership(
        &self,
        shard_id: ShardId,
        timeout: Duration,
    ) -> Result<MembershipEntry, TessError> {
        let group = self.ready_group(shard_id)?;
        with_timeout(timeout, async {
            let _order = group.apply.lock().await;
            let membership = group.state.lock().membership.clone();
            Ok(membership)
        })
        .await
    }

    fn get_leader_id(&self, shard_id: ShardId) -> Result<(ReplicaId, bool), TessError> {
        let group = self.group(shard_id)?;
        let st = group.state.lock();
        match st.leader {
            Some(leader) if st.running => Ok((leader, true)),
            _ => Ok((0, false)),
        }
    }

    async fn start_replica(
        &self,
        members: BTreeMap<ReplicaId, String>,
        join: bool,
        sm_type: StateMachineType,
        factory: StateMachineFactory,
        config: ReplicaConfig,
    ) -> Result<(), TessError> {
        self.check_running()?;
        let shard_id = config.shard_id;
        let replica_id = config.replica_id;
        if join && !members.is_empty() {
            return Err(TessError::InvalidArgument("a joining replica takes no initial members".into()));
        }

        let existing = self.inner.groups.read().get(&shard_id).cloned();
        match &existing {
            Some(group) => {
                let st = group.state.lock();
                if st.running {
                    return Err(TessError::ShardAlreadyExists(shard_id));
                }
                if st.config.replica_id != replica_id {
                    return Err(TessError::Rejected(format!(
                        "shard {shard_id} holds data for replica {}",
                        st.config.replica_id
                    )));
                }
            }
            None if !join && members.is_empty() => return Err(TessError::ShardNotFound(shard_id)),
            None => {}
        }

        let build = factory.clone();
        let sm = tokio::task::spawn_blocking(move || build(shard_id, replica_id))
            .await
            .map_err(join_err)??;
        let sm: SharedStateMachine = Arc::new(Mutex::new(sm));

        match existing {
            Some(group) => {
                let snapshot = group.state.lock().snapshot.as_ref().map(|(_, b)| b.clone());
                if let Some(bytes) = snapshot {
                    let target = sm.clone();
                    tokio::task::spawn_blocking(move || target.lock().recover_from_snapshot(&bytes))
                        .await
                        .map_err(join_err)??;
                }
                let mut st = group.state.lock();
                let voting = st.membership.replicas.contains_key(&replica_id);
                st.sm = sm;
                st.sm_type = sm_type;
                st.running = true;
                st.leader = (voting && !join).then_some(replica_id);
                st.config = config;
            }
            None => {
                let address = self.raft_address();
                let mut membership = MembershipEntry::default();
                let leader = if join {
                    if config.is_observer {
                        membership.observers.insert(replica_id, address);
                    } else if config.is_witness {
                        membership.witnesses.insert(replica_id, address);
                    } else {
                        membership.replicas.insert(replica_id, address);
                    }
                    None
                } else {
                    let votes = !config.is_observer && !config.is_witness;
                    let leader = (votes && members.contains_key(&replica_id)).then_some(replica_id);
                    membership.replicas = members;
                    leader
                };
                let log_index = {
                    let target = sm.clone();
                    tokio::task::spawn_blocking(move || target.lock().last_applied())
                        .await
                        .map_err(join_err)??
                };
                let group = Arc::new(ShardGroup {
                    state: Mutex::new(GroupState {
                        config,
                        sm_type,
                        sm,
                        membership,
                        leader,
                        running: true,
                        log_index,
                        sessions: HashMap::new(),
                        snapshot: None,
                        compacted_to: 0,
                    }),
                    apply: tokio::sync::Mutex::new(()),
                });
                self.inner.groups.write().insert(shard_id, group);
            }
        }

        tracing::info!(shard_id, replica_id, join, ?sm_type, "replica started");
        self.emit(MembershipEvent::ReplicaStarted { shard_id, replica_id });
        if let Ok((leader_id, true)) = self.get_leader_id(shard_id) {
            self.emit(MembershipEvent::LeaderUpdated { shard_id, replica_id, leader_id });
        }
        Ok(())
    }

    async fn stop_replica(&self, shard_id: ShardId, replica_id: ReplicaId) -> Result<(), TessError> {
        let group = self.group(shard_id)?;
        let sm = {
            let mut st = group.state.lock();
            if st.config.replica_id != replica_id || !st.running {
                return Err(TessError::Rejected(format!(
                    "replica {replica_id} of shard {shard_id} is not running"
                )));
            }
            st.running = false;
            st.leader = None;
            st.sm.clone()
        };
        tokio::task::spawn_blocking(move || sm.lock().close()).await.map_err(join_err)??;

        tracing::info!(shard_id, replica_id, "replica stopped");
        self.emit(MembershipEvent::ReplicaStopped { shard_id, replica_id });
        Ok(())
    }

    async fn remove_data(&self, shard_id: ShardId, replica_id: ReplicaId) -> Result<(), TessError> {
        self.check_running()?;
        let mut groups = self.inner.groups.write();
        let Some(group) = groups.get(&shard_id) else {
            return Ok(());
        };
        {
            let st = group.state.lock();
            if st.config.replica_id != replica_id {
                return Ok(());
            }
            if st.running {
                return Err(TessError::Rejected(format!(
                    "replica {replica_id} of shard {shard_id} must be stopped first"
                )));
            }
            if st.membership.contains(replica_id) {
                return Err(TessError::Rejected(format!(
                    "replica {replica_id} is still a member of shard {shard_id}"
                )));
            }
        }
        groups.remove(&shard_id);
        drop(groups);

        tracing::info!(shard_id, replica_id, "replica data removed");
        self.emit(MembershipEvent::ReplicaDataRemoved { shard_id, replica_id });
        Ok(())
    }

    async fn request_compaction(&self, shard_id: ShardId, replica_id: ReplicaId) -> Result<(), TessError> {
        let group = self.group(shard_id)?;
        let mut st = group.state.lock();
        if st.config.replica_id != replica_id || !st.running {
            return Err(TessError::ShardNotReady(shard_id));
        }
        let Some(snapshot_index) = st.snapshot.as_ref().map(|(i, _)| *i) else {
            return Err(TessError::Rejected("no snapshot to compact against".into()));
        };
        let target = snapshot_index.saturating_sub(st.config.compaction_overhead);
        if target <= st.compacted_to {
            return Err(TessError::Rejected("nothing to compact".into()));
        }
        st.compacted_to = target;
        tracing::debug!(shard_id, replica_id, compacted_to = target, "log compacted");
        Ok(())
    }

    async fn sync_request_snapshot(
        &self,
        shard_id: ShardId,
        option: SnapshotOption,
        timeout: Duration,
    ) -> Result<u64, TessError> {
        let group = self.group(shard_id)?;
        if !group.state.lock().running {
            return Err(TessError::ShardNotReady(shard_id));
        }
        with_timeout(timeout, async {
            let _order = group.apply.lock().await;
            if option.exported {
                if option.export_path.is_empty() {
                    return Err(TessError::InvalidArgument("export path is required".into()));
                }
                let (index, sm) = {
                    let st = group.state.lock();
                    (st.log_index, st.sm.clone())
                };
                let dir = PathBuf::from(&option.export_path);
                tokio::task::spawn_blocking(move || -> Result<(), TessError> {
                    let bytes = sm.lock().save_snapshot()?;
                    std::fs::create_dir_all(&dir).map_err(|e| TessError::Storage(e.to_string()))?;
                    let file = dir.join(format!("snapshot-{shard_id}-{index:016x}"));
                    std::fs::write(file, bytes).map_err(|e| TessError::Storage(e.to_string()))
                })
                .await
                .map_err(join_err)??;
                return Ok(index);
            }
            let overhead = if option.override_compaction_overhead {
                option.compaction_overhead
            } else {
                group.state.lock().config.compaction_overhead
            };
            self.capture_snapshot(&group, overhead).await
        })
        .await
    }

    fn host_info(&self) -> HostInfo {
        let groups = self.inner.groups.read();
        let mut shards: Vec<ShardInfo> = groups
            .iter()
            .filter_map(|(shard_id, group)| {
                let st = group.state.lock();
                if !st.running {
                    return None;
                }
                let replica_id = st.config.replica_id;
                Some(ShardInfo {
                    shard_id: *shard_id,
                    replica_id,
                    replicas: st.membership.replicas.clone(),
                    config_change_index: st.membership.config_change_id,
                    state_machine_type: st.sm_type,
                    is_leader: st.leader == Some(replica_id),
                    is_observer: st.membership.observers.contains_key(&replica_id),
                    is_witness: st.membership.witnesses.contains_key(&replica_id),
                    pending: false,
                })
            })
            .collect();
        shards.sort_by_key(|s| s.shard_id);
        HostInfo { host_id: self.id(), raft_address: self.raft_address(), shards }
    }

    fn has_node_info(&self, shard_id: ShardId, replica_id: ReplicaId) -> bool {
        self.inner
            .groups
            .read()
            .get(&shard_id)
            .map(|g| g.state.lock().config.replica_id == replica_id)
            .unwrap_or(false)
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.inner.events.subscribe()
    }

    fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let groups = self.inner.groups.read();
        for (shard_id, group) in groups.iter() {
            let mut st = group.state.lock();
            if !st.running {
                continue;
            }
            st.running = false;
            st.leader = None;
            if let Err(e) = st.sm.lock().close() {
                tracing::warn!(shard_id, error = %e, "state machine close failed");
            }
            self.emit(MembershipEvent::ReplicaStopped {
                shard_id: *shard_id,
                replica_id: st.config.replica_id,
            });
        }
        tracing::info!(host_id = %self.inner.id, "host stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
