//! The replicated store: a consensus-backed log whose applied entries
//! mutate the node-local byte cache.
//!
//! Writes are leader-only and travel through the log; reads come from the
//! local cache by default (possibly stale, never blocking on consensus) or
//! through the log when strong consistency is configured. Membership
//! changes arrive from the registry via [`crate::registry::Handler`].

mod convert;
pub mod entry;
mod log;
mod network;
mod service;
mod state_machine;
mod types;

pub mod proto {
    tonic::include_proto!("cachet.raft");
}

pub use network::PeerNetwork;
pub use service::RaftServiceImpl;
pub use types::{node_id, ApplyError, ClusterNode, NodeId, Request, Response, TypeConfig};

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{ClientWriteError, InitializeError, RaftError};
use openraft::{ChangeMembers, Raft, RaftMetrics, ServerState, SnapshotPolicy};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::transport::Server;
use tracing::{error, info};

use self::entry::{GET_OPERATION, SET_OPERATION};
use self::log::LogStore;
use self::proto::raft_service_server::RaftServiceServer;
use self::state_machine::StateMachineStore;
use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::mux::MuxStream;

/// Raft instance specialized to the cache type config.
pub type CacheRaft = Raft<TypeConfig>;

/// How long a proposed entry may take to commit and apply.
const APPLY_TIMEOUT: Duration = Duration::from_secs(10);

const LEADER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// User-configurable fields for the raft node. Only `node_name` and
/// `rpc_addr` are required; zeroed timeouts fall back to library defaults.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Where raft snapshots are written (`<data_dir>/raft/`).
    pub data_dir: PathBuf,
    /// Unique name on the cluster; doubles as the raft server id.
    pub node_name: String,
    /// The multiplexed host:port peers and clients dial.
    pub rpc_addr: String,
    /// Seed a single-node cluster configuration at startup.
    pub bootstrap: bool,
    /// Route reads through the log instead of the local cache.
    pub strong_consistency: bool,

    // Consensus tuning, in milliseconds / log entries. None keeps the
    // library default.
    pub heartbeat_interval_ms: Option<u64>,
    pub election_timeout_min_ms: Option<u64>,
    pub election_timeout_max_ms: Option<u64>,
    pub snapshot_threshold: Option<u64>,
}

/// A raft node plus the byte cache it replicates.
pub struct Store {
    conf: StoreConfig,
    id: NodeId,
    raft: CacheRaft,
    network: PeerNetwork,
    cache: Arc<dyn Cache>,
    replication_server: JoinHandle<()>,
    closed: AtomicBool,
}

impl Store {
    /// Creates the store and starts serving peer RPCs on `replication`,
    /// the mux lane carrying marker-prefixed streams.
    pub async fn new(
        conf: StoreConfig,
        cache: Arc<dyn Cache>,
        replication: mpsc::Receiver<MuxStream>,
    ) -> Result<Arc<Store>> {
        let id = types::node_id(&conf.node_name);

        let mut raft_config = openraft::Config {
            cluster_name: "cachet".to_string(),
            ..Default::default()
        };
        if let Some(ms) = conf.heartbeat_interval_ms {
            raft_config.heartbeat_interval = ms;
        }
        if let Some(ms) = conf.election_timeout_min_ms {
            raft_config.election_timeout_min = ms;
        }
        if let Some(ms) = conf.election_timeout_max_ms {
            raft_config.election_timeout_max = ms;
        }
        if let Some(n) = conf.snapshot_threshold {
            raft_config.snapshot_policy = SnapshotPolicy::LogsSinceLast(n);
        }
        let raft_config = Arc::new(
            raft_config
                .validate()
                .map_err(|e| Error::Consensus(format!("invalid raft config: {e}")))?,
        );

        let log_store = LogStore::default();
        let sm_store = StateMachineStore::new(conf.data_dir.join("raft"), cache.clone());
        let network = PeerNetwork::new();

        let raft = Raft::new(id, raft_config, network.clone(), log_store, sm_store)
            .await
            .map_err(|e| Error::Consensus(format!("failed to create raft node: {e}")))?;

        let incoming = ReceiverStream::new(replication).map(Ok::<_, std::io::Error>);
        let raft_service = RaftServiceImpl::new(raft.clone());
        let replication_server = tokio::spawn(async move {
            let served = Server::builder()
                .add_service(RaftServiceServer::new(raft_service))
                .serve_with_incoming(incoming)
                .await;
            if let Err(e) = served {
                error!(error = %e, "replication server terminated");
            }
        });

        let store = Store {
            id,
            raft,
            network,
            cache,
            replication_server,
            closed: AtomicBool::new(false),
            conf,
        };

        if store.conf.bootstrap {
            let mut members = BTreeMap::new();
            members.insert(
                id,
                ClusterNode::new(store.conf.node_name.clone(), store.conf.rpc_addr.clone()),
            );
            match store.raft.initialize(members).await {
                Ok(()) => info!(node = %store.conf.node_name, "bootstrapped cluster"),
                Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                    info!(node = %store.conf.node_name, "cluster already initialized");
                }
                Err(e) => {
                    return Err(Error::Consensus(format!("failed to initialize cluster: {e}")))
                }
            }
        }

        Ok(Arc::new(store))
    }

    fn metrics(&self) -> RaftMetrics<NodeId, ClusterNode> {
        self.raft.metrics().borrow().clone()
    }

    fn is_leader(&self) -> bool {
        self.metrics().state == ServerState::Leader
    }

    /// Proposes the encoded entry and waits for it to commit and apply.
    async fn propose(&self, data: Vec<u8>) -> Result<Response> {
        let write = self.raft.client_write(Request::new(data));
        match timeout(APPLY_TIMEOUT, write).await {
            Ok(result) => Ok(result.map_err(classify_write_error)?.data),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Replicates a key-value pair into the cluster. Leader-only; returns
    /// the leader's apply-time cache error, if any.
    pub async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        if !self.is_leader() {
            return Err(Error::NotLeader);
        }

        let response = self.propose(entry::encode(SET_OPERATION, key, value)).await?;
        match response.error {
            None => Ok(()),
            Some(e) => Err(e.into()),
        }
    }

    /// Reads a key. By default this is a local cache lookup, which may be
    /// stale on followers but never blocks on consensus. With strong
    /// consistency the read travels through the log and is leader-only.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        if self.conf.strong_consistency {
            if !self.is_leader() {
                return Err(Error::NotLeader);
            }

            let response = self.propose(entry::encode(GET_OPERATION, key, &[])).await?;
            return match response.error {
                None => Ok(response.value.unwrap_or_default()),
                Some(e) => Err(e.into()),
            };
        }

        self.cache.get(key)
    }

    /// Adds a voting member. Idempotent when `(name, addr)` is already
    /// present; a member colliding on either field is removed first.
    pub async fn join(&self, name: &str, addr: &str) -> Result<()> {
        self.join_helper(name, addr, true).await
    }

    /// Adds a non-voting replica: it serves reads but is not counted in
    /// the quorum.
    pub async fn join_nonvoter(&self, name: &str, addr: &str) -> Result<()> {
        self.join_helper(name, addr, false).await
    }

    async fn join_helper(&self, name: &str, addr: &str, voter: bool) -> Result<()> {
        info!(id = name, addr, "join request");

        if !self.is_leader() {
            return Err(Error::NotLeader);
        }
        if name == self.conf.node_name {
            return Err(Error::JoiningSelf);
        }

        let id = types::node_id(name);
        let mut stale: Vec<NodeId> = Vec::new();
        {
            let metrics = self.metrics();
            for (existing_id, node) in metrics.membership_config.membership().nodes() {
                if *existing_id == id || node.rpc_addr == addr {
                    if *existing_id == id && node.rpc_addr == addr {
                        // already a member with identical info
                        return Ok(());
                    }
                    stale.push(*existing_id);
                }
            }
        }
        for old in stale {
            self.remove_member(old).await?;
            info!(id = name, "removed stale member before rejoin");
        }

        self.network.add_peer(id, addr.to_string());
        let node = ClusterNode::new(name, addr);
        self.raft
            .add_learner(id, node, true)
            .await
            .map_err(classify_write_error)?;

        if voter {
            let mut voters: BTreeSet<NodeId> = {
                let metrics = self.metrics();
                metrics.membership_config.membership().voter_ids().collect()
            };
            voters.insert(id);
            self.raft
                .change_membership(voters, false)
                .await
                .map_err(classify_write_error)?;
        }

        info!(id = name, addr, voter, "node joined");
        Ok(())
    }

    /// Removes a member from the configuration. Leader-only; a no-op for
    /// names that are not part of the cluster.
    pub async fn leave(&self, name: &str) -> Result<()> {
        info!(id = name, "leave request");

        if !self.is_leader() {
            return Err(Error::NotLeader);
        }

        self.remove_member(types::node_id(name)).await?;
        info!(id = name, "node removed");
        Ok(())
    }

    async fn remove_member(&self, id: NodeId) -> Result<()> {
        let (known, is_voter) = {
            let metrics = self.metrics();
            let membership = metrics.membership_config.membership();
            (
                membership.get_node(&id).is_some(),
                membership.voter_ids().any(|v| v == id),
            )
        };
        if !known {
            return Ok(());
        }

        if is_voter {
            let voters: BTreeSet<NodeId> = {
                let metrics = self.metrics();
                metrics
                    .membership_config
                    .membership()
                    .voter_ids()
                    .filter(|v| *v != id)
                    .collect()
            };
            self.raft
                .change_membership(voters, false)
                .await
                .map_err(classify_write_error)?;
        } else {
            let mut ids = BTreeSet::new();
            ids.insert(id);
            self.raft
                .change_membership(ChangeMembers::RemoveNodes(ids), false)
                .await
                .map_err(classify_write_error)?;
        }

        self.network.remove_peer(id);
        Ok(())
    }

    /// The current leader's RPC address, if one is known.
    pub fn leader_addr(&self) -> Option<String> {
        let metrics = self.metrics();
        let leader = metrics.current_leader?;
        metrics
            .membership_config
            .membership()
            .get_node(&leader)
            .map(|node| node.rpc_addr.clone())
    }

    /// Polls until a leader is elected, or fails with [`Error::Timeout`].
    pub async fn wait_for_leader(&self, wait: Duration) -> Result<String> {
        let deadline = Instant::now() + wait;
        let mut ticker = tokio::time::interval(LEADER_POLL_INTERVAL);
        loop {
            ticker.tick().await;
            if let Some(addr) = self.leader_addr() {
                return Ok(addr);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
        }
    }

    /// The current configuration as server descriptors. Exactly one entry
    /// has `is_leader` set while a leader exists.
    pub fn get_servers(&self) -> Vec<crate::proto::Server> {
        let metrics = self.metrics();
        let leader = metrics.current_leader;
        let membership = metrics.membership_config.membership();
        let voters: BTreeSet<NodeId> = membership.voter_ids().collect();

        membership
            .nodes()
            .map(|(id, node)| crate::proto::Server {
                id: node.name.clone(),
                rpc_addr: node.rpc_addr.clone(),
                is_leader: leader == Some(*id),
                vote_status: if voters.contains(id) { "voter" } else { "nonvoter" }.to_string(),
            })
            .collect()
    }

    /// Hands leadership to another node. openraft has no transfer call,
    /// so the store goes quiet instead: without our heartbeats a follower
    /// times out and starts an election, and with local elections disabled
    /// this node cannot win it back. Heartbeats and elections are restored
    /// once a new leader is observed (or the attempt times out).
    pub async fn step_down(&self, wait: bool) -> Result<()> {
        if !self.is_leader() {
            return Err(Error::NotLeader);
        }

        let runtime = self.raft.runtime_config();
        runtime.heartbeat(false);
        runtime.elect(false);

        let raft = self.raft.clone();
        let id = self.id;
        let handoff = async move {
            let mut metrics = raft.metrics();
            loop {
                {
                    let current = metrics.borrow();
                    if matches!(current.current_leader, Some(leader) if leader != id) {
                        break true;
                    }
                }
                if metrics.changed().await.is_err() {
                    break false;
                }
            }
        };

        if wait {
            let transferred = timeout(APPLY_TIMEOUT, handoff).await;
            runtime.heartbeat(true);
            runtime.elect(true);
            match transferred {
                Ok(true) => Ok(()),
                Ok(false) => Err(Error::Consensus(
                    "metrics stream ended during leadership transfer".to_string(),
                )),
                Err(_) => Err(Error::Timeout),
            }
        } else {
            let raft = self.raft.clone();
            tokio::spawn(async move {
                let _ = timeout(APPLY_TIMEOUT, handoff).await;
                let runtime = raft.runtime_config();
                runtime.heartbeat(true);
                runtime.elect(true);
            });
            Ok(())
        }
    }

    /// Shuts down the raft node, then the byte cache. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.raft
            .shutdown()
            .await
            .map_err(|e| Error::Consensus(format!("raft shutdown failed: {e}")))?;
        self.replication_server.abort();
        self.cache.close()
    }
}

fn classify_write_error(
    e: RaftError<NodeId, ClientWriteError<NodeId, ClusterNode>>,
) -> Error {
    match e {
        RaftError::APIError(ClientWriteError::ForwardToLeader(_)) => Error::NotLeader,
        other => Error::Consensus(other.to_string()),
    }
}

#[tonic::async_trait]
impl crate::registry::Handler for Store {
    async fn join(&self, id: &str, addr: &str) -> Result<()> {
        Store::join(self, id, addr).await
    }

    async fn leave(&self, id: &str) -> Result<()> {
        Store::leave(self, id).await
    }
}

#[tonic::async_trait]
impl crate::rpc::Cache for Store {
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        Store::set(self, key, &value).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        Store::get(self, key).await
    }
}

#[tonic::async_trait]
impl crate::rpc::ServerFinder for Store {
    async fn get_servers(&self) -> Result<Vec<crate::proto::Server>> {
        Ok(Store::get_servers(self))
    }
}
