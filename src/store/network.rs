use std::io;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use hyper_util::rt::TokioIo;
use openraft::error::{InstallSnapshotError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use super::convert;
use super::proto::raft_service_client::RaftServiceClient;
use super::types::{ClusterNode, NodeId, TypeConfig};
use crate::mux::REPLICATION_MARKER;

/// Replication network over the shared RPC port.
///
/// Peers are dialed at their advertised `rpc_addr`; the connector writes
/// the replication marker before the HTTP/2 handshake so the remote mux
/// hands the stream to its raft lane. Connected channels are cached per
/// peer and dropped when the peer's address changes.
#[derive(Clone, Default)]
pub struct PeerNetwork {
    peers: Arc<DashMap<NodeId, String>>,
    clients: Arc<DashMap<NodeId, RaftServiceClient<Channel>>>,
}

impl PeerNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&self, node_id: NodeId, addr: String) {
        let stale = self
            .peers
            .insert(node_id, addr.clone())
            .is_some_and(|old| old != addr);
        if stale {
            self.clients.remove(&node_id);
        }
    }

    pub fn remove_peer(&self, node_id: NodeId) {
        self.peers.remove(&node_id);
        self.clients.remove(&node_id);
    }

    async fn client(&self, target: NodeId) -> Result<RaftServiceClient<Channel>, Unreachable> {
        if let Some(client) = self.clients.get(&target) {
            return Ok(client.clone());
        }

        let addr = self
            .peers
            .get(&target)
            .map(|a| a.value().clone())
            .ok_or_else(|| {
                Unreachable::new(&io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("peer {target} not found"),
                ))
            })?;

        let channel = dial(&addr).await.map_err(|e| Unreachable::new(&e))?;
        let client = RaftServiceClient::new(channel);
        self.clients.insert(target, client.clone());
        Ok(client)
    }
}

/// Opens a replication channel to `addr`, prefixed with the marker byte.
async fn dial(addr: &str) -> Result<Channel, io::Error> {
    let endpoint = Endpoint::from_shared(format!("http://{addr}"))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(10))
        .tcp_keepalive(Some(Duration::from_secs(30)));

    let target = addr.to_string();
    endpoint
        .connect_with_connector(service_fn(move |_: Uri| {
            let target = target.clone();
            async move {
                let mut stream = TcpStream::connect(&target).await?;
                stream.write_all(&[REPLICATION_MARKER]).await?;
                Ok::<_, io::Error>(TokioIo::new(stream))
            }
        }))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))
}

fn peer_unreachable<E: std::error::Error>(message: String) -> RPCError<NodeId, ClusterNode, E> {
    RPCError::Unreachable(Unreachable::new(&io::Error::new(
        io::ErrorKind::Other,
        message,
    )))
}

/// Connection to a specific peer.
pub struct PeerConnection {
    target: NodeId,
    network: PeerNetwork,
}

impl RaftNetworkFactory<TypeConfig> for PeerNetwork {
    type Network = PeerConnection;

    async fn new_client(&mut self, target: NodeId, node: &ClusterNode) -> Self::Network {
        self.add_peer(target, node.rpc_addr.clone());

        PeerConnection {
            target,
            network: self.clone(),
        }
    }
}

impl RaftNetwork<TypeConfig> for PeerConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, ClusterNode, RaftError<NodeId>>>
    {
        let mut client = self
            .network
            .client(self.target)
            .await
            .map_err(RPCError::Unreachable)?;

        let request = tonic::Request::new(convert::append_request_to_proto(&rpc));
        let response = client
            .append_entries(request)
            .await
            .map_err(|e| peer_unreachable(e.to_string()))?;

        Ok(convert::append_response_from_proto(response.into_inner()))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, ClusterNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        let mut client = self
            .network
            .client(self.target)
            .await
            .map_err(RPCError::Unreachable)?;

        let request = tonic::Request::new(convert::snapshot_request_to_proto(&rpc));
        let response = client
            .install_snapshot(request)
            .await
            .map_err(|e| peer_unreachable(e.to_string()))?;

        Ok(convert::snapshot_response_from_proto(response.into_inner()))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, ClusterNode, RaftError<NodeId>>> {
        let mut client = self
            .network
            .client(self.target)
            .await
            .map_err(RPCError::Unreachable)?;

        let request = tonic::Request::new(convert::vote_request_to_proto(&rpc));
        let response = client
            .vote(request)
            .await
            .map_err(|e| peer_unreachable(e.to_string()))?;

        Ok(convert::vote_response_from_proto(response.into_inner()))
    }
}
