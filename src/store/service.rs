use tonic::{Request, Response, Status};

use super::convert;
use super::proto;
use super::proto::raft_service_server::RaftService;
use super::CacheRaft;

/// Server side of the peer replication RPCs, fed by the mux's raft lane.
pub struct RaftServiceImpl {
    raft: CacheRaft,
}

impl RaftServiceImpl {
    pub fn new(raft: CacheRaft) -> Self {
        Self { raft }
    }
}

#[tonic::async_trait]
impl RaftService for RaftServiceImpl {
    async fn append_entries(
        &self,
        request: Request<proto::AppendEntriesRequest>,
    ) -> Result<Response<proto::AppendEntriesResponse>, Status> {
        let rpc = convert::append_request_from_proto(request.into_inner()).map_err(Status::from)?;
        let request_vote = rpc.vote;

        let response = self
            .raft
            .append_entries(rpc)
            .await
            .map_err(|e| Status::internal(format!("append entries failed: {e}")))?;

        Ok(Response::new(convert::append_response_to_proto(
            response,
            request_vote,
        )))
    }

    async fn vote(
        &self,
        request: Request<proto::VoteRequest>,
    ) -> Result<Response<proto::VoteResponse>, Status> {
        let rpc = convert::vote_request_from_proto(request.into_inner());

        let response = self
            .raft
            .vote(rpc)
            .await
            .map_err(|e| Status::internal(format!("vote failed: {e}")))?;

        Ok(Response::new(convert::vote_response_to_proto(response)))
    }

    async fn install_snapshot(
        &self,
        request: Request<proto::InstallSnapshotRequest>,
    ) -> Result<Response<proto::InstallSnapshotResponse>, Status> {
        let rpc =
            convert::snapshot_request_from_proto(request.into_inner()).map_err(Status::from)?;

        let response = self
            .raft
            .install_snapshot(rpc)
            .await
            .map_err(|e| Status::internal(format!("install snapshot failed: {e}")))?;

        Ok(Response::new(convert::snapshot_response_to_proto(response)))
    }
}
