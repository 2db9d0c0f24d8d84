//! Conversions between openraft types and their wire representation.
//!
//! Entry payloads and membership travel as bincode bytes; log ids and votes
//! are flattened into plain proto messages.

use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::{CommittedLeaderId, EntryPayload, LogId, Vote};

use super::proto;
use super::types::{NodeId, TypeConfig};
use crate::error::{Error, Result};

pub(super) fn log_id_to_proto(log_id: Option<LogId<NodeId>>) -> Option<proto::LogId> {
    log_id.map(|l| proto::LogId {
        term: l.leader_id.term,
        node_id: l.leader_id.node_id,
        index: l.index,
    })
}

pub(super) fn log_id_from_proto(log_id: Option<proto::LogId>) -> Option<LogId<NodeId>> {
    log_id.map(|l| LogId::new(CommittedLeaderId::new(l.term, l.node_id), l.index))
}

pub(super) fn vote_to_proto(vote: Vote<NodeId>) -> proto::VoteData {
    proto::VoteData {
        leader_id: vote.leader_id().node_id,
        committed: vote.is_committed(),
    }
}

pub(super) fn vote_from_proto(vote: Option<proto::VoteData>) -> Vote<NodeId> {
    match vote {
        Some(v) => {
            if v.committed {
                Vote::new_committed(v.leader_id, v.leader_id)
            } else {
                Vote::new(v.leader_id, v.leader_id)
            }
        }
        None => Vote::new(0, 0),
    }
}

pub(super) fn append_request_to_proto(
    rpc: &AppendEntriesRequest<TypeConfig>,
) -> proto::AppendEntriesRequest {
    let entries: Vec<proto::Entry> = rpc
        .entries
        .iter()
        .map(|e| proto::Entry {
            log_id: log_id_to_proto(Some(e.log_id)),
            payload: bincode::serialize(&e.payload).unwrap_or_default(),
        })
        .collect();

    proto::AppendEntriesRequest {
        vote: Some(vote_to_proto(rpc.vote)),
        prev_log_id: log_id_to_proto(rpc.prev_log_id),
        entries,
        leader_commit: log_id_to_proto(rpc.leader_commit),
    }
}

pub(super) fn append_request_from_proto(
    req: proto::AppendEntriesRequest,
) -> Result<AppendEntriesRequest<TypeConfig>> {
    let entries: Result<Vec<openraft::Entry<TypeConfig>>> = req
        .entries
        .iter()
        .map(|e| {
            let log_id = log_id_from_proto(e.log_id.clone())
                .ok_or_else(|| Error::MalformedEntry("missing log id".to_string()))?;
            let payload: EntryPayload<TypeConfig> = bincode::deserialize(&e.payload)?;
            Ok(openraft::Entry { log_id, payload })
        })
        .collect();

    Ok(AppendEntriesRequest {
        vote: vote_from_proto(req.vote),
        prev_log_id: log_id_from_proto(req.prev_log_id),
        entries: entries?,
        leader_commit: log_id_from_proto(req.leader_commit),
    })
}

pub(super) fn append_response_to_proto(
    response: AppendEntriesResponse<NodeId>,
    request_vote: Vote<NodeId>,
) -> proto::AppendEntriesResponse {
    let (success, conflict, vote) = match response {
        AppendEntriesResponse::Success => (true, None, request_vote),
        AppendEntriesResponse::PartialSuccess(log_id) => (true, log_id, request_vote),
        AppendEntriesResponse::HigherVote(v) => (false, None, v),
        AppendEntriesResponse::Conflict => (false, None, request_vote),
    };

    proto::AppendEntriesResponse {
        vote: Some(vote_to_proto(vote)),
        success,
        conflict: log_id_to_proto(conflict),
    }
}

pub(super) fn append_response_from_proto(
    resp: proto::AppendEntriesResponse,
) -> AppendEntriesResponse<NodeId> {
    if resp.success {
        AppendEntriesResponse::Success
    } else if log_id_from_proto(resp.conflict).is_some() {
        AppendEntriesResponse::Conflict
    } else {
        AppendEntriesResponse::HigherVote(vote_from_proto(resp.vote))
    }
}

pub(super) fn vote_request_to_proto(rpc: &VoteRequest<NodeId>) -> proto::VoteRequest {
    proto::VoteRequest {
        vote: Some(vote_to_proto(rpc.vote)),
        last_log_id: log_id_to_proto(rpc.last_log_id),
    }
}

pub(super) fn vote_request_from_proto(req: proto::VoteRequest) -> VoteRequest<NodeId> {
    VoteRequest {
        vote: vote_from_proto(req.vote),
        last_log_id: log_id_from_proto(req.last_log_id),
    }
}

pub(super) fn vote_response_to_proto(resp: VoteResponse<NodeId>) -> proto::VoteResponse {
    proto::VoteResponse {
        vote: Some(vote_to_proto(resp.vote)),
        vote_granted: resp.vote_granted,
        last_log_id: log_id_to_proto(resp.last_log_id),
    }
}

pub(super) fn vote_response_from_proto(resp: proto::VoteResponse) -> VoteResponse<NodeId> {
    VoteResponse {
        vote: vote_from_proto(resp.vote),
        vote_granted: resp.vote_granted,
        last_log_id: log_id_from_proto(resp.last_log_id),
    }
}

pub(super) fn snapshot_request_to_proto(
    rpc: &InstallSnapshotRequest<TypeConfig>,
) -> proto::InstallSnapshotRequest {
    proto::InstallSnapshotRequest {
        vote: Some(vote_to_proto(rpc.vote)),
        meta: Some(proto::SnapshotMeta {
            last_log_id: log_id_to_proto(rpc.meta.last_log_id),
            last_membership: bincode::serialize(&rpc.meta.last_membership).unwrap_or_default(),
            snapshot_id: rpc.meta.snapshot_id.clone(),
        }),
        offset: rpc.offset,
        data: rpc.data.clone(),
        done: rpc.done,
    }
}

pub(super) fn snapshot_request_from_proto(
    req: proto::InstallSnapshotRequest,
) -> Result<InstallSnapshotRequest<TypeConfig>> {
    let meta = req
        .meta
        .ok_or_else(|| Error::MalformedEntry("missing snapshot meta".to_string()))?;

    let last_membership = bincode::deserialize(&meta.last_membership)?;

    Ok(InstallSnapshotRequest {
        vote: vote_from_proto(req.vote),
        meta: openraft::SnapshotMeta {
            last_log_id: log_id_from_proto(meta.last_log_id),
            last_membership,
            snapshot_id: meta.snapshot_id,
        },
        offset: req.offset,
        data: req.data,
        done: req.done,
    })
}

pub(super) fn snapshot_response_to_proto(
    resp: InstallSnapshotResponse<NodeId>,
) -> proto::InstallSnapshotResponse {
    proto::InstallSnapshotResponse {
        vote: Some(vote_to_proto(resp.vote)),
    }
}

pub(super) fn snapshot_response_from_proto(
    resp: proto::InstallSnapshotResponse,
) -> InstallSnapshotResponse<NodeId> {
    InstallSnapshotResponse {
        vote: vote_from_proto(resp.vote),
    }
}
