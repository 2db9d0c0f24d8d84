use std::collections::BTreeMap;
use std::fmt::Debug;
use std::ops::RangeBounds;
use std::sync::Arc;

use openraft::storage::{LogFlushed, LogState, RaftLogStorage};
use openraft::{Entry, LogId, OptionalSend, RaftLogReader, StorageError, Vote};
use parking_lot::RwLock;

use super::types::{NodeId, TypeConfig};

/// In-memory raft log and vote storage.
///
/// Entries live only for the lifetime of the process; a restarted node is
/// caught up from the leader's log or the latest snapshot.
#[derive(Debug, Clone, Default)]
pub struct LogStore {
    state: Arc<RwLock<LogStoreState>>,
}

#[derive(Debug, Default)]
struct LogStoreState {
    last_purged_log_id: Option<LogId<NodeId>>,
    logs: BTreeMap<u64, Entry<TypeConfig>>,
    vote: Option<Vote<NodeId>>,
    committed: Option<LogId<NodeId>>,
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        let state = self.state.read();
        Ok(state.logs.range(range).map(|(_, v)| v.clone()).collect())
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let state = self.state.read();
        let last_log_id = state.logs.last_key_value().map(|(_, v)| v.log_id);

        Ok(LogState {
            last_purged_log_id: state.last_purged_log_id,
            last_log_id: last_log_id.or(state.last_purged_log_id),
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(self.state.read().vote)
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.state.write().vote = Some(*vote);
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(self.state.read().committed)
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        self.state.write().committed = committed;
        Ok(())
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        {
            let mut state = self.state.write();
            for entry in entries {
                state.logs.insert(entry.log_id.index, entry);
            }
        }
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        let mut state = self.state.write();
        let keys: Vec<u64> = state.logs.range(log_id.index..).map(|(k, _)| *k).collect();
        for key in keys {
            state.logs.remove(&key);
        }
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        let mut state = self.state.write();
        let keys: Vec<u64> = state.logs.range(..=log_id.index).map(|(k, _)| *k).collect();
        for key in keys {
            state.logs.remove(&key);
        }
        state.last_purged_log_id = Some(log_id);
        Ok(())
    }
}
