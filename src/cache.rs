use dashmap::DashMap;

use crate::error::{Error, Result};

/// The byte-cache capability backing the replicated state machine.
///
/// Implementations may impose TTLs, size caps or sharded concurrency; the
/// store only requires these four operations. All mutation happens through
/// the replicated apply path, never from clients directly.
pub trait Cache: Send + Sync + 'static {
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Looks up a key. An absent key is an error, not an empty value.
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Point-in-time snapshot of every entry, used to persist snapshots.
    fn entries(&self) -> Vec<(String, Vec<u8>)>;

    fn close(&self) -> Result<()>;
}

/// Default in-process cache over a concurrent hash map.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Cache for MemoryCache {
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.entries
            .get(key)
            .map(|v| v.clone())
            .ok_or_else(|| Error::Cache(format!("entry not found: {key}")))
    }

    fn entries(&self) -> Vec<(String, Vec<u8>)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    fn close(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}
