//! Leader-aware cluster client.
//!
//! Writes are routed to the current leader, reads round-robin across the
//! followers (falling back to the leader when none are ready). The server
//! list comes from `GetServers` and is refreshed in the background.

mod picker;
mod resolver;

pub use picker::Picker;
pub use resolver::Resolver;

use std::sync::Arc;

use tonic::transport::Channel;

use crate::error::{Error, Result};
use crate::proto::cache_client::CacheClient;
use crate::proto::{Empty, GetRequest, Server, SetRequest};

const SET_METHOD: &str = "/cachet.cache.Cache/Set";
const GET_METHOD: &str = "/cachet.cache.Cache/Get";
const GET_SERVERS_METHOD: &str = "/cachet.cache.Cache/GetServers";

pub struct Client {
    picker: Arc<Picker<Channel>>,
    resolver: Resolver,
}

impl Client {
    /// Connects to any node of the cluster and discovers the rest.
    pub async fn connect(endpoint: &str) -> Result<Client> {
        let picker = Arc::new(Picker::new());
        let resolver = Resolver::new(endpoint, picker.clone()).await?;
        Ok(Client { picker, resolver })
    }

    pub async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let channel = self.picker.pick(SET_METHOD)?;
        let mut client = CacheClient::new(channel);
        client
            .set(SetRequest {
                key: key.to_string(),
                value,
            })
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let channel = self.picker.pick(GET_METHOD)?;
        let mut client = CacheClient::new(channel);
        let response = client
            .get(GetRequest {
                key: key.to_string(),
            })
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(response.into_inner().value)
    }

    pub async fn get_servers(&self) -> Result<Vec<Server>> {
        let channel = self.picker.pick(GET_SERVERS_METHOD)?;
        let mut client = CacheClient::new(channel);
        let response = client
            .get_servers(Empty {})
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(response.into_inner().servers)
    }

    /// Forces a server-list refresh, e.g. after a leadership change.
    pub async fn resolve_now(&self) -> Result<()> {
        self.resolver.resolve_now().await
    }
}
