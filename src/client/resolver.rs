//! Server-list discovery for the client.
//!
//! Dials the configured endpoint once, asks it for the cluster's servers
//! and turns each descriptor into a lazily-connected channel tagged with
//! its leadership attribute. The set is pushed into the picker, refreshed
//! in the background, and on demand through [`Resolver::resolve_now`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use super::picker::Picker;
use crate::error::{Error, Result};
use crate::proto::cache_client::CacheClient;
use crate::proto::Empty;

const REFRESH_INTERVAL: Duration = Duration::from_secs(10);

pub struct Resolver {
    inner: Arc<ResolverInner>,
    refresh: JoinHandle<()>,
}

struct ResolverInner {
    client: tokio::sync::Mutex<CacheClient<Channel>>,
    picker: Arc<Picker<Channel>>,
    channels: Mutex<HashMap<String, Channel>>,
}

impl Resolver {
    /// Connects to `endpoint` (any node of the cluster) and performs the
    /// initial resolution before returning.
    pub async fn new(endpoint: &str, picker: Arc<Picker<Channel>>) -> Result<Resolver> {
        let channel = Endpoint::from_shared(format!("http://{endpoint}"))
            .map_err(|e| Error::InvalidAddr(e.to_string()))?
            .connect()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let inner = Arc::new(ResolverInner {
            client: tokio::sync::Mutex::new(CacheClient::new(channel)),
            picker,
            channels: Mutex::new(HashMap::new()),
        });
        inner.resolve().await?;

        let background = inner.clone();
        let refresh = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
            ticker.tick().await; // the initial resolution just happened
            loop {
                ticker.tick().await;
                if let Err(e) = background.resolve().await {
                    debug!(error = %e, "server list refresh failed");
                }
            }
        });

        Ok(Resolver { inner, refresh })
    }

    /// Re-runs discovery and pushes the fresh set into the picker.
    pub async fn resolve_now(&self) -> Result<()> {
        self.inner.resolve().await
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.refresh.abort();
    }
}

impl ResolverInner {
    async fn resolve(&self) -> Result<()> {
        let servers = {
            let mut client = self.client.lock().await;
            client
                .get_servers(Empty {})
                .await
                .map_err(|e| Error::Transport(e.to_string()))?
                .into_inner()
                .servers
        };

        let mut conns = Vec::with_capacity(servers.len());
        {
            let mut channels = self.channels.lock();
            for server in &servers {
                let channel = match channels.get(&server.rpc_addr) {
                    Some(existing) => existing.clone(),
                    None => {
                        let channel = Endpoint::from_shared(format!("http://{}", server.rpc_addr))
                            .map_err(|e| Error::InvalidAddr(e.to_string()))?
                            .connect_lazy();
                        channels.insert(server.rpc_addr.clone(), channel.clone());
                        channel
                    }
                };
                conns.push((channel, server.is_leader));
            }
            // drop channels to servers that left the configuration
            channels.retain(|addr, _| servers.iter().any(|s| &s.rpc_addr == addr));
        }

        self.picker.rebuild(conns);
        Ok(())
    }
}
