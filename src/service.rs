//! The service supervisor: wires mux, store, RPC, HTTP and registry
//! together and owns shutdown.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::transport::Server;
use tracing::{debug, error, info};

use crate::cache::MemoryCache;
use crate::error::{Error, Result};
use crate::http;
use crate::mux::{Mux, MuxLanes, MuxStream};
use crate::proto::cache_server::CacheServer;
use crate::registry::{self, Registry};
use crate::rpc::CacheService;
use crate::store::{Store, StoreConfig};

const BOOTSTRAP_LEADER_TIMEOUT: Duration = Duration::from_secs(3);

/// All of the customizable values for [`Service`].
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Where to store raft data.
    pub data_dir: PathBuf,
    /// Gossip bind address; its host also anchors the advertised RPC addr.
    pub bind_addr: String,
    /// Port shared by replication, client RPC and HTTP connections.
    pub rpc_port: u16,
    /// Unique name on the cluster.
    pub node_name: String,
    /// Should this node seed the cluster?
    pub bootstrap: bool,
    /// Gossip addresses to join at startup.
    pub start_join_addrs: Vec<String>,

    // Client interfaces. At least one must be enabled.
    pub enable_http: bool,
    pub enable_rpc: bool,

    /// Serve reads through the replicated log instead of the local cache.
    pub strong_consistency: bool,
}

impl Config {
    /// The advertised host:rpc_port string peers and clients dial.
    pub fn rpc_addr(&self) -> Result<String> {
        let (host, _) = self
            .bind_addr
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddr(self.bind_addr.clone()))?;
        Ok(format!("{host}:{}", self.rpc_port))
    }
}

/// One cache node: the mux, the replicated store, the client surfaces and
/// the registry, with ordered teardown.
pub struct Service {
    pub config: Config,
    store: Arc<Store>,
    registry: Registry,
    rpc_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    tasks: Vec<JoinHandle<()>>,
    shutdown: Mutex<bool>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Service {
    pub async fn new(config: Config) -> Result<Service> {
        // without a client interface the cluster would be write-only noise
        if !config.enable_rpc && !config.enable_http {
            return Err(Error::NoCommunication);
        }

        let rpc_addr = config.rpc_addr()?;
        let mut tasks = Vec::new();

        let (mux, lanes) = Mux::bind(&format!("0.0.0.0:{}", config.rpc_port)).await?;
        let MuxLanes {
            replication,
            rpc: rpc_lane,
            http: http_lane,
        } = lanes;
        tasks.push(tokio::spawn(mux.serve()));

        let cache = Arc::new(MemoryCache::new());
        let store = Store::new(
            StoreConfig {
                data_dir: config.data_dir.clone(),
                node_name: config.node_name.clone(),
                rpc_addr: rpc_addr.clone(),
                bootstrap: config.bootstrap,
                strong_consistency: config.strong_consistency,
                ..StoreConfig::default()
            },
            cache,
            replication,
        )
        .await?;

        if config.bootstrap {
            store.wait_for_leader(BOOTSTRAP_LEADER_TIMEOUT).await?;
        }

        let rpc_shutdown = if config.enable_rpc {
            Some(serve_rpc(&store, rpc_lane, &mut tasks))
        } else {
            // connections classified as RPC are dropped by the mux
            drop(rpc_lane);
            None
        };

        if config.enable_http {
            tasks.push(serve_http(&store, http_lane));
        } else {
            drop(http_lane);
        }

        let mut tags = HashMap::new();
        tags.insert(registry::RPC_ADDR_TAG.to_string(), rpc_addr.clone());
        let registry = Registry::new(
            store.clone(),
            registry::Config {
                node_name: config.node_name.clone(),
                bind_addr: config.bind_addr.clone(),
                tags,
                start_join_addrs: config.start_join_addrs.clone(),
            },
        )
        .await?;

        info!(node = %config.node_name, rpc_addr = %rpc_addr, "service started");

        Ok(Service {
            config,
            store,
            registry,
            rpc_shutdown: Mutex::new(rpc_shutdown),
            tasks,
            shutdown: Mutex::new(false),
        })
    }

    /// Handle to the replicated store, for embedding and tests.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Point-in-time snapshot of gossip membership.
    pub fn members(&self) -> Vec<registry::Member> {
        self.registry.members()
    }

    /// Leaves the registry, stops the client servers, closes the store.
    /// Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        {
            let mut done = self.shutdown.lock();
            if *done {
                return Ok(());
            }
            *done = true;
        }

        self.registry.leave().await;
        if let Some(stop) = self.rpc_shutdown.lock().take() {
            let _ = stop.send(());
        }
        self.store.close().await?;

        for task in &self.tasks {
            task.abort();
        }

        info!(node = %self.config.node_name, "service stopped");
        Ok(())
    }
}

fn serve_rpc(
    store: &Arc<Store>,
    rpc: mpsc::Receiver<MuxStream>,
    tasks: &mut Vec<JoinHandle<()>>,
) -> oneshot::Sender<()> {
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let service = CacheService::with_finder(store.clone(), store.clone());
    let incoming = ReceiverStream::new(rpc).map(Ok::<_, std::io::Error>);

    tasks.push(tokio::spawn(async move {
        let served = Server::builder()
            .add_service(CacheServer::new(service))
            .serve_with_incoming_shutdown(incoming, async {
                let _ = stop_rx.await;
            })
            .await;
        if let Err(e) = served {
            error!(error = %e, "rpc server terminated");
        }
    }));

    stop_tx
}

fn serve_http(store: &Arc<Store>, mut conns: mpsc::Receiver<MuxStream>) -> JoinHandle<()> {
    let service = TowerToHyperService::new(http::router(store.clone()));

    tokio::spawn(async move {
        while let Some(stream) = conns.recv().await {
            let service = service.clone();
            tokio::spawn(async move {
                let served = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
                if let Err(e) = served {
                    debug!(error = %e, "http connection ended");
                }
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_addr_combines_bind_host_and_rpc_port() {
        let config = Config {
            bind_addr: "127.0.0.1:9000".to_string(),
            rpc_port: 9200,
            ..Config::default()
        };
        assert_eq!(config.rpc_addr().unwrap(), "127.0.0.1:9200");
    }

    #[test]
    fn rpc_addr_rejects_portless_bind_addr() {
        let config = Config {
            bind_addr: "localhost".to_string(),
            ..Config::default()
        };
        assert!(matches!(config.rpc_addr(), Err(Error::InvalidAddr(_))));
    }
}
