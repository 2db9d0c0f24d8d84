//! Membership registry on top of the gossip layer.
//!
//! Translates gossip events into calls on an abstract [`Handler`] so the
//! store stays unaware of the registry. Handler failures are logged and
//! swallowed: on follower nodes `NotLeader` is the normal outcome, and
//! only the leader actually reconciles membership.

mod gossip;

pub use gossip::{Event, Member};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use self::gossip::Gossip;
use crate::error::{Error, Result};

/// The member tag carrying the node's RPC endpoint. Mandatory.
pub const RPC_ADDR_TAG: &str = "rpc_addr";

const EVENT_CAPACITY: usize = 64;

/// Receives membership changes; the replicated store implements this.
#[tonic::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn join(&self, id: &str, addr: &str) -> Result<()>;
    async fn leave(&self, id: &str) -> Result<()>;
}

/// All the configurable fields for [`Registry`].
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub node_name: String,
    /// UDP address the gossip layer binds; distinct from the RPC port.
    pub bind_addr: String,
    pub tags: HashMap<String, String>,
    /// Gossip addresses of existing members to contact at startup.
    pub start_join_addrs: Vec<String>,
}

/// Service discovery for the cluster.
pub struct Registry {
    gossip: Gossip,
    event_loop: JoinHandle<()>,
}

impl Registry {
    pub async fn new(handler: Arc<dyn Handler>, config: Config) -> Result<Registry> {
        let addr: SocketAddr = config
            .bind_addr
            .parse()
            .map_err(|_| Error::InvalidAddr(config.bind_addr.clone()))?;

        let local = Member {
            name: config.node_name.clone(),
            addr,
            tags: config.tags.clone(),
        };

        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let gossip = Gossip::start(local, &config.start_join_addrs, events_tx).await?;
        let event_loop = tokio::spawn(run_event_loop(handler, events_rx));

        Ok(Registry { gossip, event_loop })
    }

    /// Point-in-time snapshot of the cluster's members.
    pub fn members(&self) -> Vec<Member> {
        self.gossip.members()
    }

    /// Gracefully departs the gossip cluster.
    pub async fn leave(&self) {
        self.gossip.leave().await;
        self.event_loop.abort();
    }
}

async fn run_event_loop(handler: Arc<dyn Handler>, mut events: mpsc::Receiver<Event>) {
    while let Some(event) = events.recv().await {
        match event {
            Event::MemberJoin(member) => {
                let Some(rpc_addr) = member.tags.get(RPC_ADDR_TAG) else {
                    debug!(name = %member.name, "member without rpc_addr tag, skipping");
                    continue;
                };
                if let Err(e) = handler.join(&member.name, rpc_addr).await {
                    debug!(name = %member.name, error = %e, "join not applied");
                }
            }
            Event::MemberLeave(name) | Event::MemberFailed(name) => {
                if let Err(e) = handler.leave(&name).await {
                    debug!(name = %name, error = %e, "leave not applied");
                }
            }
        }
    }
}
