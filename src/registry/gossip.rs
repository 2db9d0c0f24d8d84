//! SWIM-flavoured UDP gossip for member discovery.
//!
//! Deliberately small: every heartbeat piggybacks the sender's full live
//! view, which converges quickly at the cluster sizes a cache runs at.
//! Failure detection is heartbeat age; a member that went quiet past the
//! timeout is reported failed and dropped. A node that was wrongly
//! declared dead reappears through a later heartbeat, which re-emits a
//! join event; consumers must treat joins as idempotent.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;

const GOSSIP_INTERVAL: Duration = Duration::from_millis(500);
const FAILURE_TIMEOUT: Duration = Duration::from_millis(2_500);
const FANOUT: usize = 3;
const MAX_DATAGRAM: usize = 64 * 1024;

/// Advertised identity of one cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub addr: SocketAddr,
    pub tags: HashMap<String, String>,
}

/// Membership change surfaced to the registry event loop.
#[derive(Debug, Clone)]
pub enum Event {
    MemberJoin(Member),
    MemberLeave(String),
    MemberFailed(String),
}

#[derive(Debug, Serialize, Deserialize)]
enum Message {
    /// First contact from a node that wants in.
    Join(Member),
    /// Periodic state exchange carrying the sender's full live view.
    Heartbeat { from: Member, members: Vec<Member> },
    /// Graceful departure.
    Leave { name: String },
}

struct Peer {
    member: Member,
    last_seen: Instant,
}

struct Shared {
    local: Member,
    socket: UdpSocket,
    peers: Mutex<HashMap<String, Peer>>,
    events: mpsc::Sender<Event>,
}

/// A running gossip endpoint bound to the registry's UDP address.
pub struct Gossip {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl Gossip {
    /// Binds the local member's address and contacts `seeds`.
    pub async fn start(
        local: Member,
        seeds: &[String],
        events: mpsc::Sender<Event>,
    ) -> Result<Gossip> {
        let socket = UdpSocket::bind(local.addr).await?;
        let shared = Arc::new(Shared {
            local: local.clone(),
            socket,
            peers: Mutex::new(HashMap::new()),
            events,
        });

        let join = bincode::serialize(&Message::Join(local))?;
        for seed in seeds {
            if let Err(e) = shared.socket.send_to(&join, seed.as_str()).await {
                warn!(seed, error = %e, "failed to contact seed");
            }
        }

        let tasks = vec![
            tokio::spawn(recv_loop(shared.clone())),
            tokio::spawn(tick_loop(shared.clone())),
        ];

        Ok(Gossip { shared, tasks })
    }

    /// Point-in-time view of the cluster, local member included.
    pub fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self
            .shared
            .peers
            .lock()
            .values()
            .map(|p| p.member.clone())
            .collect();
        members.push(self.shared.local.clone());
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    /// Announces departure to every known peer and stops gossiping.
    pub async fn leave(&self) {
        let leave = Message::Leave {
            name: self.shared.local.name.clone(),
        };
        if let Ok(data) = bincode::serialize(&leave) {
            let targets: Vec<SocketAddr> = self
                .shared
                .peers
                .lock()
                .values()
                .map(|p| p.member.addr)
                .collect();
            for addr in targets {
                let _ = self.shared.socket.send_to(&data, addr).await;
            }
        }

        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn recv_loop(shared: Arc<Shared>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = match shared.socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "gossip receive failed");
                continue;
            }
        };

        let message: Message = match bincode::deserialize(&buf[..len]) {
            Ok(m) => m,
            Err(e) => {
                debug!(from = %from, error = %e, "discarding undecodable datagram");
                continue;
            }
        };

        match message {
            Message::Join(member) => {
                let addr = member.addr;
                admit(&shared, member).await;
                // answer directly so the joiner learns the full view at once
                if let Ok(data) = bincode::serialize(&heartbeat(&shared)) {
                    let _ = shared.socket.send_to(&data, addr).await;
                }
            }
            Message::Heartbeat { from: sender, members } => {
                admit(&shared, sender).await;
                for member in members {
                    admit(&shared, member).await;
                }
            }
            Message::Leave { name } => {
                let removed = shared.peers.lock().remove(&name).is_some();
                if removed {
                    debug!(name, "member left");
                    let _ = shared.events.send(Event::MemberLeave(name)).await;
                }
            }
        }
    }
}

/// Records a sighting of `member`, emitting a join event the first time.
async fn admit(shared: &Shared, member: Member) {
    if member.name == shared.local.name {
        return;
    }

    let is_new = {
        let mut peers = shared.peers.lock();
        match peers.get_mut(&member.name) {
            Some(peer) => {
                peer.last_seen = Instant::now();
                peer.member = member.clone();
                false
            }
            None => {
                peers.insert(
                    member.name.clone(),
                    Peer {
                        member: member.clone(),
                        last_seen: Instant::now(),
                    },
                );
                true
            }
        }
    };

    if is_new {
        debug!(name = %member.name, "member joined");
        let _ = shared.events.send(Event::MemberJoin(member)).await;
    }
}

fn heartbeat(shared: &Shared) -> Message {
    let members = shared
        .peers
        .lock()
        .values()
        .map(|p| p.member.clone())
        .collect();
    Message::Heartbeat {
        from: shared.local.clone(),
        members,
    }
}

async fn tick_loop(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(GOSSIP_INTERVAL);
    loop {
        ticker.tick().await;

        let expired: Vec<String> = {
            let mut peers = shared.peers.lock();
            let dead: Vec<String> = peers
                .iter()
                .filter(|(_, peer)| peer.last_seen.elapsed() > FAILURE_TIMEOUT)
                .map(|(name, _)| name.clone())
                .collect();
            for name in &dead {
                peers.remove(name);
            }
            dead
        };
        for name in expired {
            warn!(name, "member failed");
            let _ = shared.events.send(Event::MemberFailed(name)).await;
        }

        let targets: Vec<SocketAddr> = {
            let peers = shared.peers.lock();
            let mut addrs: Vec<SocketAddr> = peers.values().map(|p| p.member.addr).collect();
            addrs.shuffle(&mut rand::thread_rng());
            addrs.truncate(FANOUT);
            addrs
        };
        if targets.is_empty() {
            continue;
        }

        if let Ok(data) = bincode::serialize(&heartbeat(&shared)) {
            for addr in targets {
                let _ = shared.socket.send_to(&data, addr).await;
            }
        }
    }
}
