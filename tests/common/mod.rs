#![allow(dead_code)]

use std::time::Duration;

use cachet::store::Store;
use cachet::{Config, Service};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub struct TestCluster {
    pub services: Vec<Service>,
    dirs: Vec<TempDir>,
}

pub fn free_tcp_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn free_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

/// Starts an `n`-node cluster. Node 0 bootstraps; the others gossip to it
/// and are joined into the raft configuration by the leader.
pub async fn start_cluster(n: usize, enable_http: bool, enable_rpc: bool) -> TestCluster {
    let mut services = Vec::with_capacity(n);
    let mut dirs = Vec::with_capacity(n);
    let mut seed_addr = String::new();

    for i in 0..n {
        let bind_addr = format!("127.0.0.1:{}", free_udp_port());
        let rpc_port = free_tcp_port();
        let dir = TempDir::new().unwrap();

        let start_join_addrs = if i == 0 {
            Vec::new()
        } else {
            vec![seed_addr.clone()]
        };

        let service = Service::new(Config {
            data_dir: dir.path().to_path_buf(),
            bind_addr: bind_addr.clone(),
            rpc_port,
            node_name: i.to_string(),
            bootstrap: i == 0,
            start_join_addrs,
            enable_http,
            enable_rpc,
            strong_consistency: false,
        })
        .await
        .unwrap();

        if i == 0 {
            seed_addr = bind_addr;
        }
        services.push(service);
        dirs.push(dir);
    }

    TestCluster { services, dirs }
}

pub async fn shutdown(cluster: TestCluster) {
    for service in &cluster.services {
        let _ = service.close().await;
    }
}

/// Polls until the store's configuration has `expect` servers.
pub async fn await_members(store: &Store, expect: usize, wait: Duration) {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if store.get_servers().len() == expect {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "membership did not reach {expect} servers: {:?}",
                store.get_servers()
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Polls until `key` reads back as `expect` on this store.
pub async fn await_value(store: &Store, key: &str, expect: &[u8], wait: Duration) {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if let Ok(value) = store.get(key).await {
            if value == expect {
                return;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("{key} did not converge to the expected value");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Minimal HTTP/1.1 request over a raw TCP stream, so requests take the
/// same sniffing path through the mux that real clients do.
pub async fn http_request(addr: &str, method: &str, path: &str, body: &[u8]) -> (u16, Vec<u8>) {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    stream.write_all(body).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();

    let header_end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no header terminator in response")
        + 4;
    let head = std::str::from_utf8(&response[..header_end]).unwrap();
    let status: u16 = head
        .split_whitespace()
        .nth(1)
        .expect("no status code")
        .parse()
        .unwrap();

    (status, response[header_end..].to_vec())
}
