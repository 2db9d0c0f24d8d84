mod common;

use std::time::Duration;

use cachet::proto::cache_client::CacheClient;
use cachet::proto::{GetRequest, SetRequest};
use cachet::{Client, Config, Error, Service};
use common::*;

#[tokio::test]
async fn refuses_construction_without_client_interfaces() {
    let dir = tempfile::TempDir::new().unwrap();
    let err = Service::new(Config {
        data_dir: dir.path().to_path_buf(),
        bind_addr: "localhost:8080".to_string(),
        rpc_port: 9200,
        node_name: "node".to_string(),
        bootstrap: true,
        start_join_addrs: Vec::new(),
        enable_http: false,
        enable_rpc: false,
        strong_consistency: false,
    })
    .await
    .unwrap_err();

    assert!(matches!(err, Error::NoCommunication));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn grpc_end_to_end() {
    let cluster = start_cluster(3, false, true).await;
    let leader = cluster.services[0].store();
    leader.wait_for_leader(Duration::from_secs(3)).await.unwrap();
    await_members(leader, 3, Duration::from_secs(10)).await;

    let leader_addr = cluster.services[0].config.rpc_addr().unwrap();
    let mut client = CacheClient::connect(format!("http://{leader_addr}"))
        .await
        .unwrap();

    client
        .set(SetRequest {
            key: "key1".to_string(),
            value: b"value1".to_vec(),
        })
        .await
        .unwrap();

    let response = client
        .get(GetRequest {
            key: "key1".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(response.into_inner().value, b"value1");

    // the follower serves the replicated value over its own RPC port
    let follower_addr = cluster.services[1].config.rpc_addr().unwrap();
    let mut follower = CacheClient::connect(format!("http://{follower_addr}"))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let response = follower
            .get(GetRequest {
                key: "key1".to_string(),
            })
            .await;
        if let Ok(response) = response {
            assert_eq!(response.into_inner().value, b"value1");
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("follower never served the replicated value");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    shutdown(cluster).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn get_servers_reports_the_whole_cluster() {
    let cluster = start_cluster(3, false, true).await;
    let leader = cluster.services[0].store();
    leader.wait_for_leader(Duration::from_secs(3)).await.unwrap();
    await_members(leader, 3, Duration::from_secs(10)).await;

    // any node answers GetServers, not just the leader
    let follower_addr = cluster.services[2].config.rpc_addr().unwrap();
    let mut client = CacheClient::connect(format!("http://{follower_addr}"))
        .await
        .unwrap();

    let servers = client
        .get_servers(cachet::proto::Empty {})
        .await
        .unwrap()
        .into_inner()
        .servers;

    assert_eq!(servers.len(), 3);
    assert_eq!(servers.iter().filter(|s| s.is_leader).count(), 1);
    assert!(servers.iter().all(|s| s.vote_status == "voter"));

    shutdown(cluster).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn http_end_to_end() {
    let cluster = start_cluster(3, true, true).await;
    let leader = cluster.services[0].store();
    leader.wait_for_leader(Duration::from_secs(3)).await.unwrap();
    await_members(leader, 3, Duration::from_secs(10)).await;

    let leader_addr = cluster.services[0].config.rpc_addr().unwrap();
    let (status, _) = http_request(&leader_addr, "POST", "/testkey", b"testval").await;
    assert_eq!(status, 200);

    let (status, body) = http_request(&leader_addr, "GET", "/testkey", b"").await;
    assert_eq!(status, 200);
    assert_eq!(body, b"testval");

    tokio::time::sleep(Duration::from_secs(1)).await;

    let follower_addr = cluster.services[1].config.rpc_addr().unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (status, body) = http_request(&follower_addr, "GET", "/testkey", b"").await;
        if status == 200 {
            assert_eq!(body, b"testval");
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("follower never served the replicated value over http");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    shutdown(cluster).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_aware_client_end_to_end() {
    let cluster = start_cluster(3, false, true).await;
    let leader = cluster.services[0].store();
    leader.wait_for_leader(Duration::from_secs(3)).await.unwrap();
    await_members(leader, 3, Duration::from_secs(10)).await;

    let leader_addr = cluster.services[0].config.rpc_addr().unwrap();
    let client = Client::connect(&leader_addr).await.unwrap();

    client.set("ckey", b"cval".to_vec()).await.unwrap();

    // reads round-robin the followers, which catch up eventually
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut hits = 0;
    while hits < 4 {
        match client.get("ckey").await {
            Ok(value) if value == b"cval" => hits += 1,
            _ => {
                if tokio::time::Instant::now() >= deadline {
                    panic!("followers never served the replicated value");
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    let servers = client.get_servers().await.unwrap();
    assert_eq!(servers.len(), 3);

    shutdown(cluster).await;
}
