mod common;

use std::time::Duration;

use cachet::Error;
use common::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_read_after_write() {
    let cluster = start_cluster(1, false, true).await;
    let store = cluster.services[0].store();

    store.wait_for_leader(Duration::from_secs(3)).await.unwrap();
    store.set("entry1", b"garbage").await.unwrap();
    assert_eq!(store.get("entry1").await.unwrap(), b"garbage");

    shutdown(cluster).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn joining_self_is_rejected() {
    let cluster = start_cluster(1, false, true).await;
    let store = cluster.services[0].store();
    store.wait_for_leader(Duration::from_secs(3)).await.unwrap();

    let err = store.join("0", "localhost:1234").await.unwrap_err();
    assert!(matches!(err, Error::JoiningSelf));

    shutdown(cluster).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn join_is_idempotent_for_identical_members() {
    let cluster = start_cluster(2, false, true).await;
    let leader = cluster.services[0].store();
    leader.wait_for_leader(Duration::from_secs(3)).await.unwrap();
    await_members(leader, 2, Duration::from_secs(10)).await;

    let follower_addr = cluster.services[1].config.rpc_addr().unwrap();
    leader.join("1", &follower_addr).await.unwrap();
    assert_eq!(leader.get_servers().len(), 2);

    shutdown(cluster).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn writes_replicate_to_every_node() {
    let cluster = start_cluster(3, false, true).await;
    let leader = cluster.services[0].store();
    leader.wait_for_leader(Duration::from_secs(3)).await.unwrap();
    await_members(leader, 3, Duration::from_secs(10)).await;

    leader.set("hello1", b"value1").await.unwrap();
    leader.set("hello2", b"value2").await.unwrap();

    for service in &cluster.services {
        await_value(service.store(), "hello1", b"value1", Duration::from_secs(5)).await;
        await_value(service.store(), "hello2", b"value2", Duration::from_secs(5)).await;
    }

    let servers = leader.get_servers();
    assert_eq!(servers.len(), 3);
    assert_eq!(servers.iter().filter(|s| s.is_leader).count(), 1);

    shutdown(cluster).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leave_removes_a_follower() {
    let cluster = start_cluster(3, false, true).await;
    let leader = cluster.services[0].store();
    leader.wait_for_leader(Duration::from_secs(3)).await.unwrap();
    await_members(leader, 3, Duration::from_secs(10)).await;

    leader.leave("1").await.unwrap();
    await_members(leader, 2, Duration::from_secs(5)).await;

    leader.set("hello3", b"value3").await.unwrap();
    await_value(cluster.services[2].store(), "hello3", b"value3", Duration::from_secs(5)).await;

    // the removed node no longer receives writes
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(cluster.services[1].store().get("hello3").await.is_err());

    shutdown(cluster).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn strong_consistency_reads_go_through_the_log() {
    let dir = tempfile::TempDir::new().unwrap();
    let service = cachet::Service::new(cachet::Config {
        data_dir: dir.path().to_path_buf(),
        bind_addr: format!("127.0.0.1:{}", free_udp_port()),
        rpc_port: free_tcp_port(),
        node_name: "0".to_string(),
        bootstrap: true,
        start_join_addrs: Vec::new(),
        enable_http: false,
        enable_rpc: true,
        strong_consistency: true,
    })
    .await
    .unwrap();

    let store = service.store();
    store.wait_for_leader(Duration::from_secs(3)).await.unwrap();
    store.set("entry1", b"garbage").await.unwrap();
    assert_eq!(store.get("entry1").await.unwrap(), b"garbage");

    // a strongly consistent read of an absent key is an apply-time error
    assert!(matches!(store.get("absent").await, Err(Error::Cache(_))));

    let _ = service.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nonvoters_replicate_but_do_not_vote() {
    let cluster = start_cluster(1, false, true).await;
    let leader = cluster.services[0].store();
    leader.wait_for_leader(Duration::from_secs(3)).await.unwrap();

    // a standalone node that never gossips in; added as a learner by hand
    let dir = tempfile::TempDir::new().unwrap();
    let lonely = cachet::Service::new(cachet::Config {
        data_dir: dir.path().to_path_buf(),
        bind_addr: format!("127.0.0.1:{}", free_udp_port()),
        rpc_port: free_tcp_port(),
        node_name: "replica".to_string(),
        bootstrap: false,
        start_join_addrs: Vec::new(),
        enable_http: false,
        enable_rpc: true,
        strong_consistency: false,
    })
    .await
    .unwrap();

    let replica_addr = lonely.config.rpc_addr().unwrap();
    leader.join_nonvoter("replica", &replica_addr).await.unwrap();

    leader.set("hello4", b"value4").await.unwrap();
    await_value(lonely.store(), "hello4", b"value4", Duration::from_secs(5)).await;

    let servers = leader.get_servers();
    assert_eq!(servers.len(), 2);
    let replica = servers.iter().find(|s| s.id == "replica").unwrap();
    assert_eq!(replica.vote_status, "nonvoter");
    assert!(!replica.is_leader);

    let _ = lonely.close().await;
    shutdown(cluster).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wait_for_leader_times_out_without_a_leader() {
    // a non-bootstrapped single node never elects anyone
    let dir = tempfile::TempDir::new().unwrap();
    let service = cachet::Service::new(cachet::Config {
        data_dir: dir.path().to_path_buf(),
        bind_addr: format!("127.0.0.1:{}", free_udp_port()),
        rpc_port: free_tcp_port(),
        node_name: "lonely".to_string(),
        bootstrap: false,
        start_join_addrs: Vec::new(),
        enable_http: false,
        enable_rpc: true,
        strong_consistency: false,
    })
    .await
    .unwrap();

    let err = service
        .store()
        .wait_for_leader(Duration::from_millis(500))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));

    let _ = service.close().await;
}
