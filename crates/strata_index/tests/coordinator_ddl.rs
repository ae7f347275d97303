//! Coordinator DDL scenarios against a live single-node ensemble.
//!
//! With no peers the local node elects itself and leads immediately, so the
//! full request lifecycle (incoming -> pending -> proposed -> committed ->
//! signalled) runs over the real protocol loops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{sleep, timeout};

use strata_index::coordinator::{
    Coordinator, CoordinatorConfig, StreamTimestamp, TimestampSink, OP_ADD_INDEX_DEFN,
    OP_DEL_INDEX_DEFN, OP_NOTIFY_TIMESTAMP,
};
use strata_index::error::RepoError;
use strata_index::repo::MetadataRepo;
use strata_index::topology::{index_defn_key, topology_key, IndexDefn, IndexState};

const WAIT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct RecordingSink {
    timestamps: Mutex<Vec<StreamTimestamp>>,
}

impl TimestampSink for RecordingSink {
    fn notify_new_timestamp(&self, ts: StreamTimestamp) {
        self.timestamps.lock().unwrap().push(ts);
    }
}

fn single_node_cfg(index_host: &str) -> CoordinatorConfig {
    CoordinatorConfig {
        host_elect: "127.0.0.1:0".to_string(),
        host_peer: "127.0.0.1:0".to_string(),
        peers_elect: Vec::new(),
        peer_tcp: HashMap::new(),
        index_host: index_host.to_string(),
        peer_index_hosts: Vec::new(),
        protocol: Default::default(),
    }
}

fn defn(bucket: &str, name: &str, id: u64) -> IndexDefn {
    IndexDefn {
        defn_id: id,
        name: name.to_string(),
        bucket: bucket.to_string(),
        using: "forestdb".to_string(),
        expr_type: "n1ql".to_string(),
        secondary_exprs: vec!["abv".to_string()],
        ..IndexDefn::default()
    }
}

async fn create(coordinator: &Coordinator, id: u64, defn: &IndexDefn) -> anyhow::Result<()> {
    let key = index_defn_key(&defn.bucket, &defn.name);
    let content = serde_json::to_vec(defn).unwrap();
    timeout(
        WAIT,
        coordinator.new_request(id, OP_ADD_INDEX_DEFN, &key, content),
    )
    .await
    .expect("request timed out")
}

#[tokio::test]
async fn create_then_delete_walks_the_full_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(MetadataRepo::open(dir.path()).unwrap());
    let sink = Arc::new(RecordingSink::default());
    let coordinator =
        Coordinator::new(repo.clone(), sink.clone(), single_node_cfg("node-a")).unwrap();
    let task = tokio::spawn(coordinator.clone().run());

    // Create lands in the repository and the topology.
    let idx = defn("b", "idx1", 1);
    create(&coordinator, 42, &idx).await.unwrap();
    assert_eq!(repo.get_index("b", "idx1").unwrap(), idx);
    let topology = repo.get_topology("b").unwrap();
    let defn_ref = topology.find_definition("idx1").unwrap();
    assert_eq!(defn_ref.instances[0].state, IndexState::Created);
    assert_eq!(
        defn_ref.instances[0].partitions[0].slices[0].host,
        "node-a"
    );
    assert!(repo
        .get_global_topology()
        .unwrap()
        .contains(&topology_key("b")));

    // Delete drops the definition and marks the instance deleted, but the
    // global topology keeps the bucket key.
    timeout(
        WAIT,
        coordinator.new_request(43, OP_DEL_INDEX_DEFN, &index_defn_key("b", "idx1"), Vec::new()),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(matches!(
        repo.get_index("b", "idx1").unwrap_err(),
        RepoError::NotFound
    ));
    let topology = repo.get_topology("b").unwrap();
    assert_eq!(
        topology.find_definition("idx1").unwrap().instances[0].state,
        IndexState::Deleted
    );
    assert!(repo
        .get_global_topology()
        .unwrap()
        .contains(&topology_key("b")));

    // Committed timestamps reach the sink.
    let ts = StreamTimestamp {
        bucket: "b".to_string(),
        vbnos: vec![0, 1],
        seqnos: vec![10, 20],
        vbuuids: vec![7, 8],
    };
    timeout(
        WAIT,
        coordinator.new_request(44, OP_NOTIFY_TIMESTAMP, "b", serde_json::to_vec(&ts).unwrap()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(sink.timestamps.lock().unwrap().as_slice(), &[ts]);

    coordinator.terminate();
    task.await.unwrap();
}

#[tokio::test]
async fn duplicate_create_surfaces_already_exists() {
    let dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(MetadataRepo::open(dir.path()).unwrap());
    let coordinator = Coordinator::new(
        repo,
        Arc::new(RecordingSink::default()),
        single_node_cfg("node-a"),
    )
    .unwrap();
    let task = tokio::spawn(coordinator.clone().run());

    let idx = defn("b", "idx2", 2);
    create(&coordinator, 1, &idx).await.unwrap();
    let err = create(&coordinator, 2, &idx).await.unwrap_err();
    assert!(err.to_string().contains("already exists"));

    coordinator.terminate();
    task.await.unwrap();
}

#[tokio::test]
async fn epochs_are_monotone_across_coordinator_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(MetadataRepo::open(dir.path()).unwrap());

    let first = Coordinator::new(
        repo.clone(),
        Arc::new(RecordingSink::default()),
        single_node_cfg("node-a"),
    )
    .unwrap();
    let task = tokio::spawn(first.clone().run());
    create(&first, 1, &defn("b", "idx1", 1)).await.unwrap();
    let first_epoch = repo.get_current_epoch().unwrap();
    assert!(first_epoch >= 1);
    first.terminate();
    task.await.unwrap();

    // A fresh coordinator over the same repository advances the epoch
    // strictly; txnids issued by the new regime embed the larger epoch.
    let second = Coordinator::new(
        repo.clone(),
        Arc::new(RecordingSink::default()),
        single_node_cfg("node-a"),
    )
    .unwrap();
    let task = tokio::spawn(second.clone().run());
    create(&second, 2, &defn("b", "idx9", 9)).await.unwrap();
    let second_epoch = repo.get_current_epoch().unwrap();
    assert!(second_epoch > first_epoch);
    assert!(repo.get_accepted_epoch().unwrap() >= second_epoch);
    second.terminate();
    task.await.unwrap();
}

fn reserve_udp_addr() -> String {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().to_string()
}

fn reserve_tcp_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

#[tokio::test]
async fn three_node_ensemble_commits_a_follower_request() {
    let elect: Vec<String> = (0..3).map(|_| reserve_udp_addr()).collect();
    let peer: Vec<String> = (0..3).map(|_| reserve_tcp_addr()).collect();

    let mut nodes = Vec::new();
    let mut tasks = Vec::new();
    let mut dirs = Vec::new();
    let mut repos = Vec::new();
    for i in 0..3 {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(MetadataRepo::open(dir.path()).unwrap());
        let cfg = CoordinatorConfig {
            host_elect: elect[i].clone(),
            host_peer: peer[i].clone(),
            peers_elect: (0..3).filter(|j| *j != i).map(|j| elect[j].clone()).collect(),
            peer_tcp: (0..3)
                .filter(|j| *j != i)
                .map(|j| (elect[j].clone(), peer[j].clone()))
                .collect(),
            index_host: format!("node-{i}"),
            peer_index_hosts: (0..3)
                .filter(|j| *j != i)
                .map(|j| format!("node-{j}"))
                .collect(),
            protocol: Default::default(),
        };
        let coordinator =
            Coordinator::new(repo.clone(), Arc::new(RecordingSink::default()), cfg).unwrap();
        tasks.push(tokio::spawn(coordinator.clone().run()));
        nodes.push(coordinator);
        repos.push(repo);
        dirs.push(dir);
    }

    // Wait for a settled regime: one leader, two followers.
    let deadline = tokio::time::Instant::now() + WAIT;
    let follower = loop {
        use strata_quorum::quorum::PeerStatus;
        let statuses: Vec<PeerStatus> = nodes.iter().map(|node| node.status()).collect();
        let leaders = statuses
            .iter()
            .filter(|status| **status == PeerStatus::Leading)
            .count();
        let followers = statuses
            .iter()
            .filter(|status| **status == PeerStatus::Following)
            .count();
        if leaders == 1 && followers == 2 {
            let idx = statuses
                .iter()
                .position(|status| *status == PeerStatus::Following)
                .unwrap();
            break idx;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "ensemble never settled: {statuses:?}"
        );
        sleep(Duration::from_millis(100)).await;
    };

    // A follower-originated request commits across the ensemble.
    let idx = defn("b", "idx1", 1);
    create(&nodes[follower], 77, &idx).await.unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let applied = repos
            .iter()
            .filter(|repo| repo.get_index("b", "idx1").is_ok())
            .count();
        if applied == 3 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "commit reached only {applied} of 3 nodes"
        );
        sleep(Duration::from_millis(100)).await;
    }

    for node in &nodes {
        node.terminate();
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn termination_signals_parked_requests() {
    let dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(MetadataRepo::open(dir.path()).unwrap());
    // One unreachable peer: a two-node ensemble can never reach majority,
    // so the election spins until termination.
    let mut cfg = single_node_cfg("node-a");
    cfg.peers_elect = vec!["127.0.0.1:9".to_string()];
    let coordinator = Coordinator::new(repo, Arc::new(RecordingSink::default()), cfg).unwrap();
    let task = tokio::spawn(coordinator.clone().run());

    let waiter = tokio::spawn({
        let coordinator = coordinator.clone();
        let idx = defn("b", "idx1", 1);
        async move {
            let key = index_defn_key(&idx.bucket, &idx.name);
            let content = serde_json::to_vec(&idx).unwrap();
            coordinator
                .new_request(1, OP_ADD_INDEX_DEFN, &key, content)
                .await
        }
    });

    sleep(Duration::from_millis(400)).await;
    coordinator.terminate();
    let outcome = timeout(WAIT, waiter).await.unwrap().unwrap();
    let err = outcome.unwrap_err();
    assert!(err.to_string().contains("terminated"));
    task.await.unwrap();
}
