//! Leader/follower protocol tests over real loopback links.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::time::timeout;

use strata_quorum::quorum::{
    connect_peer, run_follower, run_leader, PeerListener, PeerMsg, Proposal, ProtocolActions,
    ProtocolConfig, QuorumError, RequestHandle, Txnid, TxnState,
};

const WAIT: Duration = Duration::from_secs(5);

fn cfg() -> ProtocolConfig {
    ProtocolConfig {
        proposal_timeout: Duration::from_secs(2),
        ..ProtocolConfig::default()
    }
}

struct MockActions {
    ensemble: u64,
    txn: TxnState,
    accepted_epoch: AtomicU32,
    current_epoch: AtomicU32,
    logged: Mutex<Vec<Proposal>>,
    committed: Mutex<Vec<Proposal>>,
    pendings: Mutex<HashMap<u64, RequestHandle>>,
}

impl MockActions {
    fn new(ensemble: u64, epoch: u32) -> Arc<Self> {
        Arc::new(Self {
            ensemble,
            txn: TxnState::new(Txnid::new(epoch, 0)),
            accepted_epoch: AtomicU32::new(epoch),
            current_epoch: AtomicU32::new(epoch),
            logged: Mutex::new(Vec::new()),
            committed: Mutex::new(Vec::new()),
            pendings: Mutex::new(HashMap::new()),
        })
    }

    fn committed(&self) -> Vec<Proposal> {
        self.committed.lock().unwrap().clone()
    }
}

impl ProtocolActions for MockActions {
    fn follower_id(&self) -> String {
        "local-node".to_string()
    }

    fn ensemble_size(&self) -> u64 {
        self.ensemble
    }

    fn next_txnid(&self) -> Txnid {
        self.txn.next()
    }

    fn current_epoch(&self) -> u32 {
        self.current_epoch.load(Ordering::SeqCst)
    }

    fn accepted_epoch(&self) -> u32 {
        self.accepted_epoch.load(Ordering::SeqCst)
    }

    fn notify_new_accepted_epoch(&self, epoch: u32) -> anyhow::Result<()> {
        self.accepted_epoch.fetch_max(epoch, Ordering::SeqCst);
        Ok(())
    }

    fn notify_new_current_epoch(&self, epoch: u32) -> anyhow::Result<()> {
        if epoch > self.current_epoch.load(Ordering::SeqCst) {
            self.current_epoch.store(epoch, Ordering::SeqCst);
            self.txn.set_epoch(epoch);
        }
        Ok(())
    }

    fn add_pending(&self, handle: RequestHandle) {
        self.pendings.lock().unwrap().insert(handle.req_id, handle);
    }

    fn log_proposal(&self, proposal: &Proposal) -> anyhow::Result<()> {
        self.logged.lock().unwrap().push(proposal.clone());
        Ok(())
    }

    fn commit(&self, proposal: &Proposal) -> anyhow::Result<()> {
        self.committed.lock().unwrap().push(proposal.clone());
        let handle = self.pendings.lock().unwrap().remove(&proposal.req_id);
        if let Some(handle) = handle {
            let _ = handle.done.send(Ok(()));
        }
        Ok(())
    }
}

fn request(req_id: u64) -> (RequestHandle, oneshot::Receiver<anyhow::Result<()>>) {
    let (done, rx) = oneshot::channel();
    (
        RequestHandle {
            req_id,
            op: 1,
            key: "b/idx1".to_string(),
            content: b"defn".to_vec(),
            done,
        },
        rx,
    )
}

#[tokio::test]
async fn single_node_ensemble_commits_without_followers() {
    let listener = Arc::new(PeerListener::bind("127.0.0.1:0", 1 << 20).await.unwrap());
    let actions = MockActions::new(1, 0);
    let (in_tx, in_rx) = mpsc::channel(8);
    let incoming = Arc::new(AsyncMutex::new(in_rx));
    let (kill_tx, kill_rx) = watch::channel(false);
    let leader = tokio::spawn(run_leader(
        listener,
        actions.clone() as Arc<dyn ProtocolActions>,
        incoming,
        cfg(),
        kill_rx,
    ));

    let (handle, rx) = request(7);
    in_tx.send(handle).await.unwrap();
    timeout(WAIT, rx).await.unwrap().unwrap().unwrap();

    let committed = actions.committed();
    assert_eq!(committed.len(), 1);
    // The fresh election advanced the epoch, and the txnid embeds it.
    assert_eq!(committed[0].txnid, Txnid::new(1, 1));
    assert_eq!(committed[0].fid, "local-node");
    assert_eq!(actions.current_epoch(), 1);

    kill_tx.send(true).unwrap();
    leader.await.unwrap().unwrap();
}

#[tokio::test]
async fn follower_accept_completes_quorum_and_commit_is_broadcast() {
    let listener = Arc::new(PeerListener::bind("127.0.0.1:0", 1 << 20).await.unwrap());
    let addr = listener.local_addr().unwrap().to_string();
    let actions = MockActions::new(2, 0);
    let (in_tx, in_rx) = mpsc::channel(8);
    let incoming = Arc::new(AsyncMutex::new(in_rx));
    let (kill_tx, kill_rx) = watch::channel(false);
    let leader = tokio::spawn(run_leader(
        listener,
        actions.clone() as Arc<dyn ProtocolActions>,
        incoming,
        cfg(),
        kill_rx,
    ));

    // Fake follower joins and answers the handshake.
    let mut link = connect_peer(&addr, 1 << 20).await.unwrap();
    link.send(PeerMsg::FollowerInfo {
        fid: "follower-1".to_string(),
        accepted_epoch: 0,
    })
    .await
    .unwrap();
    match timeout(WAIT, link.next()).await.unwrap().unwrap().unwrap() {
        PeerMsg::LeaderInfo { current_epoch } => assert_eq!(current_epoch, 1),
        other => panic!("expected leader handshake, got {other:?}"),
    }

    let (handle, rx) = request(42);
    in_tx.send(handle).await.unwrap();

    // With an ensemble of two, the follower's accept completes the quorum.
    let proposal = match timeout(WAIT, link.next()).await.unwrap().unwrap().unwrap() {
        PeerMsg::Proposal(proposal) => proposal,
        other => panic!("expected proposal, got {other:?}"),
    };
    link.send(PeerMsg::Accept {
        txnid: proposal.txnid,
        fid: "follower-1".to_string(),
    })
    .await
    .unwrap();

    match timeout(WAIT, link.next()).await.unwrap().unwrap().unwrap() {
        PeerMsg::Commit { txnid } => assert_eq!(txnid, proposal.txnid),
        other => panic!("expected commit, got {other:?}"),
    }
    timeout(WAIT, rx).await.unwrap().unwrap().unwrap();
    assert_eq!(actions.committed().len(), 1);

    kill_tx.send(true).unwrap();
    leader.await.unwrap().unwrap();
}

#[tokio::test]
async fn leader_abandons_on_first_higher_epoch_message() {
    let listener = Arc::new(PeerListener::bind("127.0.0.1:0", 1 << 20).await.unwrap());
    let addr = listener.local_addr().unwrap().to_string();
    let actions = MockActions::new(2, 4);
    let (_in_tx, in_rx) = mpsc::channel::<RequestHandle>(8);
    let incoming = Arc::new(AsyncMutex::new(in_rx));
    let (_kill_tx, kill_rx) = watch::channel(false);
    let leader = tokio::spawn(run_leader(
        listener,
        actions.clone() as Arc<dyn ProtocolActions>,
        incoming,
        cfg(),
        kill_rx,
    ));

    // A follower from a later regime (epoch 9 > leader's 5) unseats the
    // leader immediately.
    let mut link = connect_peer(&addr, 1 << 20).await.unwrap();
    link.send(PeerMsg::FollowerInfo {
        fid: "usurper".to_string(),
        accepted_epoch: 9,
    })
    .await
    .unwrap();

    let result = timeout(WAIT, leader).await.unwrap().unwrap();
    assert!(matches!(result, Err(QuorumError::StaleEpoch)));
}

#[tokio::test]
async fn follower_forwards_requests_and_applies_commits() {
    let listener = PeerListener::bind("127.0.0.1:0", 1 << 20).await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    // Fake leader: handshake, then one proposal/commit round for the
    // forwarded request.
    let fake_leader = tokio::spawn(async move {
        let (mut link, _) = listener.accept().await.unwrap();
        let fid = match timeout(WAIT, link.next()).await.unwrap().unwrap().unwrap() {
            PeerMsg::FollowerInfo { fid, .. } => fid,
            other => panic!("expected follower handshake, got {other:?}"),
        };
        link.send(PeerMsg::LeaderInfo { current_epoch: 3 })
            .await
            .unwrap();
        let (req_id, op, key, content, origin) =
            match timeout(WAIT, link.next()).await.unwrap().unwrap().unwrap() {
                PeerMsg::Request {
                    req_id,
                    op,
                    key,
                    content,
                    fid,
                } => (req_id, op, key, content, fid),
                other => panic!("expected forwarded request, got {other:?}"),
            };
        assert_eq!(origin, fid);
        let proposal = Proposal {
            txnid: Txnid::new(3, 1),
            op,
            key,
            content,
            fid: origin,
            req_id,
        };
        link.send(PeerMsg::Proposal(proposal.clone())).await.unwrap();
        match timeout(WAIT, link.next()).await.unwrap().unwrap().unwrap() {
            PeerMsg::Accept { txnid, .. } => assert_eq!(txnid, proposal.txnid),
            other => panic!("expected accept, got {other:?}"),
        }
        link.send(PeerMsg::Commit {
            txnid: proposal.txnid,
        })
        .await
        .unwrap();
    });

    let actions = MockActions::new(2, 0);
    let (in_tx, in_rx) = mpsc::channel(8);
    let incoming = Arc::new(AsyncMutex::new(in_rx));
    let (kill_tx, kill_rx) = watch::channel(false);
    let follower = tokio::spawn({
        let actions = actions.clone() as Arc<dyn ProtocolActions>;
        async move { run_follower(&addr, actions, incoming, cfg(), kill_rx).await }
    });

    let (handle, rx) = request(99);
    in_tx.send(handle).await.unwrap();
    timeout(WAIT, rx).await.unwrap().unwrap().unwrap();

    assert_eq!(actions.current_epoch(), 3);
    let committed = actions.committed();
    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].req_id, 99);

    fake_leader.await.unwrap();
    kill_tx.send(true).unwrap();
    follower.await.unwrap().unwrap();
}
