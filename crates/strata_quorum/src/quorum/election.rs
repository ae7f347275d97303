//! UDP ballot exchange for leader election.
//!
//! Every node periodically broadcasts its current vote `(epoch, last txnid,
//! candidate address)` and adopts any strictly better vote it hears. A
//! candidate wins once a strict majority of the ensemble votes for it. The
//! responder task keeps answering ballots after the election settles so late
//! peers can still discover the winner.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use super::types::{QuorumError, Txnid};

const BALLOT_ROUND: Duration = Duration::from_millis(150);
const MAX_BALLOT_BYTES: usize = 4096;

/// One node's vote.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct VoteRecord {
    pub candidate: String,
    pub epoch: u32,
    pub last_txnid: Txnid,
}

impl VoteRecord {
    fn rank(&self) -> (u32, Txnid, &str) {
        (self.epoch, self.last_txnid, self.candidate.as_str())
    }

    fn beats(&self, other: &VoteRecord) -> bool {
        self.rank() > other.rank()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BallotMsg {
    from: String,
    vote: VoteRecord,
    reply: bool,
}

struct VoteState {
    vote: VoteRecord,
    /// Latest vote heard from each voter, the local node included.
    ballots: HashMap<String, VoteRecord>,
}

/// Election endpoint bound to the node's UDP address.
pub struct ElectionSite {
    host: String,
    peers: Vec<String>,
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<VoteState>>,
    notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
    responder: JoinHandle<()>,
}

impl ElectionSite {
    /// Bind `host` and start the responder. `epoch` and `last_txnid` weight
    /// the initial self-vote.
    pub async fn new(
        host: &str,
        peers: &[String],
        epoch: u32,
        last_txnid: Txnid,
    ) -> Result<Self, QuorumError> {
        let socket = Arc::new(UdpSocket::bind(host).await?);
        let vote = VoteRecord {
            candidate: host.to_string(),
            epoch,
            last_txnid,
        };
        let mut ballots = HashMap::new();
        ballots.insert(host.to_string(), vote.clone());
        let state = Arc::new(Mutex::new(VoteState {
            vote: vote.clone(),
            ballots,
        }));
        let notify = Arc::new(Notify::new());
        let closed = Arc::new(AtomicBool::new(false));

        let responder = tokio::spawn(respond(
            socket.clone(),
            host.to_string(),
            state.clone(),
            notify.clone(),
        ));

        Ok(Self {
            host: host.to_string(),
            peers: peers.to_vec(),
            socket,
            state,
            notify,
            closed,
            responder,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Record the epoch settled by the latest election so ballots from late
    /// voters are answered with it.
    pub fn update_winning_epoch(&self, epoch: u32) {
        let mut state = self.state.lock().unwrap();
        if epoch > state.vote.epoch {
            state.vote.epoch = epoch;
            let vote = state.vote.clone();
            state.ballots.insert(self.host.clone(), vote);
        }
    }

    /// Run the election to completion. Blocks until a single leader address
    /// holds a strict majority; `close` or `kill` unblocks with
    /// `ElectionFail`.
    pub async fn elect(&self, kill: &mut watch::Receiver<bool>) -> Result<String, QuorumError> {
        let ensemble = self.peers.len() as u64 + 1;
        if self.peers.is_empty() {
            return Ok(self.host.clone());
        }

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(QuorumError::ElectionFail);
            }
            self.broadcast().await;
            if let Some(winner) = self.tally(ensemble) {
                return Ok(winner);
            }
            let jitter = rand::thread_rng().gen_range(0..50);
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(BALLOT_ROUND + Duration::from_millis(jitter)) => {}
                _ = kill.changed() => return Err(QuorumError::ElectionFail),
            }
            if let Some(winner) = self.tally(ensemble) {
                return Ok(winner);
            }
        }
    }

    /// Stop answering ballots and unblock any election in progress.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.responder.abort();
        self.notify.notify_waiters();
    }

    async fn broadcast(&self) {
        let vote = self.state.lock().unwrap().vote.clone();
        let msg = BallotMsg {
            from: self.host.clone(),
            vote,
            reply: false,
        };
        let Ok(data) = serde_json::to_vec(&msg) else {
            return;
        };
        for peer in &self.peers {
            if let Err(err) = self.socket.send_to(&data, peer.as_str()).await {
                tracing::debug!(peer = %peer, error = ?err, "ballot send failed");
            }
        }
    }

    fn tally(&self, ensemble: u64) -> Option<String> {
        let state = self.state.lock().unwrap();
        let mut counts: HashMap<&str, u64> = HashMap::new();
        for vote in state.ballots.values() {
            *counts.entry(vote.candidate.as_str()).or_default() += 1;
        }
        counts
            .into_iter()
            .find(|(_, count)| *count > ensemble / 2)
            .map(|(candidate, _)| candidate.to_string())
    }
}

impl Drop for ElectionSite {
    fn drop(&mut self) {
        self.responder.abort();
    }
}

async fn respond(
    socket: Arc<UdpSocket>,
    host: String,
    state: Arc<Mutex<VoteState>>,
    notify: Arc<Notify>,
) {
    let mut buf = vec![0u8; MAX_BALLOT_BYTES];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                // Port-unreachable noise from dead peers surfaces here.
                tracing::debug!(error = ?err, "ballot receive failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };
        let Ok(msg) = serde_json::from_slice::<BallotMsg>(&buf[..len]) else {
            tracing::debug!(src = %src, "discarding malformed ballot");
            continue;
        };

        let reply = {
            let mut state = state.lock().unwrap();
            state.ballots.insert(msg.from.clone(), msg.vote.clone());
            if msg.vote.beats(&state.vote) {
                state.vote = msg.vote.clone();
                let vote = state.vote.clone();
                state.ballots.insert(host.clone(), vote);
            }
            (!msg.reply).then(|| BallotMsg {
                from: host.clone(),
                vote: state.vote.clone(),
                reply: true,
            })
        };
        if let Some(reply) = reply {
            if let Ok(data) = serde_json::to_vec(&reply) {
                let _ = socket.send_to(&data, src).await;
            }
        }
        notify.notify_waiters();
    }
}
