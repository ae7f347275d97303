//! Shared types for the quorum protocol.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by the election site, the leader/follower loops, and the embedding
//! application's coordinator.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

/// Application-defined operation code carried through proposals opaquely.
pub type OpCode = u32;

/// Bit position of the election epoch inside a transaction id.
pub const EPOCH_SHIFT: u32 = 32;

/// Monotone transaction id. The high 32 bits carry the election epoch, the
/// low 32 bits a per-epoch counter, so ids from a newer leader always compare
/// greater than ids from an older one.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Txnid(pub u64);

impl Txnid {
    pub const fn new(epoch: u32, counter: u32) -> Self {
        Self(((epoch as u64) << EPOCH_SHIFT) | counter as u64)
    }

    pub const fn epoch(self) -> u32 {
        (self.0 >> EPOCH_SHIFT) as u32
    }

    pub const fn counter(self) -> u32 {
        self.0 as u32
    }
}

impl std::fmt::Display for Txnid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.epoch(), self.counter())
    }
}

/// Where a peer currently stands in the protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerStatus {
    Electing,
    Leading,
    Following,
}

/// A client request parked until its commit (or termination) is observed.
///
/// The `done` oneshot is the request's wait primitive: the embedding
/// coordinator keeps the handle in its pending/proposed collections and fires
/// the oneshot exactly once.
#[derive(Debug)]
pub struct RequestHandle {
    pub req_id: u64,
    pub op: OpCode,
    pub key: String,
    pub content: Vec<u8>,
    pub done: oneshot::Sender<anyhow::Result<()>>,
}

/// A proposal issued by the leader for one request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Proposal {
    pub txnid: Txnid,
    pub op: OpCode,
    pub key: String,
    pub content: Vec<u8>,
    /// Follower id of the node that originated the request.
    pub fid: String,
    pub req_id: u64,
}

/// Messages exchanged on follower/leader TCP links.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PeerMsg {
    /// First message on a link, follower to leader.
    FollowerInfo { fid: String, accepted_epoch: u32 },
    /// Leader's handshake reply; the follower adopts the epoch.
    LeaderInfo { current_epoch: u32 },
    /// A request forwarded by a follower for the leader to serialize.
    Request {
        req_id: u64,
        op: OpCode,
        key: String,
        content: Vec<u8>,
        fid: String,
    },
    Proposal(Proposal),
    /// Follower's acknowledgement of a logged proposal.
    Accept { txnid: Txnid, fid: String },
    Commit { txnid: Txnid },
}

/// Protocol-level timeouts.
#[derive(Clone, Copy, Debug)]
pub struct ProtocolConfig {
    /// Upper bound for establishing the follower-to-leader link.
    pub connect_timeout: Duration,
    /// Upper bound for the handshake exchange on a fresh link.
    pub handshake_timeout: Duration,
    /// End-to-end bound for one proposal to reach quorum.
    pub proposal_timeout: Duration,
    /// Largest accepted peer frame.
    pub max_frame: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(2),
            proposal_timeout: Duration::from_secs(10),
            max_frame: 1 << 20,
        }
    }
}

/// Callbacks the embedding coordinator supplies to the protocol loops.
///
/// The protocol treats opcodes and content as opaque bytes; `log_proposal`
/// and `commit` implement the request tracking and storage semantics.
pub trait ProtocolActions: Send + Sync + 'static {
    /// Stable id of the local node (its election address).
    fn follower_id(&self) -> String;

    /// Peers plus the local node.
    fn ensemble_size(&self) -> u64;

    /// Strict-majority quorum over the ensemble.
    fn has_quorum(&self, count: usize) -> bool {
        count as u64 > self.ensemble_size() / 2
    }

    fn next_txnid(&self) -> Txnid;

    fn current_epoch(&self) -> u32;
    fn accepted_epoch(&self) -> u32;

    /// Adopt a larger accepted epoch; smaller or equal values are ignored.
    fn notify_new_accepted_epoch(&self, epoch: u32) -> anyhow::Result<()>;
    /// Adopt a larger current epoch; rebases txnid allocation.
    fn notify_new_current_epoch(&self, epoch: u32) -> anyhow::Result<()>;

    /// Park a locally originated request until commit.
    fn add_pending(&self, handle: RequestHandle);

    /// A proposal was issued; move the matching pending request (if local)
    /// into the proposed stage.
    fn log_proposal(&self, proposal: &Proposal) -> anyhow::Result<()>;

    /// A proposal reached quorum; apply it and signal the local waiter.
    fn commit(&self, proposal: &Proposal) -> anyhow::Result<()>;
}

/// Errors surfaced by the protocol loops.
#[derive(Debug, Error)]
pub enum QuorumError {
    #[error("leader election failed")]
    ElectionFail,
    #[error("peer listener failed: {0}")]
    ListenerFail(String),
    #[error("peer advertised a newer epoch; leadership is stale")]
    StaleEpoch,
    #[error("proposal timed out waiting for quorum")]
    ProposalTimeout,
    #[error("peer link closed")]
    LinkClosed,
    #[error("malformed or oversized peer frame")]
    Frame,
    #[error("terminated")]
    Terminated,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
