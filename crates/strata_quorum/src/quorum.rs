//! Quorum module wiring.
//!
//! `election` holds the UDP ballot exchange, `leader`/`follower` run the
//! serve-side protocol loops, `txn` allocates epoch-embedding transaction
//! ids, `wire` frames peer messages, and `types` defines the shared
//! request/response and trait contracts.

mod election;
mod follower;
mod leader;
mod txn;
mod types;
mod wire;

pub use election::ElectionSite;
pub use follower::run_follower;
pub use leader::run_leader;
pub use txn::TxnState;
pub use types::{
    OpCode, PeerMsg, PeerStatus, Proposal, ProtocolActions, ProtocolConfig, QuorumError,
    RequestHandle, Txnid, EPOCH_SHIFT,
};
pub use wire::{connect_peer, PeerCodec, PeerLink, PeerListener};
