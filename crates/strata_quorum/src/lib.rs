//! Quorum coordination crate.
//!
//! This crate provides the replicated-coordination protocol used by
//! strata_index. The API surface is intentionally small: higher layers supply
//! a `ProtocolActions` implementation and a request queue, then drive a node
//! through `ElectionSite`, `run_leader`, and `run_follower`.

pub mod quorum;
