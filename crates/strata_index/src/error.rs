//! Typed error kinds.
//!
//! These are not a catch-all: each enum covers the kinds a surface matches on
//! to pick a recovery policy. Everything else travels as `anyhow::Error`.

use thiserror::Error;

/// Admin-surface errors, reported to the HTTP caller.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("unable to decode request body")]
    DecodeRequest,
    #[error("no handler registered for path")]
    PathNotFound,
    #[error("cannot register or unregister after the server has started")]
    RegisteringRequest,
    #[error("message name is not registered")]
    MessageUnknown,
    #[error("admin request failed: {0}")]
    Internal(String),
}

/// Dataport errors. The actor maps each kind to a close policy: remote
/// faults close one host, everything else closes the daemon.
#[derive(Debug, Error)]
pub enum DataportError {
    #[error("unknown or malformed dataport payload")]
    Payload,
    #[error("remote is already connected from this address")]
    DuplicateClient,
    #[error("vbucket stream already active on another connection")]
    DuplicateStreamBegin,
    #[error("reader worker killed")]
    WorkerKilled,
    #[error("listener terminated")]
    DaemonExit,
    #[error("read deadline expired")]
    ReadTimeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DataportError {
    /// Remote faults (clean close, silence) cost only the faulting host;
    /// anything else is treated as local corruption and costs the daemon.
    pub fn is_remote_fault(&self) -> bool {
        match self {
            DataportError::ReadTimeout => true,
            DataportError::Io(err) => err.kind() == std::io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}

/// Coordinator errors surfaced on request handles.
#[derive(Debug, Error)]
pub enum CoordError {
    #[error("request terminated by coordinator shutdown")]
    Terminated,
    #[error("index definition committed but topology update failed; result unknown")]
    DdlCreateIndex,
}

/// Metadata repository errors. `NotFound` is part of the contract: a missing
/// topology means "create a fresh one", it is not a failure.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    Exists,
    #[error("metadata storage failure: {0}")]
    Storage(#[from] fjall::Error),
    #[error("metadata codec failure: {0}")]
    Codec(#[from] serde_json::Error),
}
