//! Follower serve loop.
//!
//! A follower holds one TCP link to the leader. Local requests are parked in
//! the coordinator's pending stage and forwarded; proposals from the leader
//! are logged and acknowledged; commits apply the remembered proposal. The
//! link failing in any way returns an error so the outer loop can re-elect.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;

use super::types::{PeerMsg, Proposal, ProtocolActions, ProtocolConfig, QuorumError, RequestHandle, Txnid};
use super::wire::connect_peer;

/// Run the node as follower of `leader_addr` until terminated or the link is
/// lost.
pub async fn run_follower(
    leader_addr: &str,
    actions: Arc<dyn ProtocolActions>,
    incoming: Arc<Mutex<mpsc::Receiver<RequestHandle>>>,
    cfg: ProtocolConfig,
    mut kill: watch::Receiver<bool>,
) -> Result<(), QuorumError> {
    let fid = actions.follower_id();
    let link = timeout(cfg.connect_timeout, connect_peer(leader_addr, cfg.max_frame))
        .await
        .map_err(|_| QuorumError::LinkClosed)??;
    let (mut sink, mut stream) = link.split();

    sink.send(PeerMsg::FollowerInfo {
        fid: fid.clone(),
        accepted_epoch: actions.accepted_epoch(),
    })
    .await?;

    // The leader answers with its epoch; adopt it before serving.
    match timeout(cfg.handshake_timeout, stream.next()).await {
        Ok(Some(Ok(PeerMsg::LeaderInfo { current_epoch }))) => {
            actions.notify_new_accepted_epoch(current_epoch)?;
            actions.notify_new_current_epoch(current_epoch)?;
            tracing::info!(leader = %leader_addr, epoch = current_epoch, fid = %fid, "following");
        }
        Ok(Some(Ok(other))) => {
            tracing::warn!(?other, "expected leader handshake");
            return Err(QuorumError::Frame);
        }
        Ok(Some(Err(err))) => return Err(err.into()),
        Ok(None) | Err(_) => return Err(QuorumError::LinkClosed),
    }

    // Proposals logged but not yet committed, keyed by txnid.
    let mut logged: HashMap<Txnid, Proposal> = HashMap::new();

    loop {
        tokio::select! {
            _ = kill.changed() => return Ok(()),
            handle = recv_incoming(&incoming) => {
                let Some(handle) = handle else { return Ok(()) };
                let msg = PeerMsg::Request {
                    req_id: handle.req_id,
                    op: handle.op,
                    key: handle.key.clone(),
                    content: handle.content.clone(),
                    fid: fid.clone(),
                };
                actions.add_pending(handle);
                sink.send(msg).await?;
            }
            frame = stream.next() => {
                match frame {
                    None => return Err(QuorumError::LinkClosed),
                    Some(Err(err)) => return Err(err.into()),
                    Some(Ok(PeerMsg::Proposal(proposal))) => {
                        actions.log_proposal(&proposal)?;
                        sink.send(PeerMsg::Accept {
                            txnid: proposal.txnid,
                            fid: fid.clone(),
                        })
                        .await?;
                        logged.insert(proposal.txnid, proposal);
                    }
                    Some(Ok(PeerMsg::Commit { txnid })) => match logged.remove(&txnid) {
                        Some(proposal) => actions.commit(&proposal)?,
                        None => tracing::warn!(%txnid, "commit for a proposal this follower never logged"),
                    },
                    Some(Ok(other)) => {
                        tracing::debug!(?other, "ignoring unexpected leader message");
                    }
                }
            }
        }
    }
}

async fn recv_incoming(
    incoming: &Arc<Mutex<mpsc::Receiver<RequestHandle>>>,
) -> Option<RequestHandle> {
    incoming.lock().await.recv().await
}
