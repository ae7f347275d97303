//! Leader serve loop.
//!
//! The leader serializes every request through one proposal round at a time:
//! dequeue, log, broadcast, collect accepts until strict majority, commit,
//! apply, signal. Follower links are registered as they arrive; each link's
//! read half feeds the leader's event queue while the write half stays with
//! the loop for broadcasts.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream, StreamExt};
use futures_util::SinkExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;

use super::types::{
    OpCode, PeerMsg, Proposal, ProtocolActions, ProtocolConfig, QuorumError, RequestHandle,
};
use super::wire::{PeerLink, PeerListener};

type LinkSink = SplitSink<PeerLink, PeerMsg>;

enum Event {
    NewFollower {
        fid: String,
        accepted_epoch: u32,
        link: Box<PeerLink>,
    },
    Msg {
        fid: String,
        msg: PeerMsg,
    },
    Gone {
        fid: String,
    },
}

/// A dequeued request waiting for its proposal round.
struct QueuedRequest {
    req_id: u64,
    op: OpCode,
    key: String,
    content: Vec<u8>,
    fid: String,
}

/// Run the node as leader until terminated or until leadership turns stale.
pub async fn run_leader(
    listener: Arc<PeerListener>,
    actions: Arc<dyn ProtocolActions>,
    incoming: Arc<Mutex<mpsc::Receiver<RequestHandle>>>,
    cfg: ProtocolConfig,
    kill: watch::Receiver<bool>,
) -> Result<(), QuorumError> {
    let (event_tx, event_rx) = mpsc::channel::<Event>(64);
    let acceptor = tokio::spawn(accept_links(listener, event_tx.clone(), cfg));
    let result = serve(actions, incoming, cfg, kill, event_tx, event_rx).await;
    acceptor.abort();
    result
}

async fn serve(
    actions: Arc<dyn ProtocolActions>,
    incoming: Arc<Mutex<mpsc::Receiver<RequestHandle>>>,
    cfg: ProtocolConfig,
    mut kill: watch::Receiver<bool>,
    event_tx: mpsc::Sender<Event>,
    mut event_rx: mpsc::Receiver<Event>,
) -> Result<(), QuorumError> {
    let self_fid = actions.follower_id();

    // A fresh election advances the epoch; every txnid issued from here on
    // embeds it.
    let epoch = actions.current_epoch() + 1;
    actions.notify_new_accepted_epoch(epoch)?;
    actions.notify_new_current_epoch(epoch)?;
    tracing::info!(epoch, fid = %self_fid, "leading");

    let mut links: HashMap<String, LinkSink> = HashMap::new();
    let mut queue: VecDeque<QueuedRequest> = VecDeque::new();

    loop {
        // Pick the next request while servicing link events.
        let req = loop {
            if let Some(req) = queue.pop_front() {
                break req;
            }
            tokio::select! {
                _ = kill.changed() => return Ok(()),
                ev = event_rx.recv() => {
                    let ev = ev.ok_or(QuorumError::LinkClosed)?;
                    handle_event(ev, &actions, &event_tx, &mut links, &mut queue, None).await?;
                }
                handle = recv_incoming(&incoming) => {
                    let Some(handle) = handle else { return Ok(()) };
                    break enqueue_local(handle, &self_fid, actions.as_ref());
                }
            }
        };

        // Proposal round: one request at a time keeps commits ordered by
        // txnid without any reordering bookkeeping.
        let txnid = actions.next_txnid();
        let proposal = Proposal {
            txnid,
            op: req.op,
            key: req.key,
            content: req.content,
            fid: req.fid,
            req_id: req.req_id,
        };
        actions.log_proposal(&proposal)?;
        broadcast(&mut links, PeerMsg::Proposal(proposal.clone())).await;

        let mut accepted: HashSet<String> = HashSet::new();
        accepted.insert(self_fid.clone());
        let deadline = Instant::now() + cfg.proposal_timeout;
        while !actions.has_quorum(accepted.len()) {
            tokio::select! {
                _ = kill.changed() => return Ok(()),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(QuorumError::ProposalTimeout);
                }
                ev = event_rx.recv() => {
                    let ev = ev.ok_or(QuorumError::LinkClosed)?;
                    handle_event(
                        ev,
                        &actions,
                        &event_tx,
                        &mut links,
                        &mut queue,
                        Some((&proposal, &mut accepted)),
                    )
                    .await?;
                }
            }
        }

        actions.commit(&proposal)?;
        broadcast(&mut links, PeerMsg::Commit { txnid }).await;
    }
}

fn enqueue_local(
    handle: RequestHandle,
    self_fid: &str,
    actions: &dyn ProtocolActions,
) -> QueuedRequest {
    let req = QueuedRequest {
        req_id: handle.req_id,
        op: handle.op,
        key: handle.key.clone(),
        content: handle.content.clone(),
        fid: self_fid.to_string(),
    };
    actions.add_pending(handle);
    req
}

async fn handle_event(
    ev: Event,
    actions: &Arc<dyn ProtocolActions>,
    event_tx: &mpsc::Sender<Event>,
    links: &mut HashMap<String, LinkSink>,
    queue: &mut VecDeque<QueuedRequest>,
    round: Option<(&Proposal, &mut HashSet<String>)>,
) -> Result<(), QuorumError> {
    match ev {
        Event::NewFollower {
            fid,
            accepted_epoch,
            link,
        } => {
            // A follower from a newer regime means another leader won a
            // later election; abandon immediately.
            if accepted_epoch > actions.current_epoch() {
                return Err(QuorumError::StaleEpoch);
            }
            let (mut sink, stream) = (*link).split();
            if sink
                .send(PeerMsg::LeaderInfo {
                    current_epoch: actions.current_epoch(),
                })
                .await
                .is_err()
            {
                return Ok(());
            }
            // Catch the fresh follower up on the in-flight round so its
            // accept can still count toward quorum.
            if let Some((proposal, _)) = &round {
                if sink
                    .send(PeerMsg::Proposal((*proposal).clone()))
                    .await
                    .is_err()
                {
                    return Ok(());
                }
            }
            tracing::info!(fid = %fid, "follower joined");
            links.insert(fid.clone(), sink);
            tokio::spawn(read_link(fid, stream, event_tx.clone()));
            Ok(())
        }
        Event::Msg { fid, msg } => {
            match msg {
                PeerMsg::Request {
                    req_id,
                    op,
                    key,
                    content,
                    fid: origin,
                } => queue.push_back(QueuedRequest {
                    req_id,
                    op,
                    key,
                    content,
                    fid: origin,
                }),
                PeerMsg::Accept { txnid, .. } => {
                    if let Some((proposal, accepted)) = round {
                        if txnid == proposal.txnid {
                            accepted.insert(fid);
                        }
                    }
                }
                PeerMsg::FollowerInfo { accepted_epoch, .. } => {
                    if accepted_epoch > actions.current_epoch() {
                        return Err(QuorumError::StaleEpoch);
                    }
                }
                other => {
                    tracing::debug!(fid = %fid, ?other, "ignoring unexpected follower message");
                }
            }
            Ok(())
        }
        Event::Gone { fid } => {
            links.remove(&fid);
            tracing::info!(fid = %fid, "follower left");
            Ok(())
        }
    }
}

async fn recv_incoming(
    incoming: &Arc<Mutex<mpsc::Receiver<RequestHandle>>>,
) -> Option<RequestHandle> {
    incoming.lock().await.recv().await
}

async fn broadcast(links: &mut HashMap<String, LinkSink>, msg: PeerMsg) {
    let mut lost = Vec::new();
    for (fid, sink) in links.iter_mut() {
        if let Err(err) = sink.send(msg.clone()).await {
            tracing::warn!(fid = %fid, error = ?err, "follower link write failed");
            lost.push(fid.clone());
        }
    }
    for fid in lost {
        links.remove(&fid);
    }
}

async fn accept_links(
    listener: Arc<PeerListener>,
    event_tx: mpsc::Sender<Event>,
    cfg: ProtocolConfig,
) {
    loop {
        let (mut link, raddr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(error = ?err, "peer accept failed; stopping acceptor");
                return;
            }
        };
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            // The first frame on a link must identify the follower.
            match tokio::time::timeout(cfg.handshake_timeout, link.next()).await {
                Ok(Some(Ok(PeerMsg::FollowerInfo {
                    fid,
                    accepted_epoch,
                }))) => {
                    let _ = event_tx
                        .send(Event::NewFollower {
                            fid,
                            accepted_epoch,
                            link: Box::new(link),
                        })
                        .await;
                }
                _ => {
                    tracing::debug!(raddr = %raddr, "dropping link without follower handshake");
                }
            }
        });
    }
}

async fn read_link(fid: String, mut stream: SplitStream<PeerLink>, event_tx: mpsc::Sender<Event>) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(msg) => {
                if event_tx
                    .send(Event::Msg {
                        fid: fid.clone(),
                        msg,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(err) => {
                tracing::warn!(fid = %fid, error = ?err, "follower link read failed");
                break;
            }
        }
    }
    let _ = event_tx.send(Event::Gone { fid }).await;
}
