//! Index coordinator.
//!
//! A replicated state machine serializing index-definition mutations. The
//! lifecycle loops `bootstrap -> elect -> serve -> cleanup` with back-off on
//! transient failures. Client requests park on the incoming queue; the
//! leader drains it, moves each handle through pending and proposed stages,
//! and signals the waiter once the proposal commits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch, Notify};

use strata_quorum::quorum::{
    run_follower, run_leader, ElectionSite, OpCode, PeerListener, PeerStatus, Proposal,
    ProtocolActions, ProtocolConfig, QuorumError, RequestHandle, Txnid, TxnState,
};

use crate::error::{CoordError, RepoError};
use crate::repo::MetadataRepo;
use crate::topology::{bucket_from_topology_key, parse_index_defn_key, IndexDefn, IndexState, IndexTopology};

pub const OP_ADD_INDEX_DEFN: OpCode = 1;
pub const OP_DEL_INDEX_DEFN: OpCode = 2;
pub const OP_NOTIFY_TIMESTAMP: OpCode = 3;

const BOOTSTRAP_BACKOFF: Duration = Duration::from_millis(200);
const ELECTION_BACKOFF: Duration = Duration::from_millis(100);
const INCOMING_QUEUE: usize = 256;

/// Stream timestamp forwarded to the index manager on commit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamTimestamp {
    pub bucket: String,
    pub vbnos: Vec<u16>,
    pub seqnos: Vec<u64>,
    pub vbuuids: Vec<u64>,
}

/// Receives committed timestamp notifications.
pub trait TimestampSink: Send + Sync + 'static {
    fn notify_new_timestamp(&self, ts: StreamTimestamp);
}

/// Coordinator wiring: election and peer-link addresses plus the index-host
/// candidates used for placement.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Local election (UDP) address; doubles as the follower id.
    pub host_elect: String,
    /// Local peer-listener (TCP) address.
    pub host_peer: String,
    /// Peer election addresses.
    pub peers_elect: Vec<String>,
    /// Election address to peer TCP address.
    pub peer_tcp: HashMap<String, String>,
    /// Local index host used for placement.
    pub index_host: String,
    /// Peer index hosts used for placement.
    pub peer_index_hosts: Vec<String>,
    pub protocol: ProtocolConfig,
}

struct StateInner {
    done: bool,
    status: PeerStatus,
    /// Local requests the leader has dequeued, keyed by request id.
    pendings: HashMap<u64, RequestHandle>,
    /// Local requests with an issued proposal, keyed by txnid.
    proposals: HashMap<Txnid, RequestHandle>,
}

pub struct Coordinator {
    cfg: CoordinatorConfig,
    repo: Arc<MetadataRepo>,
    sink: Arc<dyn TimestampSink>,
    state: Mutex<StateInner>,
    incoming_tx: mpsc::Sender<RequestHandle>,
    incoming_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<RequestHandle>>>,
    txn: RwLock<Arc<TxnState>>,
    site: Mutex<Option<Arc<ElectionSite>>>,
    kill: Mutex<Option<watch::Sender<bool>>>,
    ready: AtomicBool,
    ready_notify: Notify,
}

impl Coordinator {
    pub fn new(
        repo: Arc<MetadataRepo>,
        sink: Arc<dyn TimestampSink>,
        cfg: CoordinatorConfig,
    ) -> Result<Arc<Self>, RepoError> {
        let last_logged = Txnid(repo.get_last_logged_txnid()?);
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE);
        Ok(Arc::new(Self {
            cfg,
            repo,
            sink,
            state: Mutex::new(StateInner {
                done: false,
                status: PeerStatus::Electing,
                pendings: HashMap::new(),
                proposals: HashMap::new(),
            }),
            incoming_tx,
            incoming_rx: Arc::new(tokio::sync::Mutex::new(incoming_rx)),
            txn: RwLock::new(Arc::new(TxnState::new(last_logged))),
            site: Mutex::new(None),
            kill: Mutex::new(None),
            ready: AtomicBool::new(false),
            ready_notify: Notify::new(),
        }))
    }

    /// Drive the coordinator until terminated.
    pub async fn run(self: Arc<Self>) {
        loop {
            let pause = self.clone().run_once().await;
            if self.is_done() {
                break;
            }
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }
        tracing::info!(host = %self.cfg.host_elect, "coordinator terminated");
    }

    /// Terminate the coordinator. Every parked request is signalled with a
    /// termination error.
    pub fn terminate(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.done {
                return;
            }
            state.done = true;
        }
        if let Some(site) = self.site.lock().unwrap().take() {
            site.close();
        }
        if let Some(kill) = self.kill.lock().unwrap().take() {
            let _ = kill.send(true);
        }
        self.ready_notify.notify_waiters();
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().unwrap().done
    }

    pub fn status(&self) -> PeerStatus {
        self.state.lock().unwrap().status
    }

    /// Submit a request and block until it commits or the coordinator goes
    /// down. An interrupted request may still be processed elsewhere; its
    /// outcome is unknown to this caller.
    pub async fn new_request(
        &self,
        id: u64,
        op: OpCode,
        key: &str,
        content: Vec<u8>,
    ) -> anyhow::Result<()> {
        self.wait_ready().await?;
        let (done, rx) = oneshot::channel();
        let handle = RequestHandle {
            req_id: id,
            op,
            key: key.to_string(),
            content,
            done,
        };
        self.incoming_tx
            .send(handle)
            .await
            .map_err(|_| anyhow!(CoordError::Terminated))?;
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(CoordError::Terminated.into()),
        }
    }

    async fn run_once(self: Arc<Self>) -> Duration {
        tracing::debug!(host = %self.cfg.host_elect, "coordinator cycle starting");
        let mut pause = Duration::ZERO;
        match self.bootstrap().await {
            Err(err) => {
                tracing::warn!(error = ?err, "coordinator bootstrap failed");
                pause = BOOTSTRAP_BACKOFF;
            }
            Ok((listener, mut kill_rx)) => {
                if !self.is_done() {
                    match self.run_election(&mut kill_rx).await {
                        Err(err) => {
                            tracing::warn!(error = ?err, "election failed");
                            pause = ELECTION_BACKOFF;
                        }
                        Ok(leader) => {
                            if !self.is_done() {
                                if let Err(err) =
                                    self.clone().run_protocol(&leader, listener, kill_rx).await
                                {
                                    tracing::warn!(error = ?err, "protocol loop ended");
                                }
                            }
                        }
                    }
                }
            }
        }
        self.cleanup_state();
        pause
    }

    /// Open config state, seed the txn allocator, and start the peer
    /// listener. The listener starts before election: a follower that
    /// finishes its election first must be able to connect while this node
    /// is still voting.
    async fn bootstrap(&self) -> anyhow::Result<(Arc<PeerListener>, watch::Receiver<bool>)> {
        let last_logged = Txnid(self.repo.get_last_logged_txnid()?);
        *self.txn.write().unwrap() = Arc::new(TxnState::new(last_logged));

        let (kill_tx, kill_rx) = watch::channel(false);
        *self.kill.lock().unwrap() = Some(kill_tx);

        let listener = Arc::new(
            PeerListener::bind(&self.cfg.host_peer, self.cfg.protocol.max_frame)
                .await
                .context("start peer listener")?,
        );
        let site = Arc::new(
            ElectionSite::new(
                &self.cfg.host_elect,
                &self.cfg.peers_elect,
                self.repo.get_current_epoch()?,
                last_logged,
            )
            .await
            .context("start election site")?,
        );
        *self.site.lock().unwrap() = Some(site);

        self.mark_ready();
        Ok((listener, kill_rx))
    }

    async fn run_election(&self, kill: &mut watch::Receiver<bool>) -> anyhow::Result<String> {
        let site = self
            .site
            .lock()
            .unwrap()
            .clone()
            .ok_or(QuorumError::ElectionFail)?;
        tracing::debug!(host = %site.host(), peers = self.cfg.peers_elect.len(), "starting election");
        Ok(site.elect(kill).await?)
    }

    async fn run_protocol(
        self: Arc<Self>,
        leader: &str,
        listener: Arc<PeerListener>,
        kill: watch::Receiver<bool>,
    ) -> Result<(), QuorumError> {
        let actions: Arc<dyn ProtocolActions> = self.clone();
        if leader == self.cfg.host_elect {
            self.set_status(PeerStatus::Leading);
            run_leader(
                listener,
                actions,
                self.incoming_rx.clone(),
                self.cfg.protocol,
                kill,
            )
            .await
        } else {
            self.set_status(PeerStatus::Following);
            let leader_tcp = self
                .cfg
                .peer_tcp
                .get(leader)
                .ok_or(QuorumError::ElectionFail)?
                .clone();
            run_follower(
                &leader_tcp,
                actions,
                self.incoming_rx.clone(),
                self.cfg.protocol,
                kill,
            )
            .await
        }
    }

    fn cleanup_state(&self) {
        self.mark_not_ready();
        if let Some(site) = self.site.lock().unwrap().take() {
            site.close();
        }
        // Drain queued arrivals without blocking; the serve loops are gone,
        // so the queue lock is free in steady state.
        if let Ok(mut incoming) = self.incoming_rx.try_lock() {
            while let Ok(handle) = incoming.try_recv() {
                let _ = handle.done.send(Err(CoordError::Terminated.into()));
            }
        }
        let mut state = self.state.lock().unwrap();
        for (_, handle) in state.pendings.drain() {
            let _ = handle.done.send(Err(CoordError::Terminated.into()));
        }
        for (_, handle) in state.proposals.drain() {
            let _ = handle.done.send(Err(CoordError::Terminated.into()));
        }
        state.status = PeerStatus::Electing;
    }

    fn set_status(&self, status: PeerStatus) {
        self.state.lock().unwrap().status = status;
    }

    fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
        self.ready_notify.notify_waiters();
    }

    fn mark_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    async fn wait_ready(&self) -> anyhow::Result<()> {
        loop {
            let notified = self.ready_notify.notified();
            if self.is_done() {
                return Err(CoordError::Terminated.into());
            }
            if self.ready.load(Ordering::SeqCst) {
                return Ok(());
            }
            notified.await;
        }
    }

    fn apply_committed(&self, proposal: &Proposal) -> anyhow::Result<()> {
        match proposal.op {
            OP_ADD_INDEX_DEFN => self.apply_create(proposal),
            OP_DEL_INDEX_DEFN => self.apply_delete(proposal),
            OP_NOTIFY_TIMESTAMP => self.apply_timestamp(proposal),
            other => {
                tracing::warn!(op = other, "ignoring unknown opcode");
                Ok(())
            }
        }
    }

    fn apply_create(&self, proposal: &Proposal) -> anyhow::Result<()> {
        let defn: IndexDefn =
            serde_json::from_slice(&proposal.content).context("decode index definition")?;
        self.repo.create_index(&defn)?;
        self.add_index_to_topology(&defn).map_err(|err| {
            // The commit already happened; the definition exists without a
            // final placement. Monotone topology transitions make a retry
            // safe, so surface "result unknown" and let the client decide.
            tracing::error!(error = ?err, name = %defn.name, bucket = %defn.bucket, "topology update failed");
            anyhow::Error::new(CoordError::DdlCreateIndex)
        })
    }

    fn apply_delete(&self, proposal: &Proposal) -> anyhow::Result<()> {
        let (bucket, name) = parse_index_defn_key(&proposal.key)
            .ok_or_else(|| anyhow!("malformed index key {:?}", proposal.key))?;
        // Drop the definition before updating topology: a dangling topology
        // reference to a deleted definition is easy to detect, an
        // unreferenced definition is not.
        self.repo.drop_index_by_name(bucket, name)?;
        self.delete_index_from_topology(bucket, name).map_err(|err| {
            tracing::error!(error = ?err, name, bucket, "topology update failed");
            anyhow::Error::new(CoordError::DdlCreateIndex)
        })
    }

    fn apply_timestamp(&self, proposal: &Proposal) -> anyhow::Result<()> {
        match serde_json::from_slice::<StreamTimestamp>(&proposal.content) {
            Ok(ts) => self.sink.notify_new_timestamp(ts),
            Err(err) => {
                tracing::debug!(error = ?err, "ignoring undecodable timestamp");
            }
        }
        Ok(())
    }

    fn add_index_to_topology(&self, defn: &IndexDefn) -> anyhow::Result<()> {
        let mut topology = match self.repo.get_topology(&defn.bucket) {
            Ok(topology) => topology,
            Err(RepoError::NotFound) => IndexTopology::new(&defn.bucket),
            Err(err) => return Err(err.into()),
        };
        let host = self.find_next_avail_host()?;
        let inst_id = self.repo.next_index_inst_id()?;
        topology.add_definition(defn, inst_id, &host);

        // Reference the bucket in the global topology before writing the
        // bucket document: a dangling reference is discoverable, an
        // unreferenced bucket topology is not.
        self.add_to_global_topology_if_missing(&defn.bucket)?;
        self.repo.set_topology(&defn.bucket, &topology)?;
        Ok(())
    }

    fn delete_index_from_topology(&self, bucket: &str, name: &str) -> anyhow::Result<()> {
        let mut topology = match self.repo.get_topology(bucket) {
            Ok(topology) => topology,
            Err(RepoError::NotFound) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if let Some(defn) = topology.find_definition(name) {
            let defn_id = defn.defn_id;
            if topology.set_instance_state_by_defn(defn_id, IndexState::Deleted) {
                self.repo.set_topology(bucket, &topology)?;
            }
        }
        Ok(())
    }

    fn add_to_global_topology_if_missing(&self, bucket: &str) -> anyhow::Result<()> {
        let mut global = match self.repo.get_global_topology() {
            Ok(global) => global,
            Err(RepoError::NotFound) => Default::default(),
            Err(err) => return Err(err.into()),
        };
        if global.add_key_if_missing(&crate::topology::topology_key(bucket)) {
            self.repo.set_global_topology(&global)?;
        }
        Ok(())
    }

    /// Pick the host with the fewest deployed index definitions across all
    /// buckets. Counts definitions only, not load; ties resolve to the
    /// earliest candidate (local host first, then peers in configured
    /// order).
    fn find_next_avail_host(&self) -> anyhow::Result<String> {
        let global = match self.repo.get_global_topology() {
            Ok(global) => global,
            Err(RepoError::NotFound) => return Ok(self.cfg.index_host.clone()),
            Err(err) => return Err(err.into()),
        };

        let mut counts: Vec<(String, usize)> = std::iter::once(self.cfg.index_host.clone())
            .chain(self.cfg.peer_index_hosts.iter().cloned())
            .map(|host| (host, 0))
            .collect();
        for key in &global.keys {
            let bucket = bucket_from_topology_key(key);
            let topology = match self.repo.get_topology(bucket) {
                Ok(topology) => topology,
                Err(RepoError::NotFound) => {
                    // Dangling reference; tolerated.
                    tracing::debug!(key = %key, "global topology key without document");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            for host in topology.slice_hosts() {
                if let Some(entry) = counts.iter_mut().find(|(candidate, _)| candidate == host) {
                    entry.1 += 1;
                }
            }
        }

        let mut best: Option<(&String, usize)> = None;
        for (host, count) in &counts {
            if best.map_or(true, |(_, least)| *count < least) {
                best = Some((host, *count));
            }
        }
        best.map(|(host, _)| host.clone())
            .ok_or_else(|| anyhow!("no candidate index hosts configured"))
    }
}

impl ProtocolActions for Coordinator {
    fn follower_id(&self) -> String {
        self.cfg.host_elect.clone()
    }

    fn ensemble_size(&self) -> u64 {
        self.cfg.peers_elect.len() as u64 + 1
    }

    fn next_txnid(&self) -> Txnid {
        self.txn.read().unwrap().next()
    }

    fn current_epoch(&self) -> u32 {
        self.repo.get_current_epoch().unwrap_or_else(|err| {
            tracing::error!(error = ?err, "reading current epoch failed");
            0
        })
    }

    fn accepted_epoch(&self) -> u32 {
        self.repo.get_accepted_epoch().unwrap_or_else(|err| {
            tracing::error!(error = ?err, "reading accepted epoch failed");
            0
        })
    }

    fn notify_new_accepted_epoch(&self, epoch: u32) -> anyhow::Result<()> {
        if epoch > self.repo.get_accepted_epoch()? {
            self.repo.set_accepted_epoch(epoch)?;
        }
        Ok(())
    }

    fn notify_new_current_epoch(&self, epoch: u32) -> anyhow::Result<()> {
        if epoch > self.repo.get_current_epoch()? {
            self.repo.set_current_epoch(epoch)?;
            // Late voters must hear the settled epoch, and every txnid from
            // here on embeds it.
            if let Some(site) = self.site.lock().unwrap().as_ref() {
                site.update_winning_epoch(epoch);
            }
            self.txn.read().unwrap().set_epoch(epoch);
        }
        Ok(())
    }

    fn add_pending(&self, handle: RequestHandle) {
        self.state.lock().unwrap().pendings.insert(handle.req_id, handle);
    }

    fn log_proposal(&self, proposal: &Proposal) -> anyhow::Result<()> {
        self.repo.set_last_logged_txnid(proposal.txnid.0)?;
        if proposal.fid == self.cfg.host_elect {
            // This node originated the request: the correlation key changes
            // from request id to txnid here.
            let mut state = self.state.lock().unwrap();
            if let Some(handle) = state.pendings.remove(&proposal.req_id) {
                state.proposals.insert(proposal.txnid, handle);
            }
        }
        Ok(())
    }

    fn commit(&self, proposal: &Proposal) -> anyhow::Result<()> {
        self.repo.set_last_committed_txnid(proposal.txnid.0)?;
        let outcome = self.apply_committed(proposal);
        if let Err(err) = &outcome {
            tracing::warn!(txnid = %proposal.txnid, error = ?err, "commit applied with error");
        }
        let handle = self.state.lock().unwrap().proposals.remove(&proposal.txnid);
        if let Some(handle) = handle {
            let _ = handle.done.send(outcome);
        }
        Ok(())
    }
}
