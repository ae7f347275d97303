//! Mutation-ingest daemon.
//!
//! One listener task accepts upstream router connections; a serial actor owns
//! the connection table and the remote-vbucket map; one reader task per live
//! connection decodes frames and publishes batches to the application's
//! mutation channel. Lifecycle notices travel out of band on the sideband
//! channel:
//!
//! * `Restart`: every connection with one upstream host was closed; the
//!   listed vbuckets need a catchup connection.
//! * `Shutdown`: every connection was closed and the daemon is going down.
//! * `ConnError`: diagnostic cause preceding a shutdown notice.
//!
//! The actor is the sole mutator of its state; readers and the listener only
//! send it commands.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_util::codec::Framed;

use crate::error::DataportError;
use crate::payload::{DataportPayload, VbConnectionMap, VbKeyVersions};
use crate::stats::{DataportStats, DataportStatsSnapshot};
use crate::transport::{DataportCodec, DataportLink};

/// Bucket plus vbucket number, the unit of stream identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BucketVb {
    pub bucket: String,
    pub vbno: u16,
}

/// Vbuckets of one bucket needing restart.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestartVbuckets {
    pub bucket: String,
    pub vbuckets: Vec<u16>,
}

/// Out-of-band notices to the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SidebandEvent {
    /// Connections with one upstream host were closed.
    Restart(Vec<RestartVbuckets>),
    /// Every connection was closed; the daemon is shutting down.
    Shutdown(Vec<RestartVbuckets>),
    /// Cause string for a fault, sent before the shutdown notice.
    ConnError { raddr: String, error: String },
}

/// Dataport tuning.
#[derive(Clone, Copy, Debug)]
pub struct DataportConfig {
    /// Per-read deadline on every connection.
    pub read_deadline: Duration,
    /// Largest accepted payload.
    pub max_payload: usize,
    /// Actor command-queue depth.
    pub queue_len: usize,
}

impl Default for DataportConfig {
    fn default() -> Self {
        Self {
            read_deadline: Duration::from_secs(30),
            max_payload: 1 << 20,
            queue_len: 64,
        }
    }
}

enum ServerCommand {
    NewConnection {
        raddr: String,
        stream: TcpStream,
    },
    Vbmap {
        raddr: String,
        vbmap: VbConnectionMap,
        link: Box<DataportLink>,
    },
    VbControl {
        raddr: String,
        started: Vec<BucketVb>,
        finished: Vec<BucketVb>,
        link: Box<DataportLink>,
    },
    ConnError {
        raddr: String,
        err: DataportError,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Per-connection record. The link is parked here between readers; the kill
/// sender is dropped to stop a running reader.
struct NetConn {
    link: Option<Box<DataportLink>>,
    kill: Option<mpsc::Sender<()>>,
    active: bool,
}

/// Handle to a running dataport server.
pub struct Server {
    laddr: SocketAddr,
    reqch: mpsc::Sender<ServerCommand>,
    done: watch::Receiver<bool>,
    stats: Arc<DataportStats>,
}

impl Server {
    /// Bind `laddr` and spawn the listener and the actor. The mutation and
    /// sideband channels are owned by the application; the server only sends.
    pub async fn new(
        laddr: &str,
        cfg: DataportConfig,
        mutch: mpsc::Sender<Vec<VbKeyVersions>>,
        sbch: mpsc::UnboundedSender<SidebandEvent>,
    ) -> Result<Server, DataportError> {
        let listener = TcpListener::bind(laddr).await?;
        let laddr = listener.local_addr()?;
        let stats = Arc::new(DataportStats::default());
        let (reqch_tx, reqch_rx) = mpsc::channel(cfg.queue_len);
        let (listener_kill_tx, listener_kill_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        tokio::spawn(listen(listener, reqch_tx.clone(), listener_kill_rx));

        let actor = GenServer {
            log_prefix: format!("[dataport {laddr}]"),
            cfg,
            conns: HashMap::new(),
            remote_uuids: HashMap::new(),
            mutch,
            sbch,
            reqch_tx: reqch_tx.clone(),
            stats: stats.clone(),
            listener_kill: listener_kill_tx,
        };
        tokio::spawn(async move {
            let prefix = actor.log_prefix.clone();
            if AssertUnwindSafe(actor.run(reqch_rx))
                .catch_unwind()
                .await
                .is_err()
            {
                // Unwinding dropped every connection and the listener kill
                // handle; all that is left is raising the latch.
                tracing::error!(prefix = %prefix, "dataport actor panicked; daemon is down");
            }
            let _ = done_tx.send(true);
        });

        tracing::info!(laddr = %laddr, "dataport started");
        Ok(Server {
            laddr,
            reqch: reqch_tx,
            done: done_rx,
            stats,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.laddr
    }

    pub fn stats(&self) -> DataportStatsSnapshot {
        self.stats.snapshot()
    }

    /// Shut everything down. Synchronous from the caller's view: returns
    /// only after the actor has finished cleanup.
    pub async fn close(&self) -> Result<(), DataportError> {
        let (tx, rx) = oneshot::channel();
        if self
            .reqch
            .send(ServerCommand::Close { reply: tx })
            .await
            .is_err()
        {
            // Actor already gone (self-shutdown or earlier close).
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    /// Resolves once the actor has exited, whatever the cause.
    pub async fn done(&self) {
        let mut done = self.done.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Accept connections until the kill signal; accept failure is terminal and
/// is reported to the actor as a daemon-exit fault.
async fn listen(
    listener: TcpListener,
    reqch: mpsc::Sender<ServerCommand>,
    mut kill: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = kill.changed() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, raddr)) => {
                    let cmd = ServerCommand::NewConnection {
                        raddr: raddr.to_string(),
                        stream,
                    };
                    if reqch.send(cmd).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    tracing::error!(error = ?err, "dataport accept failed");
                    let _ = reqch
                        .send(ServerCommand::ConnError {
                            raddr: String::new(),
                            err: DataportError::DaemonExit,
                        })
                        .await;
                    return;
                }
            },
        }
    }
}

struct GenServer {
    log_prefix: String,
    cfg: DataportConfig,
    conns: HashMap<String, NetConn>,
    remote_uuids: HashMap<String, Vec<BucketVb>>,
    mutch: mpsc::Sender<Vec<VbKeyVersions>>,
    sbch: mpsc::UnboundedSender<SidebandEvent>,
    reqch_tx: mpsc::Sender<ServerCommand>,
    stats: Arc<DataportStats>,
    listener_kill: watch::Sender<bool>,
}

impl GenServer {
    async fn run(mut self, mut reqch: mpsc::Receiver<ServerCommand>) {
        while let Some(cmd) = reqch.recv().await {
            match cmd {
                ServerCommand::NewConnection { raddr, stream } => {
                    self.handle_new_connection(raddr, stream);
                }
                ServerCommand::Vbmap { raddr, vbmap, link } => {
                    self.handle_vbmap(raddr, vbmap, link);
                }
                ServerCommand::VbControl {
                    raddr,
                    started,
                    finished,
                    link,
                } => {
                    if self.handle_vbcontrol(raddr, started, finished, link) {
                        return;
                    }
                }
                ServerCommand::ConnError { raddr, err } => {
                    if self.jumbo_error_handler(raddr, err) {
                        return;
                    }
                }
                ServerCommand::Close { reply } => {
                    self.handle_close();
                    let _ = reply.send(());
                    return;
                }
            }
        }
    }

    fn handle_new_connection(&mut self, raddr: String, stream: TcpStream) {
        tracing::info!(prefix = %self.log_prefix, raddr = %raddr, "connection request");
        if host_of(&raddr).is_none() {
            tracing::error!(prefix = %self.log_prefix, raddr = %raddr, "unparseable remote address");
            return;
        }
        if self.conns.contains_key(&raddr) {
            // Close the new socket; the established connection stays.
            tracing::error!(
                prefix = %self.log_prefix,
                raddr = %raddr,
                error = %DataportError::DuplicateClient,
                "rejecting duplicate connection"
            );
            return;
        }
        let link = Box::new(Framed::new(stream, DataportCodec::new(self.cfg.max_payload)));
        self.conns.insert(
            raddr.clone(),
            NetConn {
                link: Some(link),
                kill: None,
                active: false,
            },
        );
        self.remote_uuids.entry(raddr.clone()).or_default();
        self.stats.connection_opened();
        tracing::info!(
            prefix = %self.log_prefix,
            total = self.conns.len(),
            "active connections"
        );
        self.start_worker(&raddr);
    }

    fn handle_vbmap(&mut self, raddr: String, vbmap: VbConnectionMap, link: Box<DataportLink>) {
        if !self.conns.contains_key(&raddr) {
            tracing::error!(prefix = %self.log_prefix, raddr = %raddr, "remote already gone");
            return;
        }
        let uuids = self.remote_uuids.entry(raddr.clone()).or_default();
        for vbno in &vbmap.vbuckets {
            uuids.push(BucketVb {
                bucket: vbmap.bucket.clone(),
                vbno: *vbno,
            });
        }
        tracing::info!(
            prefix = %self.log_prefix,
            raddr = %raddr,
            bucket = %vbmap.bucket,
            vbuckets = vbmap.vbuckets.len(),
            "vbmap registered"
        );
        if let Some(conn) = self.conns.get_mut(&raddr) {
            conn.link = Some(link);
            conn.active = false;
        }
        self.start_worker(&raddr);
    }

    /// Returns true when a duplicate stream-begin forced a full shutdown.
    fn handle_vbcontrol(
        &mut self,
        raddr: String,
        started: Vec<BucketVb>,
        finished: Vec<BucketVb>,
        link: Box<DataportLink>,
    ) -> bool {
        if !self.conns.contains_key(&raddr) {
            tracing::error!(prefix = %self.log_prefix, raddr = %raddr, "remote already gone");
            return false;
        }
        if !started.is_empty() {
            if let Err(err) = self.add_uuids(&raddr, started) {
                // A vbucket owned by two connections is unrecoverable
                // corruption of the stream identity space.
                tracing::error!(prefix = %self.log_prefix, raddr = %raddr, error = %err, "fatal");
                let _ = self.sbch.send(SidebandEvent::ConnError {
                    raddr,
                    error: err.to_string(),
                });
                let all = vbuckets_for_remotes(&self.remote_uuids);
                let _ = self.sbch.send(SidebandEvent::Shutdown(all));
                self.handle_close();
                return true;
            }
        }
        if !finished.is_empty() {
            self.del_uuids(&raddr, &finished);
        }
        if let Some(conn) = self.conns.get_mut(&raddr) {
            conn.link = Some(link);
            conn.active = false;
        }
        self.start_worker(&raddr);
        false
    }

    /// Either closes every connection with the faulting host or, for
    /// non-remote faults, closes everything and shuts the daemon down.
    /// Returns true when the daemon is down.
    fn jumbo_error_handler(&mut self, raddr: String, err: DataportError) -> bool {
        if matches!(err, DataportError::DaemonExit) {
            tracing::error!(prefix = %self.log_prefix, error = %err, "listener lost; shutting down");
            let _ = self.sbch.send(SidebandEvent::ConnError {
                raddr,
                error: err.to_string(),
            });
            let all = vbuckets_for_remotes(&self.remote_uuids);
            let _ = self.sbch.send(SidebandEvent::Shutdown(all));
            self.handle_close();
            return true;
        }

        if !self.conns.contains_key(&raddr) {
            tracing::error!(prefix = %self.log_prefix, raddr = %raddr, "remote already gone");
            return false;
        }

        if err.is_remote_fault() {
            tracing::error!(prefix = %self.log_prefix, raddr = %raddr, error = %err, "remote fault");
            let closed = self.close_remote_host(&raddr);
            let mut uuids = Vec::new();
            for craddr in closed {
                if let Some(gone) = self.remote_uuids.remove(&craddr) {
                    uuids.extend(gone);
                }
            }
            let _ = self
                .sbch
                .send(SidebandEvent::Restart(group_by_bucket(uuids)));
            false
        } else {
            tracing::error!(prefix = %self.log_prefix, raddr = %raddr, error = %err, "fatal fault");
            let _ = self.sbch.send(SidebandEvent::ConnError {
                raddr,
                error: err.to_string(),
            });
            let all = vbuckets_for_remotes(&self.remote_uuids);
            let _ = self.sbch.send(SidebandEvent::Shutdown(all));
            self.handle_close();
            true
        }
    }

    fn handle_close(&mut self) {
        tracing::info!(prefix = %self.log_prefix, "shutting down");
        let _ = self.listener_kill.send(true);
        for (raddr, conn) in self.conns.drain() {
            // Dropping the record drops the kill sender and any parked link;
            // a running reader observes the closed kill channel and exits.
            self.stats.connection_closed();
            tracing::info!(
                prefix = %self.log_prefix,
                raddr = %raddr,
                reading = conn.active,
                "closed connection"
            );
        }
        self.remote_uuids.clear();
    }

    /// Close every connection whose host matches `raddr`'s host. Returns the
    /// closed remote addresses.
    fn close_remote_host(&mut self, raddr: &str) -> Vec<String> {
        let Some(host) = host_of(raddr) else {
            tracing::error!(prefix = %self.log_prefix, raddr = %raddr, "unknown connection");
            return Vec::new();
        };
        let host = host.to_string();
        let targets: Vec<String> = self
            .conns
            .keys()
            .filter(|candidate| host_of(candidate) == Some(host.as_str()))
            .cloned()
            .collect();
        for craddr in &targets {
            if let Some(conn) = self.conns.remove(craddr) {
                self.stats.connection_closed();
                tracing::info!(
                    prefix = %self.log_prefix,
                    raddr = %craddr,
                    reading = conn.active,
                    "closed connection"
                );
            }
        }
        targets
    }

    fn add_uuids(&mut self, raddr: &str, started: Vec<BucketVb>) -> Result<(), DataportError> {
        // A vbucket already registered on this same connection (through the
        // vbmap) folds in silently; the same vbucket on another connection
        // violates stream-identity ownership.
        for uuid in &started {
            for (owner, owned) in &self.remote_uuids {
                if owner != raddr && owned.contains(uuid) {
                    tracing::error!(
                        prefix = %self.log_prefix,
                        bucket = %uuid.bucket,
                        vbno = uuid.vbno,
                        owner = %owner,
                        "duplicate vbucket"
                    );
                    return Err(DataportError::DuplicateStreamBegin);
                }
            }
        }
        let entry = self.remote_uuids.entry(raddr.to_string()).or_default();
        for uuid in started {
            if entry.contains(&uuid) {
                tracing::debug!(
                    prefix = %self.log_prefix,
                    bucket = %uuid.bucket,
                    vbno = uuid.vbno,
                    "vbucket already registered on this connection"
                );
                continue;
            }
            tracing::info!(
                prefix = %self.log_prefix,
                bucket = %uuid.bucket,
                vbno = uuid.vbno,
                "added vbucket"
            );
            entry.push(uuid);
        }
        Ok(())
    }

    fn del_uuids(&mut self, raddr: &str, finished: &[BucketVb]) {
        if let Some(uuids) = self.remote_uuids.get_mut(raddr) {
            uuids.retain(|uuid| !finished.contains(uuid));
        }
    }

    fn start_worker(&mut self, raddr: &str) {
        let Some(conn) = self.conns.get_mut(raddr) else {
            tracing::error!(prefix = %self.log_prefix, raddr = %raddr, "no connection to start");
            return;
        };
        let Some(link) = conn.link.take() else {
            tracing::error!(prefix = %self.log_prefix, raddr = %raddr, "reader already running");
            return;
        };
        let (kill_tx, kill_rx) = mpsc::channel(1);
        conn.kill = Some(kill_tx);
        conn.active = true;
        tracing::info!(prefix = %self.log_prefix, raddr = %raddr, "starting worker");

        let prefix = self.log_prefix.clone();
        let raddr = raddr.to_string();
        let mutch = self.mutch.clone();
        let reqch = self.reqch_tx.clone();
        let stats = self.stats.clone();
        let read_deadline = self.cfg.read_deadline;
        tokio::spawn(async move {
            let receive = do_receive(
                prefix.clone(),
                raddr.clone(),
                link,
                kill_rx,
                mutch,
                reqch.clone(),
                stats,
                read_deadline,
            );
            if AssertUnwindSafe(receive).catch_unwind().await.is_err() {
                // Contained: the exit is observed like any other faulted
                // connection.
                tracing::error!(prefix = %prefix, raddr = %raddr, "reader panicked");
                let err = DataportError::Io(io::Error::other("reader panicked"));
                let _ = reqch.send(ServerCommand::ConnError { raddr, err }).await;
            }
        });
    }
}

/// Per-connection reader. Exits after every control transition so the actor
/// can fold the update into its state before the next frame is read.
#[allow(clippy::too_many_arguments)]
async fn do_receive(
    prefix: String,
    raddr: String,
    mut link: Box<DataportLink>,
    mut kill: mpsc::Receiver<()>,
    mutch: mpsc::Sender<Vec<VbKeyVersions>>,
    reqch: mpsc::Sender<ServerCommand>,
    stats: Arc<DataportStats>,
    read_deadline: Duration,
) {
    let mut started: Vec<BucketVb> = Vec::new();
    let mut finished: Vec<BucketVb> = Vec::new();

    loop {
        let frame = tokio::select! {
            frame = timeout(read_deadline, link.next()) => frame,
            _ = kill.recv() => {
                tracing::error!(prefix = %prefix, raddr = %raddr, "worker killed");
                let _ = reqch
                    .send(ServerCommand::ConnError { raddr, err: DataportError::WorkerKilled })
                    .await;
                return;
            }
        };
        let payload = match frame {
            Err(_) => {
                tracing::error!(prefix = %prefix, raddr = %raddr, "read deadline expired");
                let _ = reqch
                    .send(ServerCommand::ConnError { raddr, err: DataportError::ReadTimeout })
                    .await;
                return;
            }
            Ok(None) => {
                tracing::error!(prefix = %prefix, raddr = %raddr, "remote closed");
                let err = DataportError::Io(io::ErrorKind::UnexpectedEof.into());
                let _ = reqch.send(ServerCommand::ConnError { raddr, err }).await;
                return;
            }
            Ok(Some(Err(err))) => {
                let err = if err.kind() == io::ErrorKind::InvalidData {
                    DataportError::Payload
                } else {
                    DataportError::Io(err)
                };
                tracing::error!(prefix = %prefix, raddr = %raddr, error = %err, "worker exited");
                let _ = reqch.send(ServerCommand::ConnError { raddr, err }).await;
                return;
            }
            Ok(Some(Ok(payload))) => payload,
        };

        match payload {
            DataportPayload::VbMap(vbmap) => {
                // Fresh reader takes over once the actor has folded the map.
                tracing::info!(prefix = %prefix, raddr = %raddr, "worker exiting with vbmap");
                let _ = reqch
                    .send(ServerCommand::Vbmap { raddr, vbmap, link })
                    .await;
                return;
            }
            DataportPayload::Batch(vbs) => {
                let mut mutations = 0u64;
                for vb in &vbs {
                    for kv in &vb.kvs {
                        mutations += 1;
                        if kv.starts_stream() {
                            started.push(BucketVb {
                                bucket: vb.bucket.clone(),
                                vbno: vb.vbucket,
                            });
                        } else if kv.ends_stream() {
                            finished.push(BucketVb {
                                bucket: vb.bucket.clone(),
                                vbno: vb.vbucket,
                            });
                        }
                    }
                }
                // A slow application blocks this reader, never the actor.
                tokio::select! {
                    sent = mutch.send(vbs) => {
                        if sent.is_err() {
                            let err = DataportError::Io(io::Error::other("mutation channel closed"));
                            let _ = reqch.send(ServerCommand::ConnError { raddr, err }).await;
                            return;
                        }
                        stats.record_batch(mutations);
                    }
                    _ = kill.recv() => {
                        tracing::error!(prefix = %prefix, raddr = %raddr, "worker killed");
                        let _ = reqch
                            .send(ServerCommand::ConnError { raddr, err: DataportError::WorkerKilled })
                            .await;
                        return;
                    }
                }
                if !started.is_empty() || !finished.is_empty() {
                    tracing::info!(
                        prefix = %prefix,
                        raddr = %raddr,
                        started = started.len(),
                        finished = finished.len(),
                        "worker exiting with vb control"
                    );
                    let _ = reqch
                        .send(ServerCommand::VbControl {
                            raddr,
                            started,
                            finished,
                            link,
                        })
                        .await;
                    return;
                }
            }
        }
    }
}

fn host_of(raddr: &str) -> Option<&str> {
    raddr.rsplit_once(':').map(|(host, _)| host)
}

/// Group vbuckets by bucket, preserving first-seen bucket order.
fn group_by_bucket(uuids: Vec<BucketVb>) -> Vec<RestartVbuckets> {
    let mut groups: Vec<RestartVbuckets> = Vec::new();
    for uuid in uuids {
        match groups.iter_mut().find(|group| group.bucket == uuid.bucket) {
            Some(group) => group.vbuckets.push(uuid.vbno),
            None => groups.push(RestartVbuckets {
                bucket: uuid.bucket,
                vbuckets: vec![uuid.vbno],
            }),
        }
    }
    groups
}

fn vbuckets_for_remotes(remotes: &HashMap<String, Vec<BucketVb>>) -> Vec<RestartVbuckets> {
    let mut all = Vec::new();
    for uuids in remotes.values() {
        all.extend(uuids.iter().cloned());
    }
    group_by_bucket(all)
}
