// Index-node binary entry point.
//
// Wires together the metadata repository, the replicated coordinator, the
// dataport mutation daemon, the admin HTTP port, and the compaction
// scheduler. It also hosts the application side of the admin request queue.

use std::io::IsTerminal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use strata_index::adminport::{AdminRequest, AdminServer, JsonBody, JsonMarshaller, NamedMessage};
use strata_index::compaction::{
    self, CompactionSink, ConfigHolder, IndexStorageStats, StorageStatsSource,
};
use strata_index::config::{parse_peer, NodeArgs, Settings};
use strata_index::coordinator::{
    Coordinator, CoordinatorConfig, StreamTimestamp, TimestampSink, OP_ADD_INDEX_DEFN,
    OP_DEL_INDEX_DEFN, OP_NOTIFY_TIMESTAMP,
};
use strata_index::dataport;
use strata_index::repo::MetadataRepo;
use strata_index::topology::{index_defn_key, IndexDefn};

#[derive(Parser)]
#[command(name = "strata-index-node", about = "Secondary-index node daemon")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an index node.
    Node(NodeArgs),
}

/// Admin message: create an index definition.
#[derive(Debug, Serialize, Deserialize)]
struct CreateIndexRequest {
    defn: IndexDefn,
}

impl NamedMessage for CreateIndexRequest {
    const NAME: &'static str = "createIndex";
}

/// Admin message: drop an index by bucket and name.
#[derive(Debug, Serialize, Deserialize)]
struct DropIndexRequest {
    bucket: String,
    name: String,
}

impl NamedMessage for DropIndexRequest {
    const NAME: &'static str = "dropIndex";
}

/// Admin message: broadcast a stream timestamp to the ensemble.
#[derive(Debug, Serialize, Deserialize)]
struct NotifyTimestampRequest {
    ts: StreamTimestamp,
}

impl NamedMessage for NotifyTimestampRequest {
    const NAME: &'static str = "notifyTimestamp";
}

/// Generic admin reply; an empty error means success.
#[derive(Debug, Serialize, Deserialize)]
struct IndexResponse {
    error: String,
}

impl NamedMessage for IndexResponse {
    const NAME: &'static str = "indexResponse";
}

/// Committed timestamps land here; the local index manager consumes them.
struct LoggingTimestampSink;

impl TimestampSink for LoggingTimestampSink {
    fn notify_new_timestamp(&self, ts: StreamTimestamp) {
        tracing::info!(bucket = %ts.bucket, vbnos = ts.vbnos.len(), "timestamp committed");
    }
}

/// Storage stats derived from the metadata keyspace footprint, one entry per
/// definition. Real slice-level sizes come from the storage engine hosting
/// the index data, which sits behind this trait in production.
struct MetaStoreStats {
    repo: Arc<MetadataRepo>,
}

#[async_trait]
impl StorageStatsSource for MetaStoreStats {
    async fn storage_stats(&self) -> Vec<IndexStorageStats> {
        let defns = match self.repo.list_indexes() {
            Ok(defns) => defns,
            Err(err) => {
                tracing::error!(error = ?err, "listing definitions for compaction failed");
                return Vec::new();
            }
        };
        let footprint = self.repo.disk_space();
        defns
            .into_iter()
            .map(|defn| IndexStorageStats {
                inst_id: defn.defn_id,
                bucket: defn.bucket,
                name: defn.name,
                disk_size: footprint,
                data_size: footprint,
            })
            .collect()
    }
}

/// Durability-only sink for the metadata keyspace. fjall reclaims segment
/// space in its own background merges, so this sink cannot shrink
/// `disk_size` or fragmentation; the storage engine hosting the index data
/// supplies a real compactor through `CompactionSink`.
struct MetaStoreCompactor {
    repo: Arc<MetadataRepo>,
}

#[async_trait]
impl CompactionSink for MetaStoreCompactor {
    async fn compact(&self, inst_id: u64) -> anyhow::Result<()> {
        tracing::info!(inst_id, "compaction window reached; flushing metadata keyspace");
        self.repo.flush()?;
        Ok(())
    }
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hyper=warn".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Node(args) => run_node(args).await,
    }
}

async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    let settings = Settings::load(args.settings.as_deref())?;
    std::fs::create_dir_all(&args.data_dir).context("create data dir")?;
    let repo = Arc::new(MetadataRepo::open(args.data_dir.join("meta"))?);

    // Coordinator.
    let peers = args
        .peers
        .iter()
        .map(|spec| parse_peer(spec))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let coord_cfg = CoordinatorConfig {
        host_elect: args.elect_addr.clone(),
        host_peer: args.peer_addr.clone(),
        peers_elect: peers.iter().map(|peer| peer.elect.clone()).collect(),
        peer_tcp: peers
            .iter()
            .map(|peer| (peer.elect.clone(), peer.tcp.clone()))
            .collect(),
        index_host: args.index_host.clone(),
        peer_index_hosts: peers.iter().map(|peer| peer.index_host.clone()).collect(),
        protocol: Default::default(),
    };
    let coordinator = Coordinator::new(repo.clone(), Arc::new(LoggingTimestampSink), coord_cfg)?;
    let coordinator_task = tokio::spawn(coordinator.clone().run());

    // Dataport; the mutation and sideband channels belong to the application.
    let (mutch_tx, mut mutch_rx) = mpsc::channel(1024);
    let (sbch_tx, mut sbch_rx) = mpsc::unbounded_channel();
    let dataport =
        dataport::Server::new(&args.listen_dataport, settings.dataport_config(), mutch_tx, sbch_tx)
            .await?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                batch = mutch_rx.recv() => {
                    let Some(batch) = batch else { return };
                    for vb in &batch {
                        tracing::debug!(bucket = %vb.bucket, vbucket = vb.vbucket, kvs = vb.kvs.len(), "mutations");
                    }
                }
                event = sbch_rx.recv() => {
                    let Some(event) = event else { return };
                    tracing::info!(?event, "sideband event");
                }
            }
        }
    });

    // Admin port.
    let (reqch_tx, mut reqch_rx) = mpsc::channel(64);
    let mut admin = AdminServer::new(
        "indexer",
        &args.listen_adminport,
        &args.url_prefix,
        reqch_tx,
        settings.adminport_read_timeout(),
        settings.adminport_write_timeout(),
    );
    admin.register(Arc::new(JsonMarshaller::<CreateIndexRequest>::default()))?;
    admin.register(Arc::new(JsonMarshaller::<DropIndexRequest>::default()))?;
    admin.register(Arc::new(JsonMarshaller::<NotifyTimestampRequest>::default()))?;
    admin.start().await?;

    let admin_coordinator = coordinator.clone();
    tokio::spawn(async move {
        let next_req_id = AtomicU64::new(1);
        while let Some(req) = reqch_rx.recv().await {
            handle_admin_request(req, &admin_coordinator, &next_req_id).await;
        }
    });

    // Compaction scheduler.
    let holder = Arc::new(ConfigHolder::new(settings.compaction.clone()));
    let (compaction_kill_tx, compaction_kill_rx) = watch::channel(false);
    let compaction_task = compaction::spawn(
        Arc::new(MetaStoreStats { repo: repo.clone() }),
        Arc::new(MetaStoreCompactor { repo: repo.clone() }),
        holder,
        compaction_kill_rx,
    );

    tracing::info!(
        dataport = %dataport.local_addr(),
        adminport = ?admin.local_addr(),
        cluster = %settings.cluster_addr,
        "index node running"
    );
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;

    tracing::info!("shutting down");
    coordinator.terminate();
    dataport.close().await?;
    admin.stop();
    let _ = compaction_kill_tx.send(true);
    let _ = compaction_task.await;
    let _ = coordinator_task.await;
    Ok(())
}

async fn handle_admin_request(
    req: AdminRequest,
    coordinator: &Arc<Coordinator>,
    next_req_id: &AtomicU64,
) {
    let id = next_req_id.fetch_add(1, Ordering::SeqCst);
    let any = req.message().as_any();

    if let Some(body) = any.downcast_ref::<JsonBody<CreateIndexRequest>>() {
        let defn = &body.0.defn;
        let key = index_defn_key(&defn.bucket, &defn.name);
        let content = match serde_json::to_vec(defn) {
            Ok(content) => content,
            Err(err) => return req.send_error(err.to_string()),
        };
        let outcome = coordinator
            .new_request(id, OP_ADD_INDEX_DEFN, &key, content)
            .await;
        respond(req, outcome);
    } else if let Some(body) = any.downcast_ref::<JsonBody<DropIndexRequest>>() {
        let key = index_defn_key(&body.0.bucket, &body.0.name);
        let outcome = coordinator
            .new_request(id, OP_DEL_INDEX_DEFN, &key, Vec::new())
            .await;
        respond(req, outcome);
    } else if let Some(body) = any.downcast_ref::<JsonBody<NotifyTimestampRequest>>() {
        let content = match serde_json::to_vec(&body.0.ts) {
            Ok(content) => content,
            Err(err) => return req.send_error(err.to_string()),
        };
        let outcome = coordinator
            .new_request(id, OP_NOTIFY_TIMESTAMP, &body.0.ts.bucket, content)
            .await;
        respond(req, outcome);
    } else {
        let name = req.message().name();
        req.send_error(format!("unhandled admin message {name}"));
    }
}

fn respond(req: AdminRequest, outcome: anyhow::Result<()>) {
    match outcome {
        Ok(()) => req.send(Box::new(JsonBody(IndexResponse {
            error: String::new(),
        }))),
        Err(err) => req.send_error(err.to_string()),
    }
}
