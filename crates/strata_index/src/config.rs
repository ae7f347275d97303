//! Node CLI and runtime settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::compaction::CompactionSettings;
use crate::dataport::DataportConfig;

/// Settings document, loadable from a JSON file and hot fields re-appliable
/// at runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(rename = "clusterAddr")]
    pub cluster_addr: String,
    /// Milliseconds allowed for reading one admin request body.
    #[serde(rename = "AdminportReadTimeout")]
    pub adminport_read_timeout: u64,
    /// Milliseconds allowed for the application to answer an admin request.
    #[serde(rename = "AdminportWriteTimeout")]
    pub adminport_write_timeout: u64,
    /// Milliseconds allowed per read on a dataport connection.
    #[serde(rename = "DataportReadDeadline")]
    pub dataport_read_deadline: u64,
    /// Largest accepted dataport payload, in bytes.
    #[serde(rename = "MaxDataportPayload")]
    pub max_dataport_payload: usize,
    pub compaction: CompactionSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cluster_addr: "localhost:9000".to_string(),
            adminport_read_timeout: 10_000,
            adminport_write_timeout: 30_000,
            dataport_read_deadline: 30_000,
            max_dataport_payload: 1 << 20,
            compaction: CompactionSettings::default(),
        }
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read(path)
            .with_context(|| format!("read settings file {}", path.display()))?;
        serde_json::from_slice(&raw).context("parse settings file")
    }

    pub fn adminport_read_timeout(&self) -> Duration {
        Duration::from_millis(self.adminport_read_timeout)
    }

    pub fn adminport_write_timeout(&self) -> Duration {
        Duration::from_millis(self.adminport_write_timeout)
    }

    pub fn dataport_config(&self) -> DataportConfig {
        DataportConfig {
            read_deadline: Duration::from_millis(self.dataport_read_deadline),
            max_payload: self.max_dataport_payload,
            ..DataportConfig::default()
        }
    }
}

/// One coordinator peer: `elect_udp,peer_tcp,index_host`.
#[derive(Clone, Debug)]
pub struct PeerSpec {
    pub elect: String,
    pub tcp: String,
    pub index_host: String,
}

pub fn parse_peer(spec: &str) -> anyhow::Result<PeerSpec> {
    let mut parts = spec.split(',');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(elect), Some(tcp), Some(index_host), None) => Ok(PeerSpec {
            elect: elect.trim().to_string(),
            tcp: tcp.trim().to_string(),
            index_host: index_host.trim().to_string(),
        }),
        _ => anyhow::bail!("peer spec {spec:?} is not `elect_udp,peer_tcp,index_host`"),
    }
}

/// Arguments for the index-node runtime.
#[derive(Clone, Debug, Parser)]
pub struct NodeArgs {
    /// Dataport listen address for upstream routers.
    #[arg(long, default_value = "127.0.0.1:9011")]
    pub listen_dataport: String,

    /// Admin HTTP listen address.
    #[arg(long, default_value = "127.0.0.1:9010")]
    pub listen_adminport: String,

    /// URL prefix for admin messages.
    #[arg(long, default_value = "/adminport/")]
    pub url_prefix: String,

    /// Local election (UDP) address.
    #[arg(long, default_value = "127.0.0.1:9012")]
    pub elect_addr: String,

    /// Local coordinator peer (TCP) address.
    #[arg(long, default_value = "127.0.0.1:9013")]
    pub peer_addr: String,

    /// Coordinator peer as `elect_udp,peer_tcp,index_host`; repeatable.
    #[arg(long = "peer")]
    pub peers: Vec<String>,

    /// Host name advertised for index placement.
    #[arg(long, default_value = "localhost")]
    pub index_host: String,

    /// Metadata repository directory.
    #[arg(long, default_value = "./strata-data")]
    pub data_dir: PathBuf,

    /// Optional settings file (JSON).
    #[arg(long)]
    pub settings: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_keys_match_documented_names() {
        let raw = serde_json::json!({
            "clusterAddr": "10.1.1.1:9000",
            "AdminportReadTimeout": 5_000,
            "DataportReadDeadline": 1_000,
            "compaction": { "compaction_mode": "full", "min_frag": 50 }
        });
        let settings: Settings = serde_json::from_value(raw).unwrap();
        assert_eq!(settings.cluster_addr, "10.1.1.1:9000");
        assert_eq!(settings.adminport_read_timeout, 5_000);
        // Unset keys keep their defaults.
        assert_eq!(settings.adminport_write_timeout, 30_000);
        assert_eq!(settings.compaction.min_frag, 50);
        assert_eq!(settings.dataport_config().read_deadline.as_millis(), 1_000);
    }

    #[test]
    fn peer_spec_parsing() {
        let peer = parse_peer("10.0.0.2:9012, 10.0.0.2:9013, node-b").unwrap();
        assert_eq!(peer.elect, "10.0.0.2:9012");
        assert_eq!(peer.tcp, "10.0.0.2:9013");
        assert_eq!(peer.index_host, "node-b");
        assert!(parse_peer("only-one-part").is_err());
    }
}
