//! Metadata repository.
//!
//! Persists index definitions, per-bucket topology documents, the global
//! topology, and the coordinator's config values (epochs, txnids) in a fjall
//! keyspace. Every write is persisted before returning; reads after writes
//! observe the write.

use std::path::Path;
use std::sync::Mutex;

use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::error::RepoError;
use crate::topology::{GlobalTopology, IndexDefn, IndexTopology};

const GLOBAL_TOPOLOGY_KEY: &str = "global";
const NEXT_INST_ID_KEY: &str = "next_inst_id";
const ACCEPTED_EPOCH_KEY: &str = "accepted_epoch";
const CURRENT_EPOCH_KEY: &str = "current_epoch";
const LAST_LOGGED_TXNID_KEY: &str = "last_logged_txnid";
const LAST_COMMITTED_TXNID_KEY: &str = "last_committed_txnid";

pub struct MetadataRepo {
    keyspace: Keyspace,
    defns: PartitionHandle,
    topology: PartitionHandle,
    meta: PartitionHandle,
    // Counter reads and bumps must not interleave.
    inst_id_lock: Mutex<()>,
}

impl MetadataRepo {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RepoError> {
        let keyspace = fjall::Config::new(path).open()?;
        let defns = keyspace.open_partition("defns", PartitionCreateOptions::default())?;
        let topology = keyspace.open_partition("topology", PartitionCreateOptions::default())?;
        let meta = keyspace.open_partition("meta", PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            defns,
            topology,
            meta,
            inst_id_lock: Mutex::new(()),
        })
    }

    fn sync(&self) -> Result<(), RepoError> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    fn defn_key(bucket: &str, name: &str) -> String {
        format!("defn/{bucket}/{name}")
    }

    pub fn create_index(&self, defn: &IndexDefn) -> Result<(), RepoError> {
        let key = Self::defn_key(&defn.bucket, &defn.name);
        if self.defns.get(&key)?.is_some() {
            return Err(RepoError::Exists);
        }
        self.defns.insert(&key, serde_json::to_vec(defn)?)?;
        self.sync()
    }

    pub fn get_index(&self, bucket: &str, name: &str) -> Result<IndexDefn, RepoError> {
        let raw = self
            .defns
            .get(Self::defn_key(bucket, name))?
            .ok_or(RepoError::NotFound)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn drop_index_by_name(&self, bucket: &str, name: &str) -> Result<(), RepoError> {
        let key = Self::defn_key(bucket, name);
        if self.defns.get(&key)?.is_none() {
            return Err(RepoError::NotFound);
        }
        self.defns.remove(&key)?;
        self.sync()
    }

    pub fn list_indexes(&self) -> Result<Vec<IndexDefn>, RepoError> {
        let mut defns = Vec::new();
        for item in self.defns.prefix("defn/") {
            let (_, raw) = item?;
            defns.push(serde_json::from_slice(&raw)?);
        }
        Ok(defns)
    }

    pub fn get_topology(&self, bucket: &str) -> Result<IndexTopology, RepoError> {
        let raw = self
            .topology
            .get(crate::topology::topology_key(bucket))?
            .ok_or(RepoError::NotFound)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn set_topology(&self, bucket: &str, topology: &IndexTopology) -> Result<(), RepoError> {
        self.topology.insert(
            crate::topology::topology_key(bucket),
            serde_json::to_vec(topology)?,
        )?;
        self.sync()
    }

    pub fn get_global_topology(&self) -> Result<GlobalTopology, RepoError> {
        let raw = self
            .topology
            .get(GLOBAL_TOPOLOGY_KEY)?
            .ok_or(RepoError::NotFound)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn set_global_topology(&self, global: &GlobalTopology) -> Result<(), RepoError> {
        self.topology
            .insert(GLOBAL_TOPOLOGY_KEY, serde_json::to_vec(global)?)?;
        self.sync()
    }

    /// Allocate the next stable index-instance id.
    pub fn next_index_inst_id(&self) -> Result<u64, RepoError> {
        let _guard = self.inst_id_lock.lock().unwrap();
        let next = self.get_u64(&self.meta, NEXT_INST_ID_KEY)?.unwrap_or(0) + 1;
        self.meta.insert(NEXT_INST_ID_KEY, next.to_be_bytes())?;
        self.sync()?;
        Ok(next)
    }

    pub fn get_accepted_epoch(&self) -> Result<u32, RepoError> {
        Ok(self.get_u64(&self.meta, ACCEPTED_EPOCH_KEY)?.unwrap_or(0) as u32)
    }

    pub fn set_accepted_epoch(&self, epoch: u32) -> Result<(), RepoError> {
        self.meta
            .insert(ACCEPTED_EPOCH_KEY, (epoch as u64).to_be_bytes())?;
        self.sync()
    }

    pub fn get_current_epoch(&self) -> Result<u32, RepoError> {
        Ok(self.get_u64(&self.meta, CURRENT_EPOCH_KEY)?.unwrap_or(0) as u32)
    }

    pub fn set_current_epoch(&self, epoch: u32) -> Result<(), RepoError> {
        self.meta
            .insert(CURRENT_EPOCH_KEY, (epoch as u64).to_be_bytes())?;
        self.sync()
    }

    pub fn get_last_logged_txnid(&self) -> Result<u64, RepoError> {
        Ok(self
            .get_u64(&self.meta, LAST_LOGGED_TXNID_KEY)?
            .unwrap_or(0))
    }

    pub fn set_last_logged_txnid(&self, txnid: u64) -> Result<(), RepoError> {
        self.meta
            .insert(LAST_LOGGED_TXNID_KEY, txnid.to_be_bytes())?;
        self.sync()
    }

    pub fn get_last_committed_txnid(&self) -> Result<u64, RepoError> {
        Ok(self
            .get_u64(&self.meta, LAST_COMMITTED_TXNID_KEY)?
            .unwrap_or(0))
    }

    pub fn set_last_committed_txnid(&self, txnid: u64) -> Result<(), RepoError> {
        self.meta
            .insert(LAST_COMMITTED_TXNID_KEY, txnid.to_be_bytes())?;
        self.sync()
    }

    /// On-disk footprint of the whole metadata keyspace.
    pub fn disk_space(&self) -> u64 {
        self.keyspace.disk_space()
    }

    /// Force the keyspace durable. This is not a space-reclaim operation:
    /// fjall merges segments in its own background compactions and exposes
    /// no manual reclaim for this workload.
    pub fn flush(&self) -> Result<(), RepoError> {
        self.sync()
    }

    fn get_u64(&self, partition: &PartitionHandle, key: &str) -> Result<Option<u64>, RepoError> {
        let Some(raw) = partition.get(key)? else {
            return Ok(None);
        };
        let mut buf = [0u8; 8];
        if raw.len() != 8 {
            return Err(RepoError::NotFound);
        }
        buf.copy_from_slice(&raw);
        Ok(Some(u64::from_be_bytes(buf)))
    }
}
