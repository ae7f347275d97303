//! Index definitions and placement topology documents.
//!
//! A bucket's topology is an ordered set of definitions; each definition
//! carries instances, each instance partitions, each partition slices with a
//! host. The document version is bumped on every mutation. The global
//! topology lists the buckets that have a topology document.

use serde::{Deserialize, Serialize};

/// A secondary-index definition. `defn_id` is globally unique and stable;
/// the name is unique within its bucket.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefn {
    pub defn_id: u64,
    pub name: String,
    pub bucket: String,
    pub using: String,
    pub expr_type: String,
    pub partition_expr: String,
    pub where_expr: String,
    pub secondary_exprs: Vec<String>,
    pub is_primary: bool,
}

/// Lifecycle of an index instance. Transitions are monotone: an instance
/// moves to `Deleted` and never back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexState {
    Created,
    Deleted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceRef {
    pub slice_id: u64,
    pub host: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRef {
    pub partn_id: u64,
    pub slices: Vec<SliceRef>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRef {
    pub inst_id: u64,
    pub state: IndexState,
    pub partitions: Vec<PartitionRef>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefnRef {
    pub defn_id: u64,
    pub name: String,
    pub instances: Vec<InstanceRef>,
}

/// Per-bucket placement document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexTopology {
    pub bucket: String,
    pub version: u64,
    pub definitions: Vec<DefnRef>,
}

impl IndexTopology {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            version: 0,
            definitions: Vec::new(),
        }
    }

    /// Append a fresh single-partition, single-slice instance for `defn` on
    /// `host` in `Created` state.
    pub fn add_definition(&mut self, defn: &IndexDefn, inst_id: u64, host: &str) {
        self.definitions.push(DefnRef {
            defn_id: defn.defn_id,
            name: defn.name.clone(),
            instances: vec![InstanceRef {
                inst_id,
                state: IndexState::Created,
                partitions: vec![PartitionRef {
                    partn_id: 0,
                    slices: vec![SliceRef {
                        slice_id: 0,
                        host: host.to_string(),
                    }],
                }],
            }],
        });
        self.version += 1;
    }

    pub fn find_definition(&self, name: &str) -> Option<&DefnRef> {
        self.definitions.iter().find(|defn| defn.name == name)
    }

    /// Mark every instance of `defn_id` with `state`. Returns whether
    /// anything changed; the version is bumped only then.
    pub fn set_instance_state_by_defn(&mut self, defn_id: u64, state: IndexState) -> bool {
        let mut changed = false;
        for defn in &mut self.definitions {
            if defn.defn_id != defn_id {
                continue;
            }
            for inst in &mut defn.instances {
                if inst.state != state {
                    inst.state = state;
                    changed = true;
                }
            }
        }
        if changed {
            self.version += 1;
        }
        changed
    }

    /// Every slice host in the document, repeated once per slice.
    pub fn slice_hosts(&self) -> impl Iterator<Item = &str> {
        self.definitions
            .iter()
            .flat_map(|defn| &defn.instances)
            .flat_map(|inst| &inst.partitions)
            .flat_map(|partn| &partn.slices)
            .map(|slice| slice.host.as_str())
    }
}

/// Keys of every bucket that has a topology document. Deleting the last
/// index of a bucket leaves its key behind; a dangling key is diagnosable,
/// a missing bucket topology is not.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalTopology {
    pub keys: Vec<String>,
}

impl GlobalTopology {
    /// Returns true when the key was added.
    pub fn add_key_if_missing(&mut self, key: &str) -> bool {
        if self.keys.iter().any(|existing| existing == key) {
            return false;
        }
        self.keys.push(key.to_string());
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.iter().any(|existing| existing == key)
    }
}

pub fn topology_key(bucket: &str) -> String {
    format!("topology/{bucket}")
}

pub fn bucket_from_topology_key(key: &str) -> &str {
    key.strip_prefix("topology/").unwrap_or(key)
}

/// `bucket/name` request key for definition operations.
pub fn index_defn_key(bucket: &str, name: &str) -> String {
    format!("{bucket}/{name}")
}

pub fn parse_index_defn_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('/')
}
