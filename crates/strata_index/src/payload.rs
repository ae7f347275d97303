//! Dataport payload model.
//!
//! Upstream routers speak two payload shapes: a `VbConnectionMap` announcing
//! the vbuckets a connection will carry, and batches of `VbKeyVersions`
//! carrying the mutations themselves. `StreamBegin`/`StreamEnd` are
//! single-command key-versions that delimit a vbucket's lifetime on a
//! connection.

use serde::{Deserialize, Serialize};

pub const CMD_STREAM_BEGIN: u32 = 1;
pub const CMD_STREAM_END: u32 = 2;
pub const CMD_UPSERT: u32 = 3;
pub const CMD_DELETION: u32 = 4;
pub const CMD_SYNC: u32 = 5;

/// First frame on every dataport connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VbConnectionMap {
    pub bucket: String,
    pub vbuckets: Vec<u16>,
}

/// Mutations for one document, ordered by command.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVersions {
    pub seqno: u64,
    #[serde(default)]
    pub docid: Vec<u8>,
    pub commands: Vec<u32>,
    #[serde(default)]
    pub keys: Vec<Vec<u8>>,
}

impl KeyVersions {
    pub fn new(seqno: u64, commands: Vec<u32>) -> Self {
        Self {
            seqno,
            commands,
            ..Self::default()
        }
    }

    /// The stream-lifecycle commands only count in leading position.
    pub fn starts_stream(&self) -> bool {
        self.commands.first() == Some(&CMD_STREAM_BEGIN)
    }

    pub fn ends_stream(&self) -> bool {
        self.commands.first() == Some(&CMD_STREAM_END)
    }
}

/// A batch of key-versions for a single vbucket.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VbKeyVersions {
    pub bucket: String,
    pub vbucket: u16,
    #[serde(default)]
    pub vbuuid: u64,
    pub kvs: Vec<KeyVersions>,
}

/// Everything a dataport frame can decode into.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataportPayload {
    VbMap(VbConnectionMap),
    Batch(Vec<VbKeyVersions>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_commands_count_only_in_leading_position() {
        let begin = KeyVersions::new(1, vec![CMD_STREAM_BEGIN]);
        assert!(begin.starts_stream());
        assert!(!begin.ends_stream());

        let upsert_then_end = KeyVersions::new(2, vec![CMD_UPSERT, CMD_STREAM_END]);
        assert!(!upsert_then_end.ends_stream());
    }
}
