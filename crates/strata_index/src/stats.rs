//! Admin and dataport statistics counters.
//!
//! Counters are plain atomics; snapshots clone into serializable documents
//! served on the admin stats path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;

/// `(requests_in, responses_out, errors)` for one request path.
#[derive(Default)]
pub struct PathCounters {
    requests_in: AtomicU64,
    responses_out: AtomicU64,
    errors: AtomicU64,
}

impl PathCounters {
    pub fn incr_request(&self) {
        self.requests_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_response(&self) {
        self.responses_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> [u64; 3] {
        [
            self.requests_in.load(Ordering::Relaxed),
            self.responses_out.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        ]
    }
}

/// Statistics document for one admin server.
pub struct AdminStats {
    url_prefix: String,
    paths: RwLock<HashMap<String, Arc<PathCounters>>>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

/// JSON shape served on the stats path.
#[derive(Serialize)]
pub struct AdminStatsSnapshot {
    pub url_prefix: String,
    /// `[bytes_in, bytes_out]` across all request paths.
    pub payload: [u64; 2],
    pub requests: HashMap<String, [u64; 3]>,
}

impl AdminStats {
    pub fn new(url_prefix: &str) -> Self {
        Self {
            url_prefix: url_prefix.to_string(),
            paths: RwLock::new(HashMap::new()),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    /// Counters for one request name, created on first touch so registered
    /// messages show up in the snapshot even before traffic arrives.
    pub fn path(&self, name: &str) -> Arc<PathCounters> {
        if let Some(counters) = self.paths.read().unwrap().get(name) {
            return counters.clone();
        }
        self.paths
            .write()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AdminStatsSnapshot {
        let requests = self
            .paths
            .read()
            .unwrap()
            .iter()
            .map(|(name, counters)| (name.clone(), counters.snapshot()))
            .collect();
        AdminStatsSnapshot {
            url_prefix: self.url_prefix.clone(),
            payload: [
                self.bytes_in.load(Ordering::Relaxed),
                self.bytes_out.load(Ordering::Relaxed),
            ],
            requests,
        }
    }
}

/// Dataport ingest counters.
#[derive(Default)]
pub struct DataportStats {
    batches_in: AtomicU64,
    mutations_in: AtomicU64,
    connections_active: AtomicU64,
}

/// Point-in-time dataport counter values.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct DataportStatsSnapshot {
    pub batches_in: u64,
    pub mutations_in: u64,
    pub connections_active: u64,
}

impl DataportStats {
    pub fn record_batch(&self, mutations: u64) {
        self.batches_in.fetch_add(1, Ordering::Relaxed);
        self.mutations_in.fetch_add(mutations, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DataportStatsSnapshot {
        DataportStatsSnapshot {
            batches_in: self.batches_in.load(Ordering::Relaxed),
            mutations_in: self.mutations_in.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_snapshot_reflects_counters() {
        let stats = AdminStats::new("/adminport/");
        let path = stats.path("request.createIndex");
        path.incr_request();
        path.incr_request();
        path.incr_response();
        stats.add_bytes_in(100);
        stats.add_bytes_out(40);

        let snap = stats.snapshot();
        assert_eq!(snap.url_prefix, "/adminport/");
        assert_eq!(snap.payload, [100, 40]);
        assert_eq!(snap.requests["request.createIndex"], [2, 1, 0]);
    }
}
