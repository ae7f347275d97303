//! Monotone transaction-id allocation.

use std::sync::atomic::{AtomicU64, Ordering};

use super::types::{Txnid, EPOCH_SHIFT};

/// Allocates monotone transaction ids for the leader.
///
/// The allocator is seeded with the last logged txnid at bootstrap so ids
/// never regress across restarts. Bumping the epoch rebases the counter: the
/// next id is `(epoch << 32) | 1`, which is strictly greater than every id of
/// any older epoch.
pub struct TxnState {
    last: AtomicU64,
}

impl TxnState {
    pub fn new(last_logged: Txnid) -> Self {
        Self {
            last: AtomicU64::new(last_logged.0),
        }
    }

    pub fn next(&self) -> Txnid {
        Txnid(self.last.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn last(&self) -> Txnid {
        Txnid(self.last.load(Ordering::SeqCst))
    }

    /// Rebase allocation onto `epoch`. Ids already handed out keep their old
    /// epoch; smaller epochs are ignored so the sequence stays monotone.
    pub fn set_epoch(&self, epoch: u32) {
        let floor = (epoch as u64) << EPOCH_SHIFT;
        let _ = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                (cur < floor).then_some(floor)
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_is_strictly_increasing() {
        let txn = TxnState::new(Txnid::new(2, 7));
        let a = txn.next();
        let b = txn.next();
        assert_eq!(a, Txnid::new(2, 8));
        assert!(b > a);
    }

    #[test]
    fn epoch_rebase_is_monotone() {
        let txn = TxnState::new(Txnid::new(5, 100));
        txn.set_epoch(4); // stale, ignored
        assert_eq!(txn.next(), Txnid::new(5, 101));
        txn.set_epoch(6);
        let id = txn.next();
        assert_eq!(id, Txnid::new(6, 1));
        assert!(id > Txnid::new(5, u32::MAX - 1));
    }
}
