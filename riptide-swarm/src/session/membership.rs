//! Connection membership: the pending and established views of a session
//!
//! An address lives in at most one view at a time. Every transition is a
//! single critical section over both views, so concurrent callers can never
//! both believe they own the same peer.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::exchange::PeerAddress;
use crate::torrent::Bitfield;

/// Negotiated state of one established peer link.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionRecord {
    pub address: PeerAddress,
    /// Remote set the extension bit in its handshake
    pub supports_extensions: bool,
    /// Id the remote accepts `ut_metadata` messages under
    pub remote_metadata_id: Option<u8>,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub remote_bitfield: Bitfield,
    /// Blocks currently requested from this peer
    pub outstanding_requests: usize,
}

impl ConnectionRecord {
    /// Record for a freshly handshaken peer: we choke it and are not interested.
    pub fn new(address: PeerAddress, supports_extensions: bool) -> Self {
        Self {
            address,
            supports_extensions,
            remote_metadata_id: None,
            am_choking: true,
            am_interested: false,
            peer_choking: false,
            peer_interested: false,
            remote_bitfield: Bitfield::default(),
            outstanding_requests: 0,
        }
    }
}

#[derive(Default)]
struct Views {
    pending: HashSet<PeerAddress>,
    established: HashMap<PeerAddress, ConnectionRecord>,
}

/// Pending and established connection views guarded together.
#[derive(Default)]
pub struct ConnectionRegistry {
    views: Mutex<Views>,
}

impl ConnectionRegistry {
    /// Creates empty views.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `address` for a new connection.
    ///
    /// Returns false when the address is already pending or established;
    /// the caller must then abandon its attempt.
    pub fn add_pending(&self, address: PeerAddress) -> bool {
        let mut views = self.views.lock();
        if views.established.contains_key(&address) {
            return false;
        }
        views.pending.insert(address)
    }

    /// Moves a pending address to the established view.
    ///
    /// Returns false when the address was no longer pending, in which case
    /// nothing is inserted.
    pub fn promote_to_established(&self, address: PeerAddress, record: ConnectionRecord) -> bool {
        let mut views = self.views.lock();
        if !views.pending.remove(&address) {
            return false;
        }
        views.established.insert(address, record);
        true
    }

    /// Applies `update` to an established record.
    pub fn update(&self, address: &PeerAddress, update: impl FnOnce(&mut ConnectionRecord)) {
        if let Some(record) = self.views.lock().established.get_mut(address) {
            update(record);
        }
    }

    /// Removes an address from the established view once its conversation ended.
    pub fn remove_finished(&self, address: &PeerAddress) -> Option<ConnectionRecord> {
        self.views.lock().established.remove(address)
    }

    /// Removes an address from both views. Idempotent.
    ///
    /// Returns true when anything was removed.
    pub fn remove_closed(&self, address: &PeerAddress) -> bool {
        let mut views = self.views.lock();
        let was_pending = views.pending.remove(address);
        let was_established = views.established.remove(address).is_some();
        was_pending || was_established
    }

    /// True when `address` is waiting for its handshake.
    pub fn is_pending(&self, address: &PeerAddress) -> bool {
        self.views.lock().pending.contains(address)
    }

    /// True when `address` has an established record.
    pub fn is_established(&self, address: &PeerAddress) -> bool {
        self.views.lock().established.contains_key(address)
    }

    /// Sizes of the pending and established views.
    pub fn counts(&self) -> (usize, usize) {
        let views = self.views.lock();
        (views.pending.len(), views.established.len())
    }

    /// True when no connection is pending or established.
    pub fn is_idle(&self) -> bool {
        let views = self.views.lock();
        views.pending.is_empty() && views.established.is_empty()
    }

    /// Copy of every established record, ordered by address.
    pub fn established(&self) -> Vec<ConnectionRecord> {
        let mut records: Vec<_> = self.views.lock().established.values().cloned().collect();
        records.sort_by_key(|record| record.address);
        records
    }

    /// Copy of one established record.
    pub fn record(&self, address: &PeerAddress) -> Option<ConnectionRecord> {
        self.views.lock().established.get(address).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use super::*;

    fn address(port: u16) -> PeerAddress {
        PeerAddress::new(SocketAddr::from(([10, 0, 0, 5], port)))
    }

    #[test]
    fn test_add_pending_duplicate_rejected() {
        let registry = ConnectionRegistry::new();
        assert!(registry.add_pending(address(6881)));
        assert!(!registry.add_pending(address(6881)));
        assert!(registry.add_pending(address(6882)));
    }

    #[test]
    fn test_add_pending_established_address_rejected() {
        let registry = ConnectionRegistry::new();
        registry.add_pending(address(1));
        assert!(registry.promote_to_established(address(1), ConnectionRecord::new(address(1), true)));

        assert!(!registry.add_pending(address(1)));
        assert!(!registry.is_pending(&address(1)));
        assert!(registry.is_established(&address(1)));
    }

    #[test]
    fn test_promote_without_pending_rejected() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.promote_to_established(address(1), ConnectionRecord::new(address(1), false)));
        assert_eq!(registry.counts(), (0, 0));
    }

    #[test]
    fn test_remove_finished_then_closed_leaves_nothing() {
        let registry = ConnectionRegistry::new();
        registry.add_pending(address(1));
        registry.promote_to_established(address(1), ConnectionRecord::new(address(1), false));

        assert!(registry.remove_finished(&address(1)).is_some());
        assert!(!registry.remove_closed(&address(1)));
        assert!(registry.is_idle());
        assert!(registry.add_pending(address(1)));
    }

    #[test]
    fn test_remove_closed_idempotent() {
        let registry = ConnectionRegistry::new();
        registry.add_pending(address(1));
        assert!(registry.remove_closed(&address(1)));
        assert!(!registry.remove_closed(&address(1)));
    }

    #[test]
    fn test_update_modifies_established_record() {
        let registry = ConnectionRegistry::new();
        registry.add_pending(address(1));
        registry.promote_to_established(address(1), ConnectionRecord::new(address(1), false));

        registry.update(&address(1), |record| record.peer_interested = true);
        assert!(registry.record(&address(1)).unwrap().peer_interested);
    }

    #[test]
    fn test_add_pending_concurrent_callers_single_winner() {
        let registry = Arc::new(ConnectionRegistry::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.add_pending(address(6881)))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
