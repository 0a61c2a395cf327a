//! Shared exchange bookkeeping: piece completion, in-flight block requests
//! and metadata fetching progress.
//!
//! Both trackers are synchronous and mutex-guarded. Connection actors call
//! them from their own tasks; no tracker method awaits while holding its lock.

pub mod metadata;
pub mod status;

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

pub use metadata::MetadataTracker;
pub use status::{Availability, RemoteBitfield, StatusTracker};

use crate::torrent::PeerId;

/// Network identity of a remote peer.
///
/// Equality, hashing and ordering use the socket address only; the peer id
/// is informational and may be learned after the address is first seen.
#[derive(Debug, Clone, Copy)]
pub struct PeerAddress {
    socket: SocketAddr,
    peer_id: Option<PeerId>,
}

impl PeerAddress {
    /// Address without a known peer id.
    pub fn new(socket: SocketAddr) -> Self {
        Self {
            socket,
            peer_id: None,
        }
    }

    /// Address with the peer id advertised in its handshake.
    pub fn with_peer_id(socket: SocketAddr, peer_id: PeerId) -> Self {
        Self {
            socket,
            peer_id: Some(peer_id),
        }
    }

    /// Socket address of the peer.
    pub fn socket(&self) -> SocketAddr {
        self.socket
    }

    /// Peer id, if known.
    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_id
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(socket: SocketAddr) -> Self {
        Self::new(socket)
    }
}

impl PartialEq for PeerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.socket == other.socket
    }
}

impl Eq for PeerAddress {}

impl Hash for PeerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.socket.hash(state);
    }
}

impl PartialOrd for PeerAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.socket.cmp(&other.socket)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_peer_address_equality_ignores_peer_id() {
        let socket: SocketAddr = "10.0.0.5:6881".parse().unwrap();
        let bare = PeerAddress::new(socket);
        let named = PeerAddress::with_peer_id(socket, PeerId::new([9u8; 20]));

        assert_eq!(bare, named);
        let set: HashSet<_> = [bare, named].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_peer_address_ordering_by_socket() {
        let low = PeerAddress::new("10.0.0.1:6881".parse().unwrap());
        let high = PeerAddress::new("10.0.0.1:6882".parse().unwrap());
        assert!(low < high);
    }
}
