//! Guarded spawning and cleanup of connection actors.
//!
//! Every connection, dialed or accepted, first claims its address through
//! `add_pending`. Only the winner spawns a task; the task owns guards whose
//! drops remove the address from both membership views and release its
//! requests, whether the actor returns, fails or is aborted.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;

use super::actor;
use super::transport::{self, BoxedStream, Finalizer, PendingConnection};
use crate::exchange::PeerAddress;
use crate::session::{ConnectionRecord, Session};
use crate::torrent::{PeerHandshake, TorrentError};

/// Final cleanup of a claimed address: finalizer, then membership removal.
struct ConnectionGuard {
    session: Arc<Session>,
    address: PeerAddress,
    finalizer: Option<Finalizer>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(finalizer) = self.finalizer.take() {
            finalizer();
        }
        self.session.registry().remove_closed(&self.address);
        self.session.reclaim_if_idle();
    }
}

/// Cleanup of an established conversation: releases what the peer held.
struct EstablishedGuard {
    session: Arc<Session>,
    address: PeerAddress,
}

impl Drop for EstablishedGuard {
    fn drop(&mut self) {
        let released = self.session.status().reset_pending(&self.address);
        self.session.release_metadata_requests(&self.address);
        self.session.registry().remove_finished(&self.address);
        tracing::debug!(peer = %self.address, released, "Conversation finished");
    }
}

impl Session {
    /// Dials `address` and runs a connection actor for it.
    ///
    /// Returns `None` without spawning anything when the address is already
    /// pending or established, or when the session is closed.
    pub fn connect(self: &Arc<Self>, address: SocketAddr) -> Option<JoinHandle<()>> {
        let peer = PeerAddress::new(address);
        let guard = self.claim(peer)?;

        let session = Arc::clone(self);
        Some(tokio::spawn(async move {
            let _guard = guard;
            let result = session.dial_and_run(peer).await;
            log_outcome(peer, &result);
        }))
    }

    /// Runs a connection actor for an already handshaken connection.
    ///
    /// Returns `None` for a duplicate address; the connection is then
    /// dropped and its finalizer runs immediately.
    pub fn establish(self: &Arc<Self>, mut pending: PendingConnection) -> Option<JoinHandle<()>> {
        let peer = pending.address();
        let finalizer = pending.take_finalizer();
        let guard = match self.claim(peer) {
            Some(mut guard) => {
                guard.finalizer = finalizer;
                guard
            }
            None => {
                if let Some(finalizer) = finalizer {
                    finalizer();
                }
                return None;
            }
        };

        let session = Arc::clone(self);
        Some(tokio::spawn(async move {
            let _guard = guard;
            let supports_extensions = pending.remote().supports_extensions();
            let result = match pending.take_stream() {
                Some(stream) => session.run_established(peer, supports_extensions, stream).await,
                None => Err(TorrentError::PeerConnectionError {
                    reason: "Pending connection has no stream".to_string(),
                }),
            };
            log_outcome(peer, &result);
        }))
    }

    /// Reads the inbound handshake on an accepted stream, replies, and
    /// hands the connection to `establish`.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PeerConnectionError` - Stream failed or handshake timed out
    /// - `TorrentError::ProtocolError` - Handshake malformed or for another torrent
    pub async fn accept(
        self: &Arc<Self>,
        mut stream: BoxedStream,
        remote: SocketAddr,
    ) -> Result<Option<JoinHandle<()>>, TorrentError> {
        let local = PeerHandshake::new(self.info_hash(), self.peer_id());
        let handshake =
            transport::inbound_handshake(&mut stream, &local, self.config().network.handshake_timeout).await?;
        tracing::debug!(peer = %remote, "Inbound handshake complete");
        Ok(self.establish(PendingConnection::new(remote, stream, handshake)))
    }

    /// Claims `peer` in the pending view and returns the guard releasing it.
    fn claim(self: &Arc<Self>, peer: PeerAddress) -> Option<ConnectionGuard> {
        if self.is_closed() || !self.registry().add_pending(peer) {
            tracing::debug!(peer = %peer, "Skipping duplicate connection");
            return None;
        }
        Some(ConnectionGuard {
            session: Arc::clone(self),
            address: peer,
            finalizer: None,
        })
    }

    async fn dial_and_run(self: &Arc<Self>, peer: PeerAddress) -> Result<(), TorrentError> {
        let mut stream = self.connector().dial(peer.socket()).await?;
        let local = PeerHandshake::new(self.info_hash(), self.peer_id());
        let remote =
            transport::outbound_handshake(&mut stream, &local, self.config().network.handshake_timeout).await?;

        let peer = PeerAddress::with_peer_id(peer.socket(), remote.peer_id);
        self.run_established(peer, remote.supports_extensions(), stream).await
    }

    async fn run_established(
        self: &Arc<Self>,
        peer: PeerAddress,
        supports_extensions: bool,
        stream: BoxedStream,
    ) -> Result<(), TorrentError> {
        let record = ConnectionRecord::new(peer, supports_extensions);
        if !self.registry().promote_to_established(peer, record) {
            return Err(TorrentError::PeerConnectionError {
                reason: "Connection was removed before it could be established".to_string(),
            });
        }
        let _established = EstablishedGuard {
            session: Arc::clone(self),
            address: peer,
        };

        tracing::info!(peer = %peer, extensions = supports_extensions, "Peer connected");
        actor::run(Arc::clone(self), peer, supports_extensions, stream).await
    }
}

/// Connection failures are routine; protocol and storage failures are not.
fn log_outcome(peer: PeerAddress, result: &Result<(), TorrentError>) {
    match result {
        Ok(()) => tracing::debug!(peer = %peer, "Peer disconnected"),
        Err(e @ (TorrentError::PeerConnectionError { .. } | TorrentError::SessionClosed)) => {
            tracing::debug!(peer = %peer, error = %e, "Connection ended");
        }
        Err(e) => tracing::warn!(peer = %peer, error = %e, "Connection torn down"),
    }
}
