//! Peer connections: transport, per-connection actors and their lifecycle.
//!
//! `dispatch` holds the protocol rules as a pure function over connection
//! state. `actor` runs those rules against a live stream and the session.
//! `lifecycle` adds `Session::connect`, `Session::establish` and
//! `Session::accept`, which guard against duplicate peers and guarantee
//! cleanup when an actor ends.

mod actor;
pub mod dispatch;
mod lifecycle;
pub mod outbound;
pub mod transport;

pub use dispatch::{ConnectionState, Effect, LocalView};
pub use outbound::OutboundQueue;
pub use transport::{BoxedStream, Connector, Finalizer, PeerStream, PendingConnection, TcpConnector};
