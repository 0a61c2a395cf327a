//! BitTorrent wire protocol: typed messages, framing and extensions.
//!
//! BEP 3 messages and handshake, plus the BEP 10 extension envelope and the
//! BEP 9 metadata messages carried inside it.

pub mod extension;
pub mod handshake;
pub mod messages;
pub mod types;

pub use extension::{ExtensionHandshake, MetadataMessage};
pub use handshake::HandshakeCodec;
pub use messages::MessageCodec;
pub use types::{PeerHandshake, PeerId, PeerMessage};
