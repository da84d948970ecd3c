//! Client side of LocalBeam: find a relay, keep one signaling connection to
//! it, and turn relayed negotiation into direct peer channels.

pub mod config;
pub mod discovery;
pub mod events;
pub mod peer;
pub mod signaling;
pub mod transfer;
pub mod transport;

pub use config::{generate_client_id, QueuePolicy, SignalingOptions};
pub use discovery::{Resolution, ResolvedFrom, Resolver};
pub use events::EventHub;
pub use peer::{PeerError, PeerEvent, PeerManager, PeerState};
pub use signaling::{SignalChannel, SignalingClient, SignalingError, SignalingEvent};
pub use transfer::{
    DataCallback, DirectTransfer, Payload, Received, TransferError, TransferFactory,
    TransferStrategy,
};
pub use transport::{
    MemoryNetwork, PeerTransport, Role, TransportError, TransportEvent, TransportFactory,
    TransportSession,
};
