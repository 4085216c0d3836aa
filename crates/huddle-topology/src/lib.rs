//! Client side of a huddle voice room.
//!
//! [`TopologyManager`] keeps one [`PeerConnection`] per remote user and
//! arranges them as a star around the room host: the host forwards every
//! participant's audio to everyone else, tells each peer which stream belongs
//! to which user, and relays mute and speaking state. [`ClientSession`] wires
//! the manager to the signaling socket and to real WebRTC transports.

pub mod config;
pub mod error;
pub mod manager;
pub mod participants;
pub mod peer;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod transport;

pub use config::ClientConfig;
pub use error::{PeerError, SignalingError};
pub use manager::{ParticipantSnapshot, TopologyManager, TopologySnapshot};
pub use participants::{Participant, ParticipantKey, ParticipantView, StreamIdentityMap};
pub use peer::{NegotiationState, PeerConnection};
pub use rtc::RtcTransportFactory;
pub use session::{ClientSession, JoinRequest, SessionCommand};
pub use signaling::SignalingClient;
pub use transport::{
    MediaTrack, PeerEvent, PeerEventKind, PeerLink, SdpKind, SessionTransport, TransportFactory,
    TransportState,
};
