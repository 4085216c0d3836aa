//! Wire types for the huddle signaling socket and the peer side-channel.
//!
//! Every signaling frame is a JSON [`Envelope`] of the form
//! `{"type": "...", "payload": {...}}`. The server routes on the raw
//! envelope so it can forward relay payloads verbatim; clients work with the
//! typed [`ClientMessage`] / [`ServerMessage`] enums.

mod envelope;
mod messages;
mod side_channel;

pub use envelope::{kind, Envelope, ProtoError};
pub use messages::{
    AuthErrorPayload, AuthenticatePayload, AuthenticatedPayload, ClientMessage,
    HostChangedPayload, IceCandidate, IceCandidatePayload, JoinPayload, LeavePayload,
    MuteStatusPayload, RoomInfoPayload, RoomSummary, RoomType, ServerMessage,
    SessionDescriptionPayload, StreamIdMapPayload, UserJoinedPayload, UserLeftPayload,
    UserProfile,
};
pub use side_channel::{SideChannelMessage, SpeakingStatus};

pub type UserId = String;
pub type RoomId = String;
