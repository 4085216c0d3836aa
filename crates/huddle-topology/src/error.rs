use huddle_proto::{ProtoError, UserId};
use thiserror::Error;

use crate::peer::NegotiationState;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("connection to {0} is closed")]
    Closed(UserId),
    #[error("answer from {remote} arrived in state {state:?}")]
    UnexpectedAnswer {
        remote: UserId,
        state: NegotiationState,
    },
    #[error("no connection to {0}")]
    UnknownPeer(UserId),
    #[error("{kind} arrived without a senderId")]
    MissingSender { kind: &'static str },
    #[error("webrtc: {0}")]
    Rtc(#[from] webrtc::Error),
    #[error("signaling channel closed")]
    SignalingClosed,
    #[error(transparent)]
    Encode(#[from] ProtoError),
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid signaling url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unsupported signaling scheme {0}")]
    UnsupportedScheme(String),
    #[error("websocket: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("signaling connection closed")]
    Closed,
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("timed out waiting for authentication")]
    AuthTimeout,
    #[error(transparent)]
    Peer(#[from] PeerError),
}
