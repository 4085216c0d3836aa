use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use huddle_proto::{IceCandidate, UserId};
use tokio::sync::mpsc;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::error::PeerError;

/// Outbound audio: either the local microphone track or a host-side copy of
/// a participant's incoming track.
///
/// Clones share one send gate. While the gate is closed
/// [`write_rtp`](Self::write_rtp) drops packets, which is how local mute
/// silences the microphone.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackLocalStaticRTP>,
    enabled: Arc<AtomicBool>,
}

impl MediaTrack {
    pub fn opus(track_id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        let capability = RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        };
        Self::from_local(Arc::new(TrackLocalStaticRTP::new(
            capability,
            track_id.into(),
            stream_id.into(),
        )))
    }

    pub fn from_local(inner: Arc<TrackLocalStaticRTP>) -> Self {
        Self {
            inner,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    /// The stream id the remote end sees; the key of the stream identity map.
    pub fn stream_id(&self) -> &str {
        self.inner.stream_id()
    }

    pub fn local(&self) -> Arc<TrackLocalStaticRTP> {
        Arc::clone(&self.inner)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Sends one packet to every bound peer. Returns false without sending
    /// while the track is disabled.
    pub async fn write_rtp(&self, packet: &Packet) -> Result<bool, PeerError> {
        if !self.is_enabled() {
            return Ok(false);
        }
        self.inner.write_rtp(packet).await?;
        Ok(true)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id())
            .field("stream_id", &self.stream_id())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Identifies one transport session. `generation` changes every time a
/// connection to the same remote is re-created, so late events from a torn
/// down session can be told apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerLink {
    pub local: UserId,
    pub remote: UserId,
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub remote: UserId,
    pub generation: u64,
    pub kind: PeerEventKind,
}

#[derive(Debug, Clone)]
pub enum PeerEventKind {
    LocalCandidate(IceCandidate),
    Track(MediaTrack),
    ChannelOpen,
    ChannelMessage(String),
    StateChanged(TransportState),
}

/// One transport session to one remote peer. Callbacks surface as
/// [`PeerEvent`]s on the channel handed to [`TransportFactory::open`].
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Creates an offer and applies it as the local description.
    async fn create_offer(&self) -> Result<String, PeerError>;
    /// Creates an answer and applies it as the local description.
    async fn create_answer(&self) -> Result<String, PeerError>;
    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), PeerError>;
    /// Discards a local offer that lost a glare race.
    async fn rollback(&self) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;
    async fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError>;
    async fn create_data_channel(&self, label: &str) -> Result<(), PeerError>;
    async fn send_data(&self, text: &str) -> Result<(), PeerError>;
    async fn close(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
        link: PeerLink,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn SessionTransport>, PeerError>;
}
