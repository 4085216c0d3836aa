use std::sync::Arc;

use async_trait::async_trait;
use huddle_proto::IceCandidate;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use crate::error::PeerError;
use crate::transport::{
    MediaTrack, PeerEvent, PeerEventKind, PeerLink, SdpKind, SessionTransport, TransportFactory,
    TransportState,
};

/// Opens real WebRTC peer connections. The media engine and interceptors are
/// built once and shared by every connection.
pub struct RtcTransportFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl RtcTransportFactory {
    pub fn new(ice_urls: &[String]) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let ice_servers = if ice_urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_urls.to_vec(),
                ..Default::default()
            }]
        };
        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn open(
        &self,
        link: PeerLink,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn SessionTransport>, PeerError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);
        let emitter = Emitter {
            remote: link.remote.clone(),
            generation: link.generation,
            events,
        };
        let channel = Arc::new(Mutex::new(None));

        let on_candidate = emitter.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let emitter = on_candidate.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => emitter.emit(PeerEventKind::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    })),
                    Err(err) => warn!(remote = %emitter.remote, error = %err, "candidate encode failed"),
                }
            })
        }));

        let on_state = emitter.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let emitter = on_state.clone();
            Box::pin(async move {
                debug!(remote = %emitter.remote, state = %state, "peer connection state");
                let mapped = match state {
                    RTCPeerConnectionState::Connecting => TransportState::Connecting,
                    RTCPeerConnectionState::Connected => TransportState::Connected,
                    RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                    RTCPeerConnectionState::Failed => TransportState::Failed,
                    RTCPeerConnectionState::Closed => TransportState::Closed,
                    _ => return,
                };
                emitter.emit(PeerEventKind::StateChanged(mapped));
            })
        }));

        let on_track = emitter.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let emitter = on_track.clone();
            Box::pin(async move {
                let local = Arc::new(TrackLocalStaticRTP::new(
                    track.codec().capability.clone(),
                    track.id(),
                    track.stream_id(),
                ));
                debug!(
                    remote = %emitter.remote,
                    stream_id = %local.stream_id(),
                    "remote track received"
                );
                tokio::spawn(pump_rtp(track, Arc::clone(&local)));
                emitter.emit(PeerEventKind::Track(MediaTrack::from_local(local)));
            })
        }));

        let on_channel = emitter.clone();
        let slot = Arc::clone(&channel);
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let emitter = on_channel.clone();
            let slot = Arc::clone(&slot);
            Box::pin(async move {
                debug!(remote = %emitter.remote, label = %dc.label(), "side channel offered");
                // Stored before wiring so a flush on open finds the channel.
                *slot.lock() = Some(Arc::clone(&dc));
                wire_channel(&dc, emitter);
            })
        }));

        Ok(Box::new(RtcTransport {
            pc,
            channel,
            emitter,
        }))
    }
}

#[derive(Clone)]
struct Emitter {
    remote: String,
    generation: u64,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl Emitter {
    fn emit(&self, kind: PeerEventKind) {
        let event = PeerEvent {
            remote: self.remote.clone(),
            generation: self.generation,
            kind,
        };
        if self.events.send(event).is_err() {
            trace!(remote = %self.remote, "peer event dropped; manager gone");
        }
    }
}

fn wire_channel(dc: &Arc<RTCDataChannel>, emitter: Emitter) {
    let on_open = emitter.clone();
    dc.on_open(Box::new(move || {
        let emitter = on_open.clone();
        Box::pin(async move { emitter.emit(PeerEventKind::ChannelOpen) })
    }));
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let emitter = emitter.clone();
        Box::pin(async move {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => emitter.emit(PeerEventKind::ChannelMessage(text)),
                Err(_) => debug!(remote = %emitter.remote, "non-utf8 side channel frame dropped"),
            }
        })
    }));
}

/// Copies RTP from a received track into a local track so the host can send
/// it on to other peers.
async fn pump_rtp(remote: Arc<TrackRemote>, local: Arc<TrackLocalStaticRTP>) {
    loop {
        match remote.read_rtp().await {
            Ok((packet, _)) => {
                if let Err(err) = local.write_rtp(&packet).await {
                    debug!(stream_id = %local.stream_id(), error = %err, "rtp forward failed");
                }
            }
            Err(err) => {
                debug!(stream_id = %local.stream_id(), error = %err, "remote track ended");
                break;
            }
        }
    }
}

struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    emitter: Emitter,
}

#[async_trait]
impl SessionTransport for RtcTransport {
    async fn create_offer(&self) -> Result<String, PeerError> {
        let offer = self.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await?;
        Ok(sdp)
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        let answer = self.pc.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await?;
        Ok(sdp)
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), PeerError> {
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(sdp)?,
        };
        self.pc.set_remote_description(description).await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), PeerError> {
        let Some(pending) = self.pc.pending_local_description().await else {
            return Ok(());
        };
        // An empty rollback description is rejected, so echo the offer.
        let mut description = RTCSessionDescription::default();
        description.sdp_type = RTCSdpType::Rollback;
        description.sdp = pending.sdp;
        self.pc.set_local_description(description).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError> {
        let sender = self
            .pc
            .add_track(track.local() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        // RTCP has to be read for the interceptors to run.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<(), PeerError> {
        let dc = self.pc.create_data_channel(label, None).await?;
        *self.channel.lock() = Some(Arc::clone(&dc));
        wire_channel(&dc, self.emitter.clone());
        Ok(())
    }

    async fn send_data(&self, text: &str) -> Result<(), PeerError> {
        let channel = self.channel.lock().clone();
        match channel {
            Some(dc) => {
                dc.send_text(text.to_string()).await?;
                Ok(())
            }
            None => {
                debug!(remote = %self.emitter.remote, "no side channel yet; message dropped");
                Ok(())
            }
        }
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc.close().await?;
        Ok(())
    }
}
