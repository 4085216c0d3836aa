#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use huddle_proto::{
    ClientMessage, HostChangedPayload, IceCandidate, MuteStatusPayload, RoomInfoPayload,
    RoomSummary, RoomType, ServerMessage, SessionDescriptionPayload, StreamIdMapPayload,
    UserJoinedPayload, UserLeftPayload, UserProfile,
};
use huddle_topology::{
    ClientConfig, MediaTrack, PeerError, PeerEvent, PeerEventKind, PeerLink, SdpKind,
    SessionTransport, TopologyManager, TransportFactory,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

pub const ROOM: &str = "room-1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open { generation: u64 },
    CreateOffer,
    CreateAnswer,
    SetRemote(SdpKind),
    Rollback,
    AddCandidate(String),
    AddTrack(String),
    CreateDataChannel(String),
    SendData(String),
    Close,
}

/// Records every transport call, keyed by remote user.
#[derive(Clone, Default)]
pub struct FakeFactory {
    calls: Arc<Mutex<Vec<(String, Call)>>>,
}

impl FakeFactory {
    pub fn calls_for(&self, remote: &str) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|(peer, _)| peer == remote)
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn count(&self, remote: &str, call: &Call) -> usize {
        self.calls_for(remote).iter().filter(|c| *c == call).count()
    }

    pub fn opened(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|(_, call)| matches!(call, Call::Open { .. }))
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    /// Generation of the most recent connection opened to `remote`.
    pub fn generation_of(&self, remote: &str) -> u64 {
        self.calls_for(remote)
            .iter()
            .rev()
            .find_map(|call| match call {
                Call::Open { generation } => Some(*generation),
                _ => None,
            })
            .unwrap_or_else(|| panic!("no connection opened to {remote}"))
    }

    pub fn sent_data(&self, remote: &str) -> Vec<String> {
        self.calls_for(remote)
            .into_iter()
            .filter_map(|call| match call {
                Call::SendData(text) => Some(text),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn open(
        &self,
        link: PeerLink,
        _events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn SessionTransport>, PeerError> {
        self.calls.lock().push((
            link.remote.clone(),
            Call::Open {
                generation: link.generation,
            },
        ));
        Ok(Box::new(FakeTransport {
            remote: link.remote,
            calls: Arc::clone(&self.calls),
        }))
    }
}

struct FakeTransport {
    remote: String,
    calls: Arc<Mutex<Vec<(String, Call)>>>,
}

impl FakeTransport {
    fn record(&self, call: Call) -> usize {
        let mut calls = self.calls.lock();
        calls.push((self.remote.clone(), call));
        calls.len()
    }
}

#[async_trait]
impl SessionTransport for FakeTransport {
    async fn create_offer(&self) -> Result<String, PeerError> {
        let n = self.record(Call::CreateOffer);
        Ok(format!("offer-{}-{n}", self.remote))
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        let n = self.record(Call::CreateAnswer);
        Ok(format!("answer-{}-{n}", self.remote))
    }

    async fn set_remote_description(&self, kind: SdpKind, _sdp: String) -> Result<(), PeerError> {
        self.record(Call::SetRemote(kind));
        Ok(())
    }

    async fn rollback(&self) -> Result<(), PeerError> {
        self.record(Call::Rollback);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.record(Call::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError> {
        self.record(Call::AddTrack(track.stream_id().to_string()));
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<(), PeerError> {
        self.record(Call::CreateDataChannel(label.to_string()));
        Ok(())
    }

    async fn send_data(&self, text: &str) -> Result<(), PeerError> {
        self.record(Call::SendData(text.to_string()));
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.record(Call::Close);
        Ok(())
    }
}

pub struct Harness {
    pub manager: TopologyManager,
    pub factory: FakeFactory,
    pub signals: mpsc::UnboundedReceiver<ClientMessage>,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

impl Harness {
    pub fn new(local_id: &str) -> Self {
        Self::with_config(local_id, ClientConfig::default())
    }

    pub fn with_config(local_id: &str, config: ClientConfig) -> Self {
        let factory = FakeFactory::default();
        let (signals_tx, signals) = mpsc::unbounded_channel();
        let (manager, events) = TopologyManager::new(
            UserProfile::new(local_id, local_id),
            Some(local_track(local_id)),
            Arc::new(factory.clone()),
            signals_tx,
            config,
        );
        Self {
            manager,
            factory,
            signals,
            events,
        }
    }

    pub async fn server(&mut self, message: ServerMessage) {
        self.manager
            .handle_server_message(message)
            .await
            .expect("server message applied");
    }

    pub async fn peer_event(&mut self, remote: &str, kind: PeerEventKind) {
        let generation = self.factory.generation_of(remote);
        self.manager
            .handle_peer_event(PeerEvent {
                remote: remote.to_string(),
                generation,
                kind,
            })
            .await
            .expect("peer event applied");
    }

    pub fn drain(&mut self) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(message) = self.signals.try_recv() {
            out.push(message);
        }
        out
    }
}

pub fn local_track(user_id: &str) -> MediaTrack {
    MediaTrack::opus(format!("mic-{user_id}"), format!("stream-{user_id}"))
}

pub fn room_info(host: &str, members: &[&str]) -> ServerMessage {
    ServerMessage::RoomInfo(RoomInfoPayload {
        room: RoomSummary {
            id: ROOM.to_string(),
            host_id: host.to_string(),
            room_type: RoomType::Group,
        },
        participants: members.iter().map(|id| UserProfile::new(*id, *id)).collect(),
    })
}

pub fn user_joined(user_id: &str) -> ServerMessage {
    ServerMessage::UserJoined(UserJoinedPayload {
        user: UserProfile::new(user_id, user_id),
    })
}

pub fn user_left(user_id: &str) -> ServerMessage {
    ServerMessage::UserLeft(UserLeftPayload {
        user_id: user_id.to_string(),
    })
}

pub fn host_changed(new_host_id: &str) -> ServerMessage {
    ServerMessage::HostChanged(HostChangedPayload {
        new_host_id: new_host_id.to_string(),
    })
}

pub fn offer_from(sender: &str) -> ServerMessage {
    ServerMessage::Offer(SessionDescriptionPayload {
        sdp: format!("offer-from-{sender}"),
        target_user_id: None,
        sender_id: Some(sender.to_string()),
    })
}

pub fn answer_from(sender: &str) -> ServerMessage {
    ServerMessage::Answer(SessionDescriptionPayload {
        sdp: format!("answer-from-{sender}"),
        target_user_id: None,
        sender_id: Some(sender.to_string()),
    })
}

pub fn stream_map_from(sender: &str, entries: &[(&str, &str)]) -> ServerMessage {
    ServerMessage::StreamIdMap(StreamIdMapPayload {
        target_user_id: None,
        sender_id: Some(sender.to_string()),
        entries: entries
            .iter()
            .map(|(stream, user)| (stream.to_string(), user.to_string()))
            .collect::<BTreeMap<_, _>>(),
    })
}

pub fn mute_from(sender: &str, user_id: &str, muted: bool) -> ServerMessage {
    ServerMessage::MuteStatusChanged(MuteStatusPayload {
        user_id: user_id.to_string(),
        is_muted: muted,
        target_user_id: None,
        sender_id: Some(sender.to_string()),
    })
}

pub fn target_of(message: &ClientMessage) -> Option<&str> {
    match message {
        ClientMessage::Offer(p) | ClientMessage::Answer(p) => p.target_user_id.as_deref(),
        ClientMessage::IceCandidate(p) => p.target_user_id.as_deref(),
        ClientMessage::StreamIdMap(p) => p.target_user_id.as_deref(),
        ClientMessage::MuteStatusChanged(p) => p.target_user_id.as_deref(),
        _ => None,
    }
}

pub fn kind_of(message: &ClientMessage) -> &'static str {
    match message {
        ClientMessage::Authenticate(_) => "authenticate",
        ClientMessage::Join(_) => "join",
        ClientMessage::Leave(_) => "leave",
        ClientMessage::Offer(_) => "offer",
        ClientMessage::Answer(_) => "answer",
        ClientMessage::IceCandidate(_) => "ice-candidate",
        ClientMessage::StreamIdMap(_) => "stream-id-map",
        ClientMessage::MuteStatusChanged(_) => "mute-status-changed",
    }
}

/// `(kind, target)` pairs, for asserting message order.
pub fn outline(messages: &[ClientMessage]) -> Vec<(&'static str, String)> {
    messages
        .iter()
        .map(|m| (kind_of(m), target_of(m).unwrap_or_default().to_string()))
        .collect()
}
