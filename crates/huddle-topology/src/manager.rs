use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use huddle_proto::{
    ClientMessage, LeavePayload, MuteStatusPayload, RoomSummary, ServerMessage,
    SideChannelMessage, StreamIdMapPayload, UserId, UserProfile,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::PeerError;
use crate::participants::{Participant, ParticipantKey, ParticipantView, StreamIdentityMap};
use crate::peer::{NegotiationState, PeerConnection};
use crate::transport::{
    MediaTrack, PeerEvent, PeerEventKind, PeerLink, TransportFactory, TransportState,
};

#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantSnapshot {
    pub key: ParticipantKey,
    pub username: Option<String>,
    pub stream_id: Option<String>,
    pub is_muted: bool,
    pub is_speaking: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologySnapshot {
    pub room: Option<RoomSummary>,
    pub is_host: bool,
    pub participants: Vec<ParticipantSnapshot>,
    pub peers: Vec<(UserId, NegotiationState)>,
    pub local_muted: bool,
    pub local_speaking: bool,
}

/// Owns every peer connection of the local user and the merged participant
/// view built from them.
///
/// The host connects to every participant and forwards each participant's
/// audio to all others; participants only ever answer the host. All input
/// arrives through [`handle_server_message`](Self::handle_server_message),
/// [`handle_peer_event`](Self::handle_peer_event) and the local setters, and
/// each call finishes its state changes before returning.
pub struct TopologyManager {
    local: UserProfile,
    local_track: Option<MediaTrack>,
    factory: Arc<dyn TransportFactory>,
    signals: mpsc::UnboundedSender<ClientMessage>,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    config: ClientConfig,
    room: Option<RoomSummary>,
    peers: HashMap<UserId, PeerConnection>,
    participants: ParticipantView,
    stream_identities: StreamIdentityMap,
    relayed_tracks: HashMap<UserId, MediaTrack>,
    local_muted: bool,
    local_speaking: bool,
    next_generation: u64,
}

impl TopologyManager {
    /// Returns the manager and the receiver its transports report into.
    pub fn new(
        local: UserProfile,
        local_track: Option<MediaTrack>,
        factory: Arc<dyn TransportFactory>,
        signals: mpsc::UnboundedSender<ClientMessage>,
        config: ClientConfig,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (peer_events, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            local,
            local_track,
            factory,
            signals,
            peer_events,
            config,
            room: None,
            peers: HashMap::new(),
            participants: ParticipantView::new(),
            stream_identities: StreamIdentityMap::default(),
            relayed_tracks: HashMap::new(),
            local_muted: false,
            local_speaking: false,
            next_generation: 0,
        };
        (manager, events_rx)
    }

    pub fn local_user(&self) -> &UserProfile {
        &self.local
    }

    pub fn local_track(&self) -> Option<&MediaTrack> {
        self.local_track.as_ref()
    }

    pub fn room(&self) -> Option<&RoomSummary> {
        self.room.as_ref()
    }

    pub fn is_host(&self) -> bool {
        self.room
            .as_ref()
            .is_some_and(|room| room.host_id == self.local.id)
    }

    pub fn participants(&self) -> &ParticipantView {
        &self.participants
    }

    pub fn participant(&self, key: &ParticipantKey) -> Option<&Participant> {
        self.participants.entry(key)
    }

    pub fn stream_identities(&self) -> &StreamIdentityMap {
        &self.stream_identities
    }

    pub fn connection_state(&self, user_id: &str) -> Option<NegotiationState> {
        self.peers.get(user_id).map(PeerConnection::state)
    }

    pub fn peer_ids(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn relayed_track(&self, user_id: &str) -> Option<&MediaTrack> {
        self.relayed_tracks.get(user_id)
    }

    pub async fn handle_server_message(&mut self, message: ServerMessage) -> Result<(), PeerError> {
        match message {
            ServerMessage::Authenticated(_) | ServerMessage::AuthError(_) => Ok(()),
            ServerMessage::RoomInfo(payload) => {
                info!(
                    room_id = %payload.room.id,
                    host_id = %payload.room.host_id,
                    participants = payload.participants.len(),
                    "joined room"
                );
                let local_id = self.local.id.clone();
                self.participants = ParticipantView::from_profiles(
                    payload
                        .participants
                        .into_iter()
                        .filter(|p| p.id != local_id),
                );
                self.room = Some(payload.room);
                if self.local_muted && !self.is_host() {
                    if let Some(host_id) = self.room.as_ref().map(|r| r.host_id.clone()) {
                        self.send_mute(&host_id, &self.local.id, true);
                    }
                }
                Ok(())
            }
            ServerMessage::UserJoined(payload) => {
                let user = payload.user;
                if user.id == self.local.id {
                    return Ok(());
                }
                let user_id = user.id.clone();
                self.participants.upsert_profile(user);
                if self.is_host() {
                    if self.peers.contains_key(&user_id) {
                        info!(user_id = %user_id, "peer rejoined; rebuilding connection");
                        self.forget_link(&user_id).await;
                    }
                    self.admit_as_host(vec![user_id]).await;
                }
                Ok(())
            }
            ServerMessage::UserLeft(payload) => {
                info!(user_id = %payload.user_id, "peer left room");
                self.drop_peer(&payload.user_id).await;
                self.relayed_tracks.remove(&payload.user_id);
                self.participants.remove_user(&payload.user_id);
                Ok(())
            }
            ServerMessage::HostChanged(payload) => {
                self.on_host_changed(payload.new_host_id).await;
                Ok(())
            }
            ServerMessage::Offer(payload) => {
                let sender = payload
                    .sender_id
                    .ok_or(PeerError::MissingSender { kind: "offer" })?;
                if !self.peers.contains_key(&sender) {
                    self.participants.ensure_user(&sender);
                    self.open_peer(&sender).await?;
                    if let (Some(track), Some(peer)) =
                        (self.local_track.as_ref(), self.peers.get_mut(&sender))
                    {
                        peer.add_track(track).await?;
                    }
                }
                let peer = self
                    .peers
                    .get_mut(&sender)
                    .ok_or_else(|| PeerError::UnknownPeer(sender.clone()))?;
                peer.handle_offer(payload.sdp).await
            }
            ServerMessage::Answer(payload) => {
                let sender = payload
                    .sender_id
                    .ok_or(PeerError::MissingSender { kind: "answer" })?;
                let peer = self
                    .peers
                    .get_mut(&sender)
                    .ok_or_else(|| PeerError::UnknownPeer(sender.clone()))?;
                peer.handle_answer(payload.sdp).await
            }
            ServerMessage::IceCandidate(payload) => {
                let sender = payload
                    .sender_id
                    .ok_or(PeerError::MissingSender {
                        kind: "ice-candidate",
                    })?;
                match self.peers.get_mut(&sender) {
                    Some(peer) => peer.handle_ice_candidate(payload.candidate).await,
                    None => {
                        debug!(sender = %sender, "candidate for unknown peer dropped");
                        Ok(())
                    }
                }
            }
            ServerMessage::StreamIdMap(payload) => {
                for (stream_id, user_id) in payload.entries {
                    if self.participants.reconcile(&stream_id, &user_id) {
                        debug!(stream_id = %stream_id, user_id = %user_id, "placeholder resolved");
                    }
                    self.stream_identities.insert(stream_id, user_id);
                }
                Ok(())
            }
            ServerMessage::MuteStatusChanged(payload) => {
                self.on_remote_mute(payload);
                Ok(())
            }
        }
    }

    pub async fn handle_peer_event(&mut self, event: PeerEvent) -> Result<(), PeerError> {
        let current = self.peers.get(&event.remote).map(PeerConnection::generation);
        if current != Some(event.generation) {
            debug!(
                remote = %event.remote,
                generation = event.generation,
                "dropping event from stale connection"
            );
            return Ok(());
        }
        let remote = event.remote;

        match event.kind {
            PeerEventKind::LocalCandidate(candidate) => match self.peers.get(&remote) {
                Some(peer) => peer.send_local_candidate(candidate),
                None => Ok(()),
            },
            PeerEventKind::Track(track) => {
                if self.is_host() {
                    self.relay_track(&remote, track).await;
                } else {
                    self.attribute_track(track);
                }
                Ok(())
            }
            PeerEventKind::ChannelOpen => {
                if let Some(peer) = self.peers.get_mut(&remote) {
                    peer.on_channel_open().await;
                }
                Ok(())
            }
            PeerEventKind::ChannelMessage(text) => {
                self.on_side_channel(&remote, &text).await;
                Ok(())
            }
            PeerEventKind::StateChanged(state) => {
                if let Some(peer) = self.peers.get_mut(&remote) {
                    peer.on_transport_state(state).await?;
                }
                if matches!(state, TransportState::Failed | TransportState::Closed) {
                    warn!(remote = %remote, state = ?state, "transport lost");
                    self.abandon_peer(&remote).await;
                }
                Ok(())
            }
        }
    }

    /// Opens a connection to each listed peer and runs the host onboarding
    /// sequence: side channel, local and relayed tracks, mute snapshot,
    /// stream map, then the offer.
    pub async fn admit_as_host(&mut self, peer_ids: Vec<UserId>) {
        for peer_id in peer_ids {
            if peer_id == self.local.id || self.peers.contains_key(&peer_id) {
                continue;
            }
            if let Err(err) = self.admit_peer(&peer_id).await {
                warn!(peer = %peer_id, error = %err, "host onboarding failed");
                self.drop_peer(&peer_id).await;
            }
        }
    }

    pub async fn set_local_speaking(&mut self, speaking: bool) {
        if self.local_speaking == speaking {
            return;
        }
        self.local_speaking = speaking;
        let text = match SideChannelMessage::speaking(speaking).to_text() {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "failed to encode speaking status");
                return;
            }
        };
        for (remote, peer) in self.peers.iter_mut() {
            if let Err(err) = peer.send_data(text.clone()).await {
                debug!(remote = %remote, error = %err, "speaking status not sent");
            }
        }
    }

    /// Hosts tell every peer directly; participants tell the host, which
    /// relays to everyone else.
    pub fn set_local_muted(&mut self, muted: bool) {
        if self.local_muted == muted {
            return;
        }
        self.local_muted = muted;
        if let Some(track) = &self.local_track {
            track.set_enabled(!muted);
        }
        let targets: Vec<UserId> = if self.is_host() {
            self.peers.keys().cloned().collect()
        } else {
            self.room
                .as_ref()
                .map(|room| room.host_id.clone())
                .into_iter()
                .filter(|host| *host != self.local.id)
                .collect()
        };
        for target in targets {
            self.send_mute(&target, &self.local.id, muted);
        }
    }

    /// Abandons negotiations that have waited longer than the configured
    /// timeout. The host immediately retries them with a fresh connection.
    pub async fn reap_stalled_negotiations(&mut self, now: Instant) -> Vec<UserId> {
        let Some(timeout) = self.config.negotiation_timeout else {
            return Vec::new();
        };
        let mut stalled: Vec<UserId> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.is_stalled(now, timeout))
            .map(|(id, _)| id.clone())
            .collect();
        stalled.sort();
        for remote in &stalled {
            warn!(remote = %remote, "negotiation stalled; abandoning connection");
            self.abandon_peer(remote).await;
        }
        stalled
    }

    pub async fn leave(&mut self) {
        if self.signals.send(ClientMessage::Leave(LeavePayload::default())).is_err() {
            debug!("signaling closed before leave was sent");
        }
        self.reset().await;
    }

    /// Closes every connection and forgets the room. The stream identity map
    /// survives.
    pub async fn reset(&mut self) {
        self.close_all_peers().await;
        self.relayed_tracks.clear();
        self.participants.clear();
        self.room = None;
        self.local_speaking = false;
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        let mut peers: Vec<(UserId, NegotiationState)> = self
            .peers
            .iter()
            .map(|(id, peer)| (id.clone(), peer.state()))
            .collect();
        peers.sort_by(|a, b| a.0.cmp(&b.0));
        TopologySnapshot {
            room: self.room.clone(),
            is_host: self.is_host(),
            participants: self
                .participants
                .iter()
                .map(|(key, entry)| ParticipantSnapshot {
                    key: key.clone(),
                    username: entry.profile.as_ref().map(|p| p.username.clone()),
                    stream_id: entry.stream.as_ref().map(|t| t.stream_id().to_string()),
                    is_muted: entry.is_muted,
                    is_speaking: entry.is_speaking,
                })
                .collect(),
            peers,
            local_muted: self.local_muted,
            local_speaking: self.local_speaking,
        }
    }

    async fn admit_peer(&mut self, peer_id: &str) -> Result<(), PeerError> {
        self.participants.ensure_user(peer_id);
        self.open_peer(peer_id).await?;
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| PeerError::UnknownPeer(peer_id.to_string()))?;

        peer.create_data_channel(&self.config.data_channel_label)
            .await?;
        if let Some(track) = &self.local_track {
            peer.add_track(track).await?;
        }
        for (owner, track) in &self.relayed_tracks {
            if owner != peer_id {
                peer.add_track(track).await?;
            }
        }

        for user_id in self.participants.muted_users() {
            if user_id != peer_id {
                self.send_mute(peer_id, &user_id, true);
            }
        }
        if self.local_muted {
            self.send_mute(peer_id, &self.local.id, true);
        }

        let mut entries: BTreeMap<String, UserId> = self
            .relayed_tracks
            .iter()
            .filter(|(owner, _)| owner.as_str() != peer_id)
            .map(|(owner, track)| (track.stream_id().to_string(), owner.clone()))
            .collect();
        if let Some(track) = &self.local_track {
            entries.insert(track.stream_id().to_string(), self.local.id.clone());
        }
        self.send_stream_map(peer_id, entries);

        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| PeerError::UnknownPeer(peer_id.to_string()))?;
        peer.create_offer().await?;
        info!(peer = %peer_id, "admitted peer as host");
        Ok(())
    }

    /// Host side: forward a participant's track to every other peer, sending
    /// the owner mapping ahead of the renegotiation that carries it.
    async fn relay_track(&mut self, owner: &str, track: MediaTrack) {
        let stream_id = track.stream_id().to_string();
        info!(owner = %owner, stream_id = %stream_id, "relaying track");
        self.stream_identities.insert(stream_id.clone(), owner);
        self.participants.attach_stream(owner, track.clone());
        self.relayed_tracks.insert(owner.to_string(), track.clone());

        let targets: Vec<UserId> = self
            .peers
            .keys()
            .filter(|id| id.as_str() != owner)
            .cloned()
            .collect();
        for target in targets {
            let mut entries = BTreeMap::new();
            entries.insert(stream_id.clone(), owner.to_string());
            self.send_stream_map(&target, entries);

            let Some(peer) = self.peers.get_mut(&target) else {
                continue;
            };
            let result = match peer.add_track(&track).await {
                Ok(()) => peer.create_offer().await,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                warn!(target = %target, owner = %owner, error = %err, "track relay failed");
            }
        }
    }

    /// Participant side: bind an incoming track to its owner, or park it
    /// until the mapping arrives.
    fn attribute_track(&mut self, track: MediaTrack) {
        let stream_id = track.stream_id().to_string();
        match self.stream_identities.resolve(&stream_id).cloned() {
            Some(owner) => {
                debug!(stream_id = %stream_id, owner = %owner, "track attributed");
                self.participants.attach_stream(&owner, track);
            }
            None => {
                warn!(stream_id = %stream_id, "track arrived before its stream mapping");
                self.participants.attach_placeholder(track);
            }
        }
    }

    async fn on_side_channel(&mut self, remote: &str, text: &str) {
        let status = match SideChannelMessage::from_text(text) {
            Ok(SideChannelMessage::SpeakingStatus(status)) => status,
            Err(err) => {
                debug!(remote = %remote, error = %err, "unreadable side channel message");
                return;
            }
        };

        if self.is_host() {
            // Participants only report themselves to the host.
            if !self.participants.set_speaking(remote, status.is_speaking) {
                return;
            }
            let relayed = match SideChannelMessage::relayed_speaking(remote, status.is_speaking)
                .to_text()
            {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "failed to encode relayed speaking status");
                    return;
                }
            };
            for (peer_id, peer) in self.peers.iter_mut() {
                if peer_id == remote {
                    continue;
                }
                if let Err(err) = peer.send_data(relayed.clone()).await {
                    debug!(remote = %peer_id, error = %err, "speaking relay not sent");
                }
            }
        } else {
            let subject = status.user_id.unwrap_or_else(|| remote.to_string());
            self.participants.set_speaking(&subject, status.is_speaking);
        }
    }

    fn on_remote_mute(&mut self, payload: MuteStatusPayload) {
        if payload.user_id == self.local.id {
            return;
        }
        self.participants.set_muted(&payload.user_id, payload.is_muted);
        if !self.is_host() {
            return;
        }
        let sender = payload.sender_id.unwrap_or_default();
        let targets: Vec<UserId> = self
            .peers
            .keys()
            .filter(|id| **id != sender && **id != payload.user_id)
            .cloned()
            .collect();
        for target in targets {
            self.send_mute(&target, &payload.user_id, payload.is_muted);
        }
    }

    async fn on_host_changed(&mut self, new_host_id: UserId) {
        let was_host = self.is_host();
        match self.room.as_mut() {
            Some(room) if room.host_id == new_host_id => return,
            Some(room) => room.host_id = new_host_id.clone(),
            None => return,
        }
        info!(new_host = %new_host_id, was_host, "host changed");

        // The old star is gone with the old host.
        self.close_all_peers().await;
        self.relayed_tracks.clear();
        self.participants.clear_streams();

        if self.is_host() && !was_host {
            let peers = self.participants.user_ids();
            info!(peers = peers.len(), "taking over as host");
            self.admit_as_host(peers).await;
        }
    }

    async fn open_peer(&mut self, remote: &str) -> Result<(), PeerError> {
        self.next_generation += 1;
        let link = PeerLink {
            local: self.local.id.clone(),
            remote: remote.to_string(),
            generation: self.next_generation,
        };
        let transport = self
            .factory
            .open(link.clone(), self.peer_events.clone())
            .await?;
        let peer = PeerConnection::new(link, transport, self.signals.clone());
        if let Some(mut previous) = self.peers.insert(remote.to_string(), peer) {
            previous.close().await;
        }
        Ok(())
    }

    async fn drop_peer(&mut self, remote: &str) {
        if let Some(mut peer) = self.peers.remove(remote) {
            peer.close().await;
        }
    }

    /// Transport failure or stall: forget the connection and its stream. The
    /// host reconnects right away since participants never initiate.
    async fn abandon_peer(&mut self, remote: &str) {
        self.forget_link(remote).await;
        if self.is_host() && self.participants.get(remote).is_some() {
            self.admit_as_host(vec![remote.to_string()]).await;
        }
    }

    /// Closes the connection to `remote` and detaches every stream that came
    /// in over it. For a participant that is every stream the host relayed.
    async fn forget_link(&mut self, remote: &str) {
        self.drop_peer(remote).await;
        self.relayed_tracks.remove(remote);
        let via_host = self.room.as_ref().is_some_and(|room| room.host_id == remote);
        if via_host && !self.is_host() {
            self.participants.clear_streams();
        } else {
            self.participants.detach_stream(remote);
        }
    }

    async fn close_all_peers(&mut self) {
        for (_, mut peer) in self.peers.drain() {
            peer.close().await;
        }
    }

    fn send_mute(&self, target: &str, user_id: &str, muted: bool) {
        let message = ClientMessage::MuteStatusChanged(MuteStatusPayload {
            user_id: user_id.to_string(),
            is_muted: muted,
            target_user_id: Some(target.to_string()),
            sender_id: None,
        });
        if self.signals.send(message).is_err() {
            debug!(target = %target, "signaling closed; mute status not sent");
        }
    }

    fn send_stream_map(&self, target: &str, entries: BTreeMap<String, UserId>) {
        if entries.is_empty() {
            return;
        }
        let message = ClientMessage::StreamIdMap(StreamIdMapPayload {
            target_user_id: Some(target.to_string()),
            sender_id: None,
            entries,
        });
        if self.signals.send(message).is_err() {
            debug!(target = %target, "signaling closed; stream map not sent");
        }
    }
}
