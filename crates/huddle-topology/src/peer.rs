use std::time::Duration;

use huddle_proto::{ClientMessage, IceCandidate, IceCandidatePayload, SessionDescriptionPayload};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::PeerError;
use crate::transport::{MediaTrack, PeerLink, SdpKind, SessionTransport, TransportState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    OfferSent,
    AnswerSent,
    Connected,
    Closed,
}

/// Negotiation state for the single transport session to one remote user.
///
/// Offers are serialized per connection: a second `create_offer` while one is
/// outstanding is coalesced into a single follow-up offer. When both ends
/// offer at once the side with the lower user id is polite and yields.
pub struct PeerConnection {
    link: PeerLink,
    transport: Box<dyn SessionTransport>,
    signals: mpsc::UnboundedSender<ClientMessage>,
    state: NegotiationState,
    polite: bool,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    channel_open: bool,
    pending_messages: Vec<String>,
    renegotiation_pending: bool,
    transport_connected: bool,
    negotiation_started: Option<Instant>,
}

impl PeerConnection {
    pub fn new(
        link: PeerLink,
        transport: Box<dyn SessionTransport>,
        signals: mpsc::UnboundedSender<ClientMessage>,
    ) -> Self {
        let polite = link.local < link.remote;
        Self {
            link,
            transport,
            signals,
            state: NegotiationState::New,
            polite,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            channel_open: false,
            pending_messages: Vec::new(),
            renegotiation_pending: false,
            transport_connected: false,
            negotiation_started: None,
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.link.remote
    }

    pub fn generation(&self) -> u64 {
        self.link.generation
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_polite(&self) -> bool {
        self.polite
    }

    pub fn is_closed(&self) -> bool {
        self.state == NegotiationState::Closed
    }

    pub async fn create_offer(&mut self) -> Result<(), PeerError> {
        match self.state {
            NegotiationState::Closed => return Err(self.closed()),
            NegotiationState::OfferSent | NegotiationState::AnswerSent => {
                debug!(remote = %self.link.remote, state = ?self.state, "deferring offer");
                self.renegotiation_pending = true;
                return Ok(());
            }
            NegotiationState::New | NegotiationState::Connected => {}
        }

        let sdp = self.transport.create_offer().await?;
        self.signal(ClientMessage::Offer(SessionDescriptionPayload::to(
            &self.link.remote,
            sdp,
        )))?;
        self.state = NegotiationState::OfferSent;
        self.negotiation_started = Some(Instant::now());
        debug!(remote = %self.link.remote, "offer sent");
        Ok(())
    }

    pub async fn handle_offer(&mut self, sdp: String) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(self.closed());
        }
        if self.state == NegotiationState::OfferSent {
            if !self.polite {
                debug!(remote = %self.link.remote, "ignoring colliding offer");
                return Ok(());
            }
            debug!(remote = %self.link.remote, "offer collision; rolling back local offer");
            self.transport.rollback().await?;
            self.renegotiation_pending = true;
        }

        self.transport
            .set_remote_description(SdpKind::Offer, sdp)
            .await?;
        self.remote_description_set = true;
        self.flush_candidates().await;

        let answer = self.transport.create_answer().await?;
        self.signal(ClientMessage::Answer(SessionDescriptionPayload::to(
            &self.link.remote,
            answer,
        )))?;

        if self.transport_connected {
            self.state = NegotiationState::Connected;
            self.negotiation_started = None;
        } else {
            self.state = NegotiationState::AnswerSent;
            self.negotiation_started = Some(Instant::now());
        }
        self.settle().await
    }

    pub async fn handle_answer(&mut self, sdp: String) -> Result<(), PeerError> {
        if self.state != NegotiationState::OfferSent {
            return Err(PeerError::UnexpectedAnswer {
                remote: self.link.remote.clone(),
                state: self.state,
            });
        }
        self.transport
            .set_remote_description(SdpKind::Answer, sdp)
            .await?;
        self.remote_description_set = true;
        self.flush_candidates().await;
        self.state = NegotiationState::Connected;
        self.negotiation_started = None;
        self.settle().await
    }

    /// Candidates that arrive before any remote description are held until
    /// one is applied.
    pub async fn handle_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), PeerError> {
        if self.is_closed() {
            return Ok(());
        }
        if !self.remote_description_set {
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        self.transport.add_ice_candidate(candidate).await
    }

    pub fn send_local_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        if self.is_closed() {
            return Ok(());
        }
        self.signal(ClientMessage::IceCandidate(IceCandidatePayload {
            candidate,
            target_user_id: Some(self.link.remote.clone()),
            sender_id: None,
        }))
    }

    pub async fn add_track(&mut self, track: &MediaTrack) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(self.closed());
        }
        self.transport.add_track(track).await
    }

    pub async fn create_data_channel(&mut self, label: &str) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(self.closed());
        }
        self.transport.create_data_channel(label).await
    }

    /// Queues the message until the side channel opens. Dropped once closed.
    pub async fn send_data(&mut self, text: String) -> Result<(), PeerError> {
        if self.is_closed() {
            return Ok(());
        }
        if !self.channel_open {
            self.pending_messages.push(text);
            return Ok(());
        }
        self.transport.send_data(&text).await
    }

    pub async fn on_channel_open(&mut self) {
        if self.is_closed() {
            return;
        }
        self.channel_open = true;
        for text in std::mem::take(&mut self.pending_messages) {
            if let Err(err) = self.transport.send_data(&text).await {
                warn!(remote = %self.link.remote, error = %err, "side channel send failed");
            }
        }
    }

    pub async fn on_transport_state(&mut self, state: TransportState) -> Result<(), PeerError> {
        match state {
            TransportState::Connected => {
                self.transport_connected = true;
                if self.state == NegotiationState::AnswerSent {
                    self.state = NegotiationState::Connected;
                    self.negotiation_started = None;
                    return self.settle().await;
                }
            }
            TransportState::Disconnected => self.transport_connected = false,
            TransportState::Failed | TransportState::Closed => {
                self.close().await;
            }
            TransportState::Connecting => {}
        }
        Ok(())
    }

    /// Tears down the transport. Returns false if it was already closed.
    pub async fn close(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.state = NegotiationState::Closed;
        self.pending_candidates.clear();
        self.pending_messages.clear();
        self.renegotiation_pending = false;
        self.negotiation_started = None;
        if let Err(err) = self.transport.close().await {
            warn!(remote = %self.link.remote, error = %err, "transport close failed");
        }
        debug!(remote = %self.link.remote, "peer connection closed");
        true
    }

    pub fn is_stalled(&self, now: Instant, timeout: Duration) -> bool {
        matches!(
            self.state,
            NegotiationState::OfferSent | NegotiationState::AnswerSent
        ) && self
            .negotiation_started
            .is_some_and(|started| now.saturating_duration_since(started) >= timeout)
    }

    async fn settle(&mut self) -> Result<(), PeerError> {
        if self.state == NegotiationState::Connected && self.renegotiation_pending {
            self.renegotiation_pending = false;
            return self.create_offer().await;
        }
        Ok(())
    }

    async fn flush_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(err) = self.transport.add_ice_candidate(candidate).await {
                warn!(remote = %self.link.remote, error = %err, "buffered candidate rejected");
            }
        }
    }

    fn signal(&self, message: ClientMessage) -> Result<(), PeerError> {
        self.signals
            .send(message)
            .map_err(|_| PeerError::SignalingClosed)
    }

    fn closed(&self) -> PeerError {
        PeerError::Closed(self.link.remote.clone())
    }
}
