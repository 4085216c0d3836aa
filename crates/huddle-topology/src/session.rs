use std::sync::Arc;
use std::time::Duration;

use huddle_proto::{
    AuthenticatePayload, ClientMessage, JoinPayload, RoomId, RoomType, ServerMessage, UserProfile,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::SignalingError;
use crate::manager::{TopologyManager, TopologySnapshot};
use crate::rtc::RtcTransportFactory;
use crate::signaling::SignalingClient;
use crate::transport::{MediaTrack, PeerEvent};

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const WATCHDOG_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub room_id: RoomId,
    /// Only consulted when the room has no record on the server yet.
    pub room_type: Option<RoomType>,
}

impl JoinRequest {
    pub fn group(room_id: impl Into<RoomId>) -> Self {
        Self {
            room_id: room_id.into(),
            room_type: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    SetSpeaking(bool),
    SetMuted(bool),
    Leave,
}

/// A joined voice room: the signaling socket, the topology manager and the
/// event loop driving them.
pub struct ClientSession {
    user: UserProfile,
    commands: mpsc::UnboundedSender<SessionCommand>,
    snapshots: watch::Receiver<TopologySnapshot>,
    task: Option<JoinHandle<()>>,
}

impl ClientSession {
    pub async fn connect(
        config: ClientConfig,
        token: &str,
        join: JoinRequest,
        local_track: Option<MediaTrack>,
    ) -> Result<Self, SignalingError> {
        let (signaling, mut inbound) = SignalingClient::connect(&config.signaling_url).await?;
        signaling.send(ClientMessage::Authenticate(AuthenticatePayload {
            token: token.to_string(),
        }))?;
        let user = tokio::time::timeout(AUTH_TIMEOUT, wait_for_identity(&mut inbound))
            .await
            .map_err(|_| SignalingError::AuthTimeout)??;
        info!(user_id = %user.id, "authenticated");

        let factory = Arc::new(RtcTransportFactory::new(&config.ice_servers)?);
        let (manager, peer_events) = TopologyManager::new(
            user.clone(),
            local_track,
            factory,
            signaling.sender(),
            config,
        );
        signaling.send(ClientMessage::Join(JoinPayload {
            room_id: join.room_id.clone(),
            user: Some(user.clone()),
            room_type: join.room_type,
        }))?;
        info!(room_id = %join.room_id, "join requested");

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshots) = watch::channel(manager.snapshot());
        let task = tokio::spawn(run_session(
            signaling,
            inbound,
            manager,
            peer_events,
            commands_rx,
            snapshot_tx,
        ));

        Ok(Self {
            user,
            commands,
            snapshots,
            task: Some(task),
        })
    }

    pub fn user(&self) -> &UserProfile {
        &self.user
    }

    pub fn set_speaking(&self, speaking: bool) -> Result<(), SignalingError> {
        self.command(SessionCommand::SetSpeaking(speaking))
    }

    pub fn set_muted(&self, muted: bool) -> Result<(), SignalingError> {
        self.command(SessionCommand::SetMuted(muted))
    }

    /// Latest participant view; use [`watch`](Self::watch) to follow changes.
    pub fn snapshot(&self) -> TopologySnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<TopologySnapshot> {
        self.snapshots.clone()
    }

    /// Leaves the room and waits for the event loop to finish.
    pub async fn leave(mut self) {
        if self.command(SessionCommand::Leave).is_err() {
            debug!("session loop already stopped");
        }
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "session loop ended abnormally");
            }
        }
    }

    fn command(&self, command: SessionCommand) -> Result<(), SignalingError> {
        self.commands
            .send(command)
            .map_err(|_| SignalingError::Closed)
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn wait_for_identity(
    inbound: &mut mpsc::UnboundedReceiver<ServerMessage>,
) -> Result<UserProfile, SignalingError> {
    while let Some(message) = inbound.recv().await {
        match message {
            ServerMessage::Authenticated(payload) => return Ok(payload.user),
            ServerMessage::AuthError(payload) => {
                return Err(SignalingError::AuthRejected(payload.reason))
            }
            other => debug!(message = ?other, "ignoring message before authentication"),
        }
    }
    Err(SignalingError::Closed)
}

async fn run_session(
    signaling: SignalingClient,
    mut inbound: mpsc::UnboundedReceiver<ServerMessage>,
    mut manager: TopologyManager,
    mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    snapshots: watch::Sender<TopologySnapshot>,
) {
    let mut watchdog = tokio::time::interval(WATCHDOG_TICK);
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let keep_running = tokio::select! {
            message = inbound.recv() => match message {
                Some(message) => {
                    if let Err(err) = manager.handle_server_message(message).await {
                        warn!(error = %err, "server message not applied");
                    }
                    true
                }
                None => {
                    warn!(url = %signaling.url(), "signaling connection lost");
                    manager.reset().await;
                    false
                }
            },
            Some(event) = peer_events.recv() => {
                if let Err(err) = manager.handle_peer_event(event).await {
                    warn!(error = %err, "peer event not applied");
                }
                true
            }
            command = commands.recv() => match command {
                Some(SessionCommand::SetSpeaking(speaking)) => {
                    manager.set_local_speaking(speaking).await;
                    true
                }
                Some(SessionCommand::SetMuted(muted)) => {
                    manager.set_local_muted(muted);
                    true
                }
                Some(SessionCommand::Leave) | None => {
                    manager.leave().await;
                    false
                }
            },
            _ = watchdog.tick() => {
                let stalled = manager.reap_stalled_negotiations(Instant::now()).await;
                if !stalled.is_empty() {
                    debug!(peers = ?stalled, "stalled negotiations reaped");
                }
                true
            }
        };

        let next = manager.snapshot();
        snapshots.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if !keep_running {
            break;
        }
    }
    signaling.close().await;
    info!("session loop stopped");
}
