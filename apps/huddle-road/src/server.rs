use std::collections::HashMap;
use std::sync::Arc;

use huddle_proto::{
    kind, AuthErrorPayload, AuthenticatePayload, AuthenticatedPayload, Envelope,
    HostChangedPayload, JoinPayload, RoomInfoPayload, RoomType, ServerMessage, UserJoinedPayload,
    UserLeftPayload, UserProfile,
};
use metrics::{counter, gauge};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::error::{PersistenceError, RouteError};
use crate::registry::{ConnectionId, RoomRegistry, RoomSnapshot};
use crate::router::MessageRouter;
use crate::storage::RoomStore;

#[derive(Debug)]
pub enum ServerEvent {
    Connected {
        connection_id: ConnectionId,
        outbound: mpsc::UnboundedSender<Envelope>,
    },
    Frame {
        connection_id: ConnectionId,
        text: String,
    },
    Disconnected {
        connection_id: ConnectionId,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<RoomSnapshot>>,
    },
}

struct Connection {
    outbound: mpsc::UnboundedSender<Envelope>,
    user: Option<UserProfile>,
}

/// Owns every room and connection. All mutation happens on the task that
/// drives [`SessionServer::run`], one event at a time.
pub struct SessionServer {
    registry: RoomRegistry,
    connections: HashMap<ConnectionId, Connection>,
    store: Arc<dyn RoomStore>,
    auth: Arc<dyn Authenticator>,
    router: MessageRouter,
}

impl SessionServer {
    pub fn new(store: Arc<dyn RoomStore>, auth: Arc<dyn Authenticator>) -> Self {
        Self {
            registry: RoomRegistry::new(),
            connections: HashMap::new(),
            store,
            auth,
            router: MessageRouter::with_default_handlers(),
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Moves the server onto its own task and returns the handle used to
    /// feed it events.
    pub fn spawn(self) -> ServerHandle {
        let (events, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.run(rx));
        ServerHandle { events }
    }

    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<ServerEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        debug!("session server event loop finished");
    }

    pub async fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Connected {
                connection_id,
                outbound,
            } => self.connect(connection_id, outbound),
            ServerEvent::Frame {
                connection_id,
                text,
            } => self.handle_frame(connection_id, &text).await,
            ServerEvent::Disconnected { connection_id } => self.disconnect(connection_id).await,
            ServerEvent::Snapshot { reply } => {
                let _ = reply.send(self.registry.snapshot());
            }
        }
    }

    pub fn connect(&mut self, connection_id: ConnectionId, outbound: mpsc::UnboundedSender<Envelope>) {
        self.connections.insert(
            connection_id,
            Connection {
                outbound,
                user: None,
            },
        );
        gauge!("huddle_road_connections_active", self.connections.len() as f64);
        debug!(connection_id = %connection_id, "connection registered");
    }

    pub async fn disconnect(&mut self, connection_id: ConnectionId) {
        self.leave(connection_id).await;
        if self.connections.remove(&connection_id).is_some() {
            gauge!("huddle_road_connections_active", self.connections.len() as f64);
            debug!(connection_id = %connection_id, "connection removed");
        }
    }

    pub async fn handle_frame(&mut self, connection_id: ConnectionId, text: &str) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "dropping malformed frame");
                return;
            }
        };
        let Some(handler) = self.router.handler(&envelope.kind) else {
            debug!(
                connection_id = %connection_id,
                kind = %envelope.kind,
                "ignoring unknown message type"
            );
            return;
        };

        let kind = envelope.kind.clone();
        if let Err(err) = handler(self, connection_id, envelope).await {
            if err.is_routine() {
                debug!(connection_id = %connection_id, kind = %kind, error = %err, "message dropped");
            } else {
                warn!(connection_id = %connection_id, kind = %kind, error = %err, "message rejected");
            }
        }
    }

    pub(crate) async fn authenticate(
        &mut self,
        connection_id: ConnectionId,
        envelope: Envelope,
    ) -> Result<(), RouteError> {
        let payload: AuthenticatePayload = envelope.decode_payload()?;
        let reply = match self.auth.verify(&payload.token) {
            Ok(user) => {
                info!(connection_id = %connection_id, user_id = %user.id, "connection authenticated");
                if let Some(connection) = self.connections.get_mut(&connection_id) {
                    connection.user = Some(user.clone());
                }
                ServerMessage::Authenticated(AuthenticatedPayload { user })
            }
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "authentication failed");
                ServerMessage::AuthError(AuthErrorPayload {
                    reason: err.to_string(),
                })
            }
        };
        self.send(connection_id, &reply);
        Ok(())
    }

    pub(crate) async fn join(
        &mut self,
        connection_id: ConnectionId,
        envelope: Envelope,
    ) -> Result<(), RouteError> {
        let payload: JoinPayload = envelope.decode_payload()?;
        let connection = self
            .connections
            .get(&connection_id)
            .ok_or(RouteError::Unauthenticated)?;
        let user = if self.auth.trusts_client_profile() {
            payload.user.or_else(|| connection.user.clone())
        } else {
            connection.user.clone()
        }
        .ok_or(RouteError::Unauthenticated)?;
        let room_id = payload.room_id;

        if let Some(current) = self.registry.room_of(connection_id).map(|r| r.id.clone()) {
            if current == room_id {
                self.send_room_info(connection_id, &room_id);
                return Ok(());
            }
            self.leave(connection_id).await;
        }

        let room_type = match self.registry.get(&room_id) {
            Some(room) => room.room_type,
            None => self.resolve_room_type(&room_id, payload.room_type).await,
        };

        let outcome = self
            .registry
            .insert_member(&room_id, room_type, connection_id, user.clone());
        if let Some(previous) = outcome.replaced {
            info!(
                room_id = %room_id,
                user_id = %user.id,
                previous = %previous,
                "user rejoined from a new connection"
            );
        }
        gauge!("huddle_road_rooms_active", self.registry.len() as f64);

        let host_id = self
            .registry
            .get(&room_id)
            .map(|room| room.host_id.clone())
            .unwrap_or_else(|| user.id.clone());
        if let Err(err) = self.store.upsert_room(&room_id, &host_id, room_type).await {
            persistence_failed("upsert_room", &room_id, &err);
        }

        info!(
            room_id = %room_id,
            user_id = %user.id,
            host_id = %host_id,
            created = outcome.created,
            "user joined room"
        );
        self.send_room_info(connection_id, &room_id);

        // Also sent on replacement: the host has to onboard the new socket.
        let joined = ServerMessage::UserJoined(UserJoinedPayload { user });
        self.broadcast(&room_id, Some(connection_id), &joined);
        Ok(())
    }

    /// Removes the connection from its room, electing a new host or dropping
    /// the room as needed. A no-op for connections outside any room.
    pub(crate) async fn leave(&mut self, connection_id: ConnectionId) {
        let Some(departure) = self.registry.remove_member(connection_id) else {
            return;
        };
        gauge!("huddle_road_rooms_active", self.registry.len() as f64);
        info!(
            room_id = %departure.room_id,
            user_id = %departure.user.id,
            remaining = departure.remaining.len(),
            "user left room"
        );

        let left = ServerMessage::UserLeft(UserLeftPayload {
            user_id: departure.user.id.clone(),
        });
        for recipient in &departure.remaining {
            self.send(*recipient, &left);
        }

        if departure.emptied {
            if departure.room_type == RoomType::Group {
                if let Err(err) = self.store.delete_room(&departure.room_id).await {
                    persistence_failed("delete_room", &departure.room_id, &err);
                }
            }
            return;
        }

        if let Some(new_host) = departure.new_host {
            counter!("huddle_road_host_elections_total", 1);
            info!(room_id = %departure.room_id, new_host = %new_host, "host elected");
            if let Err(err) = self.store.update_host(&departure.room_id, &new_host).await {
                persistence_failed("update_host", &departure.room_id, &err);
            }
            let changed = ServerMessage::HostChanged(HostChangedPayload {
                new_host_id: new_host,
            });
            for recipient in &departure.remaining {
                self.send(*recipient, &changed);
            }
        }
    }

    /// Forwards a peer-to-peer message inside the sender's room, tagged with
    /// the sender's user id.
    pub(crate) async fn relay(
        &mut self,
        connection_id: ConnectionId,
        mut envelope: Envelope,
    ) -> Result<(), RouteError> {
        let room = self
            .registry
            .room_of(connection_id)
            .ok_or(RouteError::NotInRoom)?;
        let room_id = room.id.clone();
        let sender_id = room
            .members
            .iter()
            .find(|m| m.connection_id == connection_id)
            .map(|m| m.user.id.clone())
            .ok_or(RouteError::NotInRoom)?;

        let payload = envelope.payload_object_mut()?;
        payload.insert("senderId".into(), Value::String(sender_id));
        let target = payload
            .get("targetUserId")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let message_kind = envelope.kind.clone();

        match target {
            Some(target) => {
                let recipient = self
                    .registry
                    .get(&room_id)
                    .and_then(|room| room.connection_of(&target));
                let delivered = recipient
                    .map(|recipient| self.deliver(recipient, envelope))
                    .unwrap_or(false);
                if !delivered {
                    counter!("huddle_road_relays_dropped_total", 1, "type" => message_kind);
                    return Err(RouteError::TargetUnavailable { target, room_id });
                }
                counter!("huddle_road_relays_total", 1, "type" => message_kind);
            }
            None if message_kind == kind::MUTE_STATUS_CHANGED => {
                let recipients: Vec<ConnectionId> = self
                    .registry
                    .get(&room_id)
                    .map(|room| room.connections().filter(|c| *c != connection_id).collect())
                    .unwrap_or_default();
                for recipient in recipients {
                    self.deliver(recipient, envelope.clone());
                }
                counter!("huddle_road_relays_total", 1, "type" => message_kind);
            }
            None => {
                return Err(RouteError::MissingTarget {
                    kind: message_kind,
                })
            }
        }
        Ok(())
    }

    async fn resolve_room_type(&self, room_id: &str, requested: Option<RoomType>) -> RoomType {
        match self.store.query(room_id).await {
            Ok(Some(record)) => record.room_type,
            Ok(None) => requested.unwrap_or_default(),
            Err(err) => {
                persistence_failed("query", room_id, &err);
                requested.unwrap_or_default()
            }
        }
    }

    fn send_room_info(&self, connection_id: ConnectionId, room_id: &str) {
        if let Some(room) = self.registry.get(room_id) {
            let info = ServerMessage::RoomInfo(RoomInfoPayload {
                room: room.summary(),
                participants: room.participants(),
            });
            self.send(connection_id, &info);
        }
    }

    fn broadcast(&self, room_id: &str, except: Option<ConnectionId>, message: &ServerMessage) {
        let Some(room) = self.registry.get(room_id) else {
            return;
        };
        for recipient in room.connections().filter(|c| Some(*c) != except) {
            self.send(recipient, message);
        }
    }

    fn send(&self, connection_id: ConnectionId, message: &ServerMessage) -> bool {
        match message.to_envelope() {
            Ok(envelope) => self.deliver(connection_id, envelope),
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "failed to encode server message");
                false
            }
        }
    }

    fn deliver(&self, connection_id: ConnectionId, envelope: Envelope) -> bool {
        match self.connections.get(&connection_id) {
            Some(connection) => connection.outbound.send(envelope).is_ok(),
            None => false,
        }
    }
}

fn persistence_failed(op: &'static str, room_id: &str, err: &PersistenceError) {
    counter!("huddle_road_persistence_errors_total", 1, "op" => op);
    warn!(op, room_id = %room_id, error = %err, "room store call failed");
}

/// Cloneable front door to a spawned [`SessionServer`].
#[derive(Clone)]
pub struct ServerHandle {
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl ServerHandle {
    pub fn connect(&self, connection_id: ConnectionId) -> mpsc::UnboundedReceiver<Envelope> {
        let (outbound, rx) = mpsc::unbounded_channel();
        let _ = self.events.send(ServerEvent::Connected {
            connection_id,
            outbound,
        });
        rx
    }

    pub fn frame(&self, connection_id: ConnectionId, text: String) {
        let _ = self.events.send(ServerEvent::Frame {
            connection_id,
            text,
        });
    }

    pub fn disconnect(&self, connection_id: ConnectionId) {
        let _ = self.events.send(ServerEvent::Disconnected { connection_id });
    }

    pub async fn snapshot(&self) -> Vec<RoomSnapshot> {
        let (reply, rx) = oneshot::channel();
        if self.events.send(ServerEvent::Snapshot { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}
