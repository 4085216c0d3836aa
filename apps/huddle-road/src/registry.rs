use std::collections::HashMap;

use huddle_proto::{RoomId, RoomSummary, RoomType, UserId, UserProfile};
use serde::Serialize;
use uuid::Uuid;

pub type ConnectionId = Uuid;

#[derive(Debug, Clone)]
pub struct Member {
    pub connection_id: ConnectionId,
    pub user: UserProfile,
}

/// Live room state. `members` is kept in join order; election picks the
/// earliest remaining member.
#[derive(Debug, Clone)]
pub struct Room {
    pub id: RoomId,
    pub host_id: UserId,
    pub room_type: RoomType,
    pub members: Vec<Member>,
}

impl Room {
    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            id: self.id.clone(),
            host_id: self.host_id.clone(),
            room_type: self.room_type,
        }
    }

    pub fn participants(&self) -> Vec<UserProfile> {
        self.members.iter().map(|m| m.user.clone()).collect()
    }

    pub fn connection_of(&self, user_id: &str) -> Option<ConnectionId> {
        self.members
            .iter()
            .find(|m| m.user.id == user_id)
            .map(|m| m.connection_id)
    }

    pub fn connections(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.members.iter().map(|m| m.connection_id)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub id: RoomId,
    pub host_id: UserId,
    pub room_type: RoomType,
    pub members: Vec<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    pub created: bool,
    /// The user was already present under another connection, which this
    /// join displaced.
    pub replaced: Option<ConnectionId>,
}

#[derive(Debug, Clone)]
pub struct Departure {
    pub room_id: RoomId,
    pub user: UserProfile,
    pub room_type: RoomType,
    pub remaining: Vec<ConnectionId>,
    pub emptied: bool,
    pub new_host: Option<UserId>,
}

#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, Room>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn room_of(&self, connection_id: ConnectionId) -> Option<&Room> {
        self.rooms
            .values()
            .find(|room| room.connections().any(|c| c == connection_id))
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Adds a member, creating the room with the joiner as host if needed.
    pub fn insert_member(
        &mut self,
        room_id: &str,
        room_type: RoomType,
        connection_id: ConnectionId,
        user: UserProfile,
    ) -> JoinOutcome {
        let mut created = false;
        let room = self.rooms.entry(room_id.to_string()).or_insert_with(|| {
            created = true;
            Room {
                id: room_id.to_string(),
                host_id: user.id.clone(),
                room_type,
                members: Vec::new(),
            }
        });

        if let Some(existing) = room.members.iter_mut().find(|m| m.user.id == user.id) {
            let previous = existing.connection_id;
            existing.connection_id = connection_id;
            existing.user = user;
            return JoinOutcome {
                created,
                replaced: Some(previous),
            };
        }

        room.members.push(Member {
            connection_id,
            user,
        });
        JoinOutcome {
            created,
            replaced: None,
        }
    }

    /// Removes the connection from whichever room holds it. Empty rooms are
    /// dropped; a departing host is replaced by the earliest remaining member.
    pub fn remove_member(&mut self, connection_id: ConnectionId) -> Option<Departure> {
        let room_id = self.room_of(connection_id)?.id.clone();
        let room = self.rooms.get_mut(&room_id)?;
        let index = room
            .members
            .iter()
            .position(|m| m.connection_id == connection_id)?;
        let member = room.members.remove(index);

        let emptied = room.members.is_empty();
        let mut new_host = None;
        if !emptied && room.host_id == member.user.id {
            let next = room.members[0].user.id.clone();
            room.host_id = next.clone();
            new_host = Some(next);
        }

        let departure = Departure {
            room_id: room_id.clone(),
            user: member.user,
            room_type: room.room_type,
            remaining: room.connections().collect(),
            emptied,
            new_host,
        };
        if emptied {
            self.rooms.remove(&room_id);
        }
        Some(departure)
    }

    pub fn snapshot(&self) -> Vec<RoomSnapshot> {
        let mut rooms: Vec<RoomSnapshot> = self
            .rooms
            .values()
            .map(|room| RoomSnapshot {
                id: room.id.clone(),
                host_id: room.host_id.clone(),
                room_type: room.room_type,
                members: room.members.iter().map(|m| m.user.id.clone()).collect(),
            })
            .collect();
        rooms.sort_by(|a, b| a.id.cmp(&b.id));
        rooms
    }
}
