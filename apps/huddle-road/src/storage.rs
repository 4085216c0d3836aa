use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use huddle_proto::{RoomId, RoomType, UserId};
use parking_lot::Mutex;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;

use crate::error::PersistenceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
    pub host_id: UserId,
    pub room_type: RoomType,
}

/// Durable room records. Only host and type survive; membership lives in
/// memory.
#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn query(&self, room_id: &str) -> Result<Option<RoomRecord>, PersistenceError>;

    /// Creates the record or moves its host. An existing room type is kept.
    async fn upsert_room(
        &self,
        room_id: &str,
        host_id: &str,
        room_type: RoomType,
    ) -> Result<(), PersistenceError>;

    async fn update_host(&self, room_id: &str, host_id: &str) -> Result<(), PersistenceError>;

    async fn delete_room(&self, room_id: &str) -> Result<(), PersistenceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Upsert { room_id: RoomId, host_id: UserId },
    UpdateHost { room_id: RoomId, host_id: UserId },
    Delete { room_id: RoomId },
}

/// Process-local store used when no database is configured.
#[derive(Default)]
pub struct MemoryRoomStore {
    rooms: Mutex<HashMap<RoomId, RoomRecord>>,
    ops: Mutex<Vec<StoreOp>>,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, room_id: &str, record: RoomRecord) {
        self.rooms.lock().insert(room_id.to_string(), record);
    }

    pub fn get(&self, room_id: &str) -> Option<RoomRecord> {
        self.rooms.lock().get(room_id).cloned()
    }

    /// Mutations applied so far, oldest first.
    pub fn operations(&self) -> Vec<StoreOp> {
        self.ops.lock().clone()
    }
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    async fn query(&self, room_id: &str) -> Result<Option<RoomRecord>, PersistenceError> {
        Ok(self.get(room_id))
    }

    async fn upsert_room(
        &self,
        room_id: &str,
        host_id: &str,
        room_type: RoomType,
    ) -> Result<(), PersistenceError> {
        self.rooms
            .lock()
            .entry(room_id.to_string())
            .and_modify(|record| record.host_id = host_id.to_string())
            .or_insert_with(|| RoomRecord {
                host_id: host_id.to_string(),
                room_type,
            });
        self.ops.lock().push(StoreOp::Upsert {
            room_id: room_id.to_string(),
            host_id: host_id.to_string(),
        });
        Ok(())
    }

    async fn update_host(&self, room_id: &str, host_id: &str) -> Result<(), PersistenceError> {
        if let Some(record) = self.rooms.lock().get_mut(room_id) {
            record.host_id = host_id.to_string();
        }
        self.ops.lock().push(StoreOp::UpdateHost {
            room_id: room_id.to_string(),
            host_id: host_id.to_string(),
        });
        Ok(())
    }

    async fn delete_room(&self, room_id: &str) -> Result<(), PersistenceError> {
        self.rooms.lock().remove(room_id);
        self.ops.lock().push(StoreOp::Delete {
            room_id: room_id.to_string(),
        });
        Ok(())
    }
}

pub struct PgRoomStore {
    pool: PgPool,
}

impl PgRoomStore {
    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("room store migrations applied");
        Ok(Self { pool })
    }
}

#[async_trait]
impl RoomStore for PgRoomStore {
    async fn query(&self, room_id: &str) -> Result<Option<RoomRecord>, PersistenceError> {
        let row = sqlx::query("SELECT host_id, room_type FROM rooms WHERE id = $1")
            .bind(room_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let host_id: String = row.try_get("host_id")?;
        let raw_type: String = row.try_get("room_type")?;
        let room_type =
            RoomType::from_str(&raw_type).map_err(|_| PersistenceError::InvalidRoomType {
                room_id: room_id.to_string(),
                value: raw_type.clone(),
            })?;
        Ok(Some(RoomRecord { host_id, room_type }))
    }

    async fn upsert_room(
        &self,
        room_id: &str,
        host_id: &str,
        room_type: RoomType,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO rooms (id, host_id, room_type) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET host_id = EXCLUDED.host_id, updated_at = now()",
        )
        .bind(room_id)
        .bind(host_id)
        .bind(room_type.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_host(&self, room_id: &str, host_id: &str) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE rooms SET host_id = $1, updated_at = now() WHERE id = $2")
            .bind(host_id)
            .bind(room_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_room(&self, room_id: &str) -> Result<(), PersistenceError> {
        sqlx::query("DELETE FROM rooms WHERE id = $1")
            .bind(room_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
