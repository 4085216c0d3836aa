use serde::{Deserialize, Serialize};

use crate::envelope::ProtoError;
use crate::UserId;

/// Speaking state. `user_id` is absent when a peer reports its own state and
/// set when the host relays someone else's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakingStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub is_speaking: bool,
}

/// Messages carried on the reliable data channel of a peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum SideChannelMessage {
    #[serde(rename = "speaking_status")]
    SpeakingStatus(SpeakingStatus),
}

impl SideChannelMessage {
    pub fn speaking(is_speaking: bool) -> Self {
        SideChannelMessage::SpeakingStatus(SpeakingStatus {
            user_id: None,
            is_speaking,
        })
    }

    pub fn relayed_speaking(user_id: &str, is_speaking: bool) -> Self {
        SideChannelMessage::SpeakingStatus(SpeakingStatus {
            user_id: Some(user_id.to_string()),
            is_speaking,
        })
    }

    pub fn to_text(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(text)?)
    }
}
