use serde::{Deserialize, Serialize};

/// A message as delivered by the history endpoint and the push gateway.
/// `time` is the server timestamp in milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub unique_id: String,
    pub conversation_id: i64,
    pub owner_id: i64,
    pub time: u64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub delivered: bool,
    #[serde(default)]
    pub seen: bool,
    #[serde(default)]
    pub pinned: bool,
}

/// Conversation metadata the history view is opened against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMeta {
    pub id: i64,
    #[serde(default)]
    pub last_seen_message_id: i64,
    #[serde(default)]
    pub last_seen_message_time: u64,
    #[serde(default)]
    pub last_message_id: i64,
    #[serde(default)]
    pub last_message_time: u64,
    #[serde(default)]
    pub unread_count: u64,
    #[serde(default)]
    pub pinned_message: Option<PinnedMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinnedMessage {
    pub message_id: i64,
    pub time: u64,
}
