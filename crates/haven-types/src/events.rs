use serde::{Deserialize, Serialize};

use crate::models::Message;

/// Push events sent by the gateway for conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PushEvent {
    /// A message was posted
    NewMessage { message: Message },

    /// A message's text was edited
    Edited { message: Message },

    /// One or more messages were deleted
    #[serde(rename_all = "camelCase")]
    Deleted {
        message_ids: Vec<i64>,
        conversation_id: i64,
    },

    /// A message sent by us reached the recipient's device.
    /// `unique_id` correlates to the send request when the id is not known yet.
    #[serde(rename_all = "camelCase")]
    Delivered {
        thread_id: i64,
        message_id: i64,
        #[serde(default)]
        unique_id: Option<String>,
    },

    /// A message sent by us was read
    #[serde(rename_all = "camelCase")]
    Seen {
        thread_id: i64,
        message_id: i64,
        #[serde(default)]
        unique_id: Option<String>,
    },

    /// A message was pinned in the conversation
    #[serde(rename_all = "camelCase")]
    Pinned {
        thread_id: i64,
        message_id: i64,
        time: u64,
    },

    /// The pinned message was cleared
    #[serde(rename_all = "camelCase")]
    Unpinned { thread_id: i64, message_id: i64 },
}

impl PushEvent {
    /// Returns the conversation this event belongs to.
    pub fn conversation_id(&self) -> i64 {
        match self {
            Self::NewMessage { message } | Self::Edited { message } => message.conversation_id,
            Self::Deleted {
                conversation_id, ..
            } => *conversation_id,
            Self::Delivered { thread_id, .. }
            | Self::Seen { thread_id, .. }
            | Self::Pinned { thread_id, .. }
            | Self::Unpinned { thread_id, .. } => *thread_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deleted_event_uses_gateway_envelope() {
        let json = r#"{"type":"Deleted","data":{"messageIds":[77,78],"conversationId":9}}"#;
        let event: PushEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            PushEvent::Deleted {
                message_ids: vec![77, 78],
                conversation_id: 9,
            }
        );
        assert_eq!(event.conversation_id(), 9);
    }

    #[test]
    fn receipt_correlation_key_is_optional() {
        let json = r#"{"type":"Seen","data":{"threadId":3,"messageId":12}}"#;
        let event: PushEvent = serde_json::from_str(json).unwrap();
        match event {
            PushEvent::Seen { unique_id, .. } => assert!(unique_id.is_none()),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
