use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::Message;

// -- History --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Paginated history request. Exactly one of `from_time`, `to_time` and
/// `offset` is set; `order` is `Asc` only when `from_time` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    pub conversation_id: i64,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub messages: Vec<Message>,
}

// -- Reactions --

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionSummaryRequest {
    pub message_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ReactionSummaryResponse {
    /// Keyed by message id.
    pub summaries: HashMap<i64, Vec<ReactionGroup>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    #[serde(default)]
    pub user_ids: Vec<i64>,
}
