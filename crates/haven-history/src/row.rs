use bytes::Bytes;
use chrono::{DateTime, NaiveDate};
use uuid::Uuid;

use haven_types::api::ReactionGroup;
use haven_types::models::Message;

/// Unique id of the unread banner. Only one banner exists per store.
pub const UNREAD_BANNER_ID: &str = "unread-banner";

const PREVIEW_MAX_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    Normal,
    /// Synthetic "unread messages" separator.
    UnreadBanner,
    /// Local message whose upload has not been confirmed by the server.
    Uploading,
}

/// Reaction counts for one row. `valid == false` means the summary must be
/// refetched the next time the row is relevant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReactionSummary {
    pub groups: Vec<ReactionGroup>,
    pub valid: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageRow {
    pub id: Option<i64>,
    pub unique_id: String,
    pub time: u64,
    pub owner_id: i64,
    pub conversation_id: i64,
    pub kind: RowKind,
    pub text: String,
    /// Derived from `text`.
    pub preview: String,
    pub delivered: bool,
    pub seen: bool,
    pub pinned: bool,
    pub edited: bool,
    pub reactions: ReactionSummary,
    pub avatar: Option<Bytes>,
    pub is_first_of_user_run: bool,
    pub is_last_of_user_run: bool,
    pub is_selected: bool,
    pub is_highlighted: bool,
}

impl MessageRow {
    pub fn from_message(message: Message) -> Self {
        let mut row = Self {
            id: Some(message.id),
            unique_id: message.unique_id,
            time: message.time,
            owner_id: message.owner_id,
            conversation_id: message.conversation_id,
            kind: RowKind::Normal,
            text: message.text,
            preview: String::new(),
            delivered: message.delivered || message.seen,
            seen: message.seen,
            pinned: message.pinned,
            edited: message.edited,
            reactions: ReactionSummary::default(),
            avatar: None,
            is_first_of_user_run: false,
            is_last_of_user_run: false,
            is_selected: false,
            is_highlighted: false,
        };
        row.refresh_derived();
        row
    }

    pub fn unread_banner(conversation_id: i64, time: u64) -> Self {
        Self {
            id: None,
            unique_id: UNREAD_BANNER_ID.to_string(),
            time,
            owner_id: 0,
            conversation_id,
            kind: RowKind::UnreadBanner,
            text: String::new(),
            preview: String::new(),
            delivered: false,
            seen: false,
            pinned: false,
            edited: false,
            reactions: ReactionSummary {
                groups: Vec::new(),
                valid: true,
            },
            avatar: None,
            is_first_of_user_run: false,
            is_last_of_user_run: false,
            is_selected: false,
            is_highlighted: false,
        }
    }

    /// Local placeholder for a message being uploaded. `unique_id` is
    /// generated when not supplied by the caller.
    pub fn uploading(
        conversation_id: i64,
        owner_id: i64,
        time: u64,
        text: impl Into<String>,
        unique_id: Option<String>,
    ) -> Self {
        let mut row = Self::unread_banner(conversation_id, time);
        row.unique_id = unique_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        row.owner_id = owner_id;
        row.kind = RowKind::Uploading;
        row.text = text.into();
        row.refresh_derived();
        row
    }

    pub fn is_banner(&self) -> bool {
        self.kind == RowKind::UnreadBanner
    }

    /// True for rows that take part in avatar grouping.
    pub fn is_message(&self) -> bool {
        !self.is_banner()
    }

    pub fn day(&self) -> NaiveDate {
        day_of(self.time)
    }

    pub fn refresh_derived(&mut self) {
        let first_line = self.text.lines().next().unwrap_or("");
        self.preview = first_line.chars().take(PREVIEW_MAX_CHARS).collect();
    }

    /// Take over server state from a newer copy of the same message while
    /// keeping what only the local view knows.
    pub(crate) fn absorb(&mut self, incoming: MessageRow) {
        let MessageRow {
            id,
            time,
            owner_id,
            kind,
            text,
            preview,
            delivered,
            seen,
            pinned,
            edited,
            reactions,
            ..
        } = incoming;

        if self.id.is_none() {
            self.id = id;
        }
        self.time = time;
        self.owner_id = owner_id;
        self.kind = kind;
        self.text = text;
        self.preview = preview;
        self.delivered |= delivered;
        self.seen |= seen;
        self.pinned = pinned;
        self.edited = edited;
        if reactions.valid {
            self.reactions = reactions;
        }
    }
}

/// UTC day bucket of a millisecond timestamp.
pub fn day_of(time: u64) -> NaiveDate {
    let millis = i64::try_from(time).unwrap_or(i64::MAX);
    DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.date_naive())
        .unwrap_or(NaiveDate::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_is_first_line_truncated() {
        let long = "x".repeat(300);
        let mut row = MessageRow::uploading(1, 1, 0, format!("{}\nsecond", long), None);
        assert_eq!(row.preview.chars().count(), PREVIEW_MAX_CHARS);

        row.text = "hello\nworld".into();
        row.refresh_derived();
        assert_eq!(row.preview, "hello");
    }

    #[test]
    fn day_buckets_follow_utc_midnight() {
        // 2024-01-01T23:59:59.999Z and 2024-01-02T00:00:00Z
        assert_ne!(day_of(1_704_153_599_999), day_of(1_704_153_600_000));
        assert_eq!(day_of(1_704_153_600_000), day_of(1_704_153_600_000 + 3_600_000));
    }

    #[test]
    fn absorb_keeps_local_view_state() {
        let mut row = MessageRow::uploading(1, 7, 100, "draft", Some("u-1".into()));
        row.is_selected = true;
        row.is_highlighted = true;

        let confirmed = MessageRow::from_message(Message {
            id: 55,
            unique_id: "u-1".into(),
            conversation_id: 1,
            owner_id: 7,
            time: 120,
            text: "draft".into(),
            edited: false,
            delivered: false,
            seen: false,
            pinned: false,
        });
        row.absorb(confirmed);

        assert_eq!(row.id, Some(55));
        assert_eq!(row.kind, RowKind::Normal);
        assert_eq!(row.time, 120);
        assert!(row.is_selected && row.is_highlighted);
    }
}
