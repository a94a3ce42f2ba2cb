/// Saved scroll position of one conversation, as stored in `scroll_anchors`.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorRow {
    pub conversation_id: i64,
    pub message_id: i64,
    pub message_time: i64,
    pub pixel_offset: f64,
}
