use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use haven_db::Database;
use haven_db::models::AnchorRow;

use crate::error::HistoryError;

/// Last stable viewport position of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollAnchor {
    pub message_id: i64,
    #[serde(rename = "time")]
    pub message_time: u64,
    pub pixel_offset: f64,
}

/// Key-value persistence for scroll anchors, keyed by conversation id.
pub trait AnchorStore: Send + Sync {
    fn load(&self, conversation_id: i64) -> anyhow::Result<Option<ScrollAnchor>>;
    fn save(&self, conversation_id: i64, anchor: ScrollAnchor) -> anyhow::Result<()>;
    fn clear(&self, conversation_id: i64) -> anyhow::Result<()>;
}

impl AnchorStore for Database {
    fn load(&self, conversation_id: i64) -> anyhow::Result<Option<ScrollAnchor>> {
        Ok(self.get_anchor(conversation_id)?.map(|row| ScrollAnchor {
            message_id: row.message_id,
            message_time: u64::try_from(row.message_time).unwrap_or(0),
            pixel_offset: row.pixel_offset,
        }))
    }

    fn save(&self, conversation_id: i64, anchor: ScrollAnchor) -> anyhow::Result<()> {
        self.save_anchor(&AnchorRow {
            conversation_id,
            message_id: anchor.message_id,
            message_time: i64::try_from(anchor.message_time)?,
            pixel_offset: anchor.pixel_offset,
        })
    }

    fn clear(&self, conversation_id: i64) -> anyhow::Result<()> {
        self.delete_anchor(conversation_id)?;
        Ok(())
    }
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryAnchorStore {
    anchors: Mutex<HashMap<i64, ScrollAnchor>>,
}

impl AnchorStore for MemoryAnchorStore {
    fn load(&self, conversation_id: i64) -> anyhow::Result<Option<ScrollAnchor>> {
        let anchors = self.anchors.lock().map_err(|e| anyhow::anyhow!("anchor lock poisoned: {}", e))?;
        Ok(anchors.get(&conversation_id).copied())
    }

    fn save(&self, conversation_id: i64, anchor: ScrollAnchor) -> anyhow::Result<()> {
        let mut anchors = self.anchors.lock().map_err(|e| anyhow::anyhow!("anchor lock poisoned: {}", e))?;
        anchors.insert(conversation_id, anchor);
        Ok(())
    }

    fn clear(&self, conversation_id: i64) -> anyhow::Result<()> {
        let mut anchors = self.anchors.lock().map_err(|e| anyhow::anyhow!("anchor lock poisoned: {}", e))?;
        anchors.remove(&conversation_id);
        Ok(())
    }
}

/// Decides when anchors are written, cleared and restored. Storage errors
/// are logged and otherwise ignored; an anchor is a convenience.
pub struct ScrollAnchorTracker {
    store: Box<dyn AnchorStore>,
    /// Set once a disconnect was seen. Stays set for the session.
    suppressed: bool,
    restored: bool,
}

impl ScrollAnchorTracker {
    pub fn new(store: Box<dyn AnchorStore>) -> Self {
        Self {
            store,
            suppressed: false,
            restored: false,
        }
    }

    /// Called on every conversation open; allows one more restore.
    pub fn reset_for_open(&mut self) {
        self.restored = false;
    }

    pub fn mark_disconnected(&mut self) {
        if !self.suppressed {
            debug!("Scroll anchors suppressed for the rest of the session");
        }
        self.suppressed = true;
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    /// Returns true if the anchor was written.
    pub fn save(&mut self, thread_id: i64, message_id: i64, time: u64, pixel_offset: f64) -> bool {
        if self.suppressed {
            return false;
        }
        let anchor = ScrollAnchor {
            message_id,
            message_time: time,
            pixel_offset,
        };
        match self.store.save(thread_id, anchor) {
            Ok(()) => true,
            Err(e) => {
                storage_failure("save", thread_id, e);
                false
            }
        }
    }

    pub fn clear(&mut self, thread_id: i64) {
        if let Err(e) = self.store.clear(thread_id) {
            storage_failure("clear", thread_id, e);
        }
    }

    /// The saved anchor, at most once per open.
    pub fn restore(&mut self, thread_id: i64) -> Option<ScrollAnchor> {
        if self.restored {
            return None;
        }
        self.restored = true;
        match self.store.load(thread_id) {
            Ok(anchor) => anchor,
            Err(e) => {
                storage_failure("load", thread_id, e);
                None
            }
        }
    }

    /// Look without consuming the once-per-open restore.
    pub fn peek(&self, thread_id: i64) -> Option<ScrollAnchor> {
        if self.restored {
            return None;
        }
        self.store.load(thread_id).ok().flatten()
    }
}

fn storage_failure(action: &str, thread_id: i64, err: anyhow::Error) {
    warn!(
        "Failed to {} scroll anchor for {}: {}",
        action,
        thread_id,
        HistoryError::from(err)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ScrollAnchorTracker {
        ScrollAnchorTracker::new(Box::new(MemoryAnchorStore::default()))
    }

    #[test]
    fn restore_happens_once_per_open() {
        let mut tracker = tracker();
        assert!(tracker.save(1, 10, 1000, 12.0));

        assert_eq!(tracker.restore(1).map(|a| a.message_id), Some(10));
        assert_eq!(tracker.restore(1), None);

        tracker.reset_for_open();
        assert!(tracker.peek(1).is_some());
        assert!(tracker.restore(1).is_some());
    }

    #[test]
    fn disconnect_suppresses_saves_for_the_session() {
        let mut tracker = tracker();
        tracker.mark_disconnected();
        assert!(!tracker.save(1, 10, 1000, 0.0));
        tracker.reset_for_open();
        assert!(tracker.is_suppressed());
        assert_eq!(tracker.restore(1), None);
    }

    struct BrokenStore;

    impl AnchorStore for BrokenStore {
        fn load(&self, _conversation_id: i64) -> anyhow::Result<Option<ScrollAnchor>> {
            anyhow::bail!("database is locked")
        }

        fn save(&self, _conversation_id: i64, _anchor: ScrollAnchor) -> anyhow::Result<()> {
            anyhow::bail!("database is locked")
        }

        fn clear(&self, _conversation_id: i64) -> anyhow::Result<()> {
            anyhow::bail!("database is locked")
        }
    }

    #[test]
    fn storage_errors_are_not_fatal() {
        let mut tracker = ScrollAnchorTracker::new(Box::new(BrokenStore));
        assert!(!tracker.save(1, 10, 1000, 0.0));
        tracker.clear(1);
        assert_eq!(tracker.peek(1), None);
        assert_eq!(tracker.restore(1), None);
    }

    #[test]
    fn clear_removes_anchor() {
        let mut tracker = tracker();
        tracker.save(4, 1, 1, 1.0);
        tracker.clear(4);
        assert_eq!(tracker.restore(4), None);
    }

    #[test]
    fn database_store_round_trips_anchor() {
        let db = Database::open_in_memory().unwrap();
        let anchor = ScrollAnchor {
            message_id: 7,
            message_time: 1_700_000_000_123,
            pixel_offset: -18.25,
        };
        AnchorStore::save(&db, 3, anchor).unwrap();
        assert_eq!(AnchorStore::load(&db, 3).unwrap(), Some(anchor));
        AnchorStore::clear(&db, 3).unwrap();
        assert_eq!(AnchorStore::load(&db, 3).unwrap(), None);
    }

    #[test]
    fn persisted_format_uses_wire_names() {
        let anchor = ScrollAnchor {
            message_id: 1,
            message_time: 2,
            pixel_offset: 3.5,
        };
        assert_eq!(
            serde_json::to_value(anchor).unwrap(),
            serde_json::json!({"messageId": 1, "time": 2, "pixelOffset": 3.5})
        );
    }
}
