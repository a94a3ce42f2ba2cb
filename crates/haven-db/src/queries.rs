use crate::Database;
use crate::models::AnchorRow;
use anyhow::Result;
use rusqlite::Connection;

impl Database {
    // -- Scroll anchors --

    /// Insert or replace the anchor for a conversation.
    pub fn save_anchor(&self, row: &AnchorRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO scroll_anchors (conversation_id, message_id, message_time, pixel_offset)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(conversation_id) DO UPDATE SET
                    message_id = excluded.message_id,
                    message_time = excluded.message_time,
                    pixel_offset = excluded.pixel_offset,
                    updated_at = datetime('now')",
                rusqlite::params![
                    row.conversation_id,
                    row.message_id,
                    row.message_time,
                    row.pixel_offset
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_anchor(&self, conversation_id: i64) -> Result<Option<AnchorRow>> {
        self.with_conn(|conn| query_anchor(conn, conversation_id))
    }

    /// Returns true if a row was removed.
    pub fn delete_anchor(&self, conversation_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM scroll_anchors WHERE conversation_id = ?1",
                [conversation_id],
            )?;
            Ok(n > 0)
        })
    }
}

fn query_anchor(conn: &Connection, conversation_id: i64) -> Result<Option<AnchorRow>> {
    let mut stmt = conn.prepare(
        "SELECT conversation_id, message_id, message_time, pixel_offset
         FROM scroll_anchors WHERE conversation_id = ?1",
    )?;

    let row = stmt
        .query_row([conversation_id], |row| {
            Ok(AnchorRow {
                conversation_id: row.get(0)?,
                message_id: row.get(1)?,
                message_time: row.get(2)?,
                pixel_offset: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
