use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS scroll_anchors (
            conversation_id INTEGER PRIMARY KEY,
            message_id      INTEGER NOT NULL,
            message_time    INTEGER NOT NULL,
            pixel_offset    REAL NOT NULL,
            updated_at      TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
