use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use haven_history::{
    ConnectionStatus, HistoryConfig, HistoryHandle, HistorySource, HttpHistorySource, SyncContext,
    TracingSink, spawn_history,
};
use haven_types::events::PushEvent;

/// One line of stdin. Gateway push events are forwarded as-is.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Input {
    Push { event: PushEvent },
    MoveTo { message_id: i64, time: u64 },
    JumpToBottom,
    JumpToPin,
    Upload { text: String },
    Connection { connected: bool },
    Snapshot,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "haven_sync=debug,haven_history=debug".into()),
        )
        .init();

    // Config
    let server_url =
        std::env::var("HAVEN_SERVER_URL").unwrap_or_else(|_| "http://localhost:3000".into());
    let token = std::env::var("HAVEN_TOKEN")?;
    let db_path = std::env::var("HAVEN_DB_PATH").unwrap_or_else(|_| "haven-client.db".into());
    let user_id: i64 = std::env::var("HAVEN_USER_ID")?.parse()?;
    let conversation_id: i64 = std::env::var("HAVEN_CONVERSATION_ID")?.parse()?;

    // Init database
    let db = haven_db::Database::open(&PathBuf::from(&db_path))?;

    let source = Arc::new(HttpHistorySource::new(server_url.as_str(), token));
    let mut context = SyncContext::new(user_id);
    let (history, actor) = spawn_history(
        HistoryConfig::from_env(),
        context.clone(),
        Arc::clone(&source),
        Box::new(db),
        Arc::new(TracingSink),
    );

    let meta = source.conversation(conversation_id).await?;
    info!("Syncing conversation {} from {}", conversation_id, server_url);
    history.open(meta)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Input>(&line) {
                    Ok(input) => handle_input(&history, &mut context, input).await?,
                    Err(e) => warn!("Ignoring malformed input: {}", e),
                }
            }
        }
    }

    history.close()?;
    actor.await?;
    Ok(())
}

async fn handle_input(
    history: &HistoryHandle,
    context: &mut SyncContext,
    input: Input,
) -> anyhow::Result<()> {
    match input {
        Input::Push { event } => history.push(event)?,
        Input::MoveTo { message_id, time } => history.move_to(message_id, time)?,
        Input::JumpToBottom => history.jump_to_bottom()?,
        Input::JumpToPin => history.jump_to_pin()?,
        Input::Upload { text } => {
            let unique_id = history.add_pending_upload(text)?;
            info!("Pending upload {}", unique_id);
        }
        Input::Connection { connected } => {
            context.connection = if connected {
                ConnectionStatus::Connected
            } else {
                ConnectionStatus::Disconnected
            };
            history.update_context(context.clone())?;
        }
        Input::Snapshot => {
            let snapshot = history.snapshot().await?;
            let rows: usize = snapshot.sections.iter().map(|s| s.rows.len()).sum();
            info!(
                sections = snapshot.sections.len(),
                rows,
                has_more_top = snapshot.cursor.has_more_top,
                has_more_bottom = snapshot.cursor.has_more_bottom,
                unread = snapshot.cursor.unread_count,
                "snapshot"
            );
        }
    }
    Ok(())
}
