//! The history actor: one tokio task that owns a [`HistoryController`].
//!
//! Callers talk to it through a cloneable [`HistoryHandle`]. Fetches and
//! timers run as separate tasks and report back over the same channel, so
//! every mutation is serialized through the actor.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use haven_types::events::PushEvent;
use haven_types::models::ConversationMeta;

use crate::anchor::AnchorStore;
use crate::config::HistoryConfig;
use crate::context::SyncContext;
use crate::controller::{Effect, HistoryController, HistorySnapshot, Viewport};
use crate::enrichment::{EnrichResult, EnrichmentQueue, EnrichmentSource};
use crate::error::{HistoryError, Result};
use crate::fetch::HistorySource;
use crate::scenario::FetchReply;
use crate::sink::HistoryViewSink;

#[derive(Debug)]
pub enum Command {
    Open(ConversationMeta),
    UpdateConversation(ConversationMeta),
    MoveTo { message_id: i64, time: u64 },
    JumpToBottom,
    JumpToPin,
    Viewport(Viewport),
    Push(PushEvent),
    UpdateContext(SyncContext),
    AddPendingUpload { unique_id: String, text: String },
    SetSelected { unique_id: String, selected: bool },
    FetchFinished(FetchReply),
    Enriched(EnrichResult),
    Unhighlight { unique_id: String, generation: u64 },
    Snapshot(oneshot::Sender<HistorySnapshot>),
    Close,
}

/// Cheap, cloneable entry point into the history actor.
#[derive(Clone)]
pub struct HistoryHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl HistoryHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| HistoryError::Closed)
    }

    pub fn open(&self, meta: ConversationMeta) -> Result<()> {
        self.send(Command::Open(meta))
    }

    pub fn update_conversation(&self, meta: ConversationMeta) -> Result<()> {
        self.send(Command::UpdateConversation(meta))
    }

    pub fn move_to(&self, message_id: i64, time: u64) -> Result<()> {
        self.send(Command::MoveTo { message_id, time })
    }

    pub fn jump_to_bottom(&self) -> Result<()> {
        self.send(Command::JumpToBottom)
    }

    pub fn jump_to_pin(&self) -> Result<()> {
        self.send(Command::JumpToPin)
    }

    pub fn viewport(&self, viewport: Viewport) -> Result<()> {
        self.send(Command::Viewport(viewport))
    }

    pub fn push(&self, event: PushEvent) -> Result<()> {
        self.send(Command::Push(event))
    }

    pub fn update_context(&self, context: SyncContext) -> Result<()> {
        self.send(Command::UpdateContext(context))
    }

    /// Show an upload placeholder. Returns the unique id the confirmed
    /// message must carry.
    pub fn add_pending_upload(&self, text: impl Into<String>) -> Result<String> {
        let unique_id = Uuid::new_v4().to_string();
        self.send(Command::AddPendingUpload {
            unique_id: unique_id.clone(),
            text: text.into(),
        })?;
        Ok(unique_id)
    }

    pub fn set_selected(&self, unique_id: impl Into<String>, selected: bool) -> Result<()> {
        self.send(Command::SetSelected {
            unique_id: unique_id.into(),
            selected,
        })
    }

    pub async fn snapshot(&self) -> Result<HistorySnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await.map_err(|_| HistoryError::Closed)
    }

    pub fn close(&self) -> Result<()> {
        self.send(Command::Close)
    }
}

/// Spawn the actor for one conversation view. It stops on
/// [`HistoryHandle::close`] or when every handle is dropped.
pub fn spawn_history<S>(
    config: HistoryConfig,
    context: SyncContext,
    source: Arc<S>,
    anchors: Box<dyn AnchorStore>,
    sink: Arc<dyn HistoryViewSink>,
) -> (HistoryHandle, JoinHandle<()>)
where
    S: HistorySource + EnrichmentSource,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let controller = HistoryController::new(config, context, anchors, sink);
    let actor = HistoryActor {
        controller,
        source,
        rx,
        tx: tx.downgrade(),
    };
    let handle = tokio::spawn(actor.run());
    (HistoryHandle { tx }, handle)
}

struct HistoryActor<S> {
    controller: HistoryController,
    source: Arc<S>,
    rx: mpsc::UnboundedReceiver<Command>,
    /// Weak so the actor stops once every handle is gone.
    tx: mpsc::WeakUnboundedSender<Command>,
}

impl<S> HistoryActor<S>
where
    S: HistorySource + EnrichmentSource,
{
    async fn run(mut self) {
        let weak = self.tx.clone();
        let enrichment = EnrichmentQueue::spawn(Arc::clone(&self.source), move |result| {
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(Command::Enriched(result));
            }
        });
        let debounce = self.controller.config().scroll_debounce;
        let mut edge_check: Option<Instant> = None;

        info!("History actor started");
        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    let Some(command) = command else { break };
                    if matches!(command, Command::Viewport(_)) {
                        edge_check = Some(Instant::now() + debounce);
                    }
                    if !self.handle(command) {
                        break;
                    }
                }
                _ = wait_until(edge_check) => {
                    edge_check = None;
                    self.controller.evaluate_edge_loads();
                }
            }

            for effect in self.controller.take_effects() {
                self.dispatch(effect, &enrichment);
            }
        }

        self.controller.close();
        enrichment.shutdown();
        info!("History actor stopped");
    }

    /// Apply one command. Returns false when the actor should stop.
    fn handle(&mut self, command: Command) -> bool {
        let controller = &mut self.controller;
        match command {
            Command::Open(meta) => controller.open(meta),
            Command::UpdateConversation(meta) => controller.update_conversation(meta),
            Command::MoveTo { message_id, time } => controller.move_to(message_id, time),
            Command::JumpToBottom => controller.jump_to_bottom(),
            Command::JumpToPin => controller.jump_to_pin(),
            Command::Viewport(viewport) => controller.on_viewport(viewport),
            Command::Push(event) => controller.apply_push(event),
            Command::UpdateContext(context) => controller.update_context(context),
            Command::AddPendingUpload { unique_id, text } => {
                controller.add_pending_upload(unique_id, text)
            }
            Command::SetSelected {
                unique_id,
                selected,
            } => controller.set_selected(&unique_id, selected),
            Command::FetchFinished(reply) => controller.on_fetch_reply(reply),
            Command::Enriched(result) => controller.on_enriched(result),
            Command::Unhighlight {
                unique_id,
                generation,
            } => controller.on_unhighlight(&unique_id, generation),
            Command::Snapshot(reply) => {
                let _ = reply.send(controller.snapshot());
            }
            Command::Close => return false,
        }
        true
    }

    fn dispatch(&self, effect: Effect, enrichment: &EnrichmentQueue) {
        match effect {
            Effect::Fetch(job) => {
                let source = Arc::clone(&self.source);
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let reply = job.run(source.as_ref()).await;
                    match tx.upgrade() {
                        Some(tx) => {
                            let _ = tx.send(Command::FetchFinished(reply));
                        }
                        None => debug!("Actor gone, dropping fetch result"),
                    }
                });
            }
            Effect::Enrich(request) => enrichment.enqueue(request),
            Effect::Unhighlight {
                unique_id,
                generation,
                after,
            } => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    if let Some(tx) = tx.upgrade() {
                        let _ = tx.send(Command::Unhighlight {
                            unique_id,
                            generation,
                        });
                    }
                });
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
