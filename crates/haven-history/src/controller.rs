//! Single-writer state of one open conversation.
//!
//! [`HistoryController`] never awaits. Every entry point mutates the store,
//! emits view deltas through the sink and queues [`Effect`]s for the actor
//! to run, so indices it resolves stay valid for the whole call.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace};

use haven_types::models::{ConversationMeta, Message, PinnedMessage};

use crate::anchor::{AnchorStore, ScrollAnchorTracker};
use crate::config::HistoryConfig;
use crate::context::SyncContext;
use crate::enrichment::{EnrichRequest, EnrichResult, EnrichmentState};
use crate::fetch::{Direction, FetchCoordinator};
use crate::merge::{MergeResult, merge_batch};
use crate::row::{MessageRow, ReactionSummary};
use crate::scenario::{FetchJob, FetchReply};
use crate::sink::{HistoryViewSink, LoadingEdge, ScrollPosition, ScrollTarget};
use crate::store::{HistoryStore, IndexPath, Section};

/// What the engine knows about the conversation beyond the resident rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationCursor {
    pub conversation_id: i64,
    pub has_more_top: bool,
    pub has_more_bottom: bool,
    pub last_seen_message_id: i64,
    pub last_seen_message_time: u64,
    pub last_message_id: i64,
    pub last_message_time: u64,
    pub unread_count: u64,
    pub pinned: Option<PinnedMessage>,
}

impl ConversationCursor {
    pub fn from_meta(meta: &ConversationMeta) -> Self {
        Self {
            conversation_id: meta.id,
            has_more_top: true,
            has_more_bottom: true,
            last_seen_message_id: meta.last_seen_message_id,
            last_seen_message_time: meta.last_seen_message_time,
            last_message_id: meta.last_message_id,
            last_message_time: meta.last_message_time,
            unread_count: meta.unread_count,
            pinned: meta.pinned_message,
        }
    }

    /// Take over fresh metadata without touching pagination state.
    pub fn refresh(&mut self, meta: &ConversationMeta) {
        let has_more_top = self.has_more_top;
        let has_more_bottom = self.has_more_bottom;
        *self = Self::from_meta(meta);
        self.has_more_top = has_more_top;
        self.has_more_bottom = has_more_bottom;
    }

    /// Advance the known last message if `message` is newer.
    pub(crate) fn observe(&mut self, id: i64, time: u64) {
        if time >= self.last_message_time && id >= self.last_message_id {
            self.last_message_id = id;
            self.last_message_time = time;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScrollPhase {
    #[default]
    Idle,
    Dragging,
    DragEnded,
    Decelerating,
    DecelerationEnded,
}

/// Geometry and visible rows reported by the view after a scroll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Viewport {
    pub offset_y: f64,
    pub content_height: f64,
    pub visible_height: f64,
    pub phase: ScrollPhase,
    /// Unique ids of the visible rows, top to bottom.
    pub visible: Vec<String>,
    /// Offset of the first visible row from the top edge of the viewport.
    pub top_offset: f64,
    /// The view is performing a scroll it was asked to do.
    pub programmatic: bool,
}

impl Viewport {
    pub fn distance_to_top(&self) -> f64 {
        self.offset_y
    }

    pub fn distance_to_bottom(&self) -> f64 {
        self.content_height - self.offset_y - self.visible_height
    }
}

/// Work the actor performs on behalf of the controller.
#[derive(Debug)]
pub enum Effect {
    Fetch(FetchJob),
    Enrich(EnrichRequest),
    Unhighlight {
        unique_id: String,
        generation: u64,
        after: Duration,
    },
}

/// Read-only copy of the engine state.
#[derive(Debug, Clone)]
pub struct HistorySnapshot {
    pub sections: Vec<Section>,
    pub cursor: ConversationCursor,
    pub highlighted: Option<String>,
    pub loading: Vec<LoadingEdge>,
}

pub struct HistoryController {
    pub(crate) config: HistoryConfig,
    pub(crate) context: SyncContext,
    pub(crate) cursor: ConversationCursor,
    pub(crate) store: HistoryStore,
    pub(crate) fetches: FetchCoordinator,
    pub(crate) anchors: ScrollAnchorTracker,
    pub(crate) enrichment: EnrichmentState,
    pub(crate) sink: Arc<dyn HistoryViewSink>,
    pub(crate) viewport: Viewport,
    /// The true last message is on screen.
    pub(crate) at_bottom: bool,
    pub(crate) highlighted: Option<String>,
    highlight_generation: u64,
    spinners: HashSet<LoadingEdge>,
    pub(crate) fetch_edges: HashMap<Direction, LoadingEdge>,
    /// Top page held back while the view decelerates.
    pub(crate) deferred_top: Option<FetchReply>,
    /// New messages that arrived while the window was being replaced.
    pub(crate) buffered: Vec<Message>,
    /// Latest pushed edit per message id. Reapplied to fetched copies.
    pub(crate) edits: HashMap<i64, Message>,
    /// Last message time seen before the connection dropped.
    pub(crate) disconnect_tail: Option<u64>,
    pub(crate) empty: Option<bool>,
    effects: Vec<Effect>,
}

impl HistoryController {
    pub fn new(
        config: HistoryConfig,
        context: SyncContext,
        anchors: Box<dyn AnchorStore>,
        sink: Arc<dyn HistoryViewSink>,
    ) -> Self {
        let fetches = FetchCoordinator::new(config.page_size);
        Self {
            config,
            context,
            cursor: ConversationCursor::from_meta(&ConversationMeta::default()),
            store: HistoryStore::new(),
            fetches,
            anchors: ScrollAnchorTracker::new(anchors),
            enrichment: EnrichmentState::default(),
            sink,
            viewport: Viewport::default(),
            at_bottom: false,
            highlighted: None,
            highlight_generation: 0,
            spinners: HashSet::new(),
            fetch_edges: HashMap::new(),
            deferred_top: None,
            buffered: Vec::new(),
            edits: HashMap::new(),
            disconnect_tail: None,
            empty: None,
            effects: Vec::new(),
        }
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    pub fn cursor(&self) -> &ConversationCursor {
        &self.cursor
    }

    pub fn context(&self) -> &SyncContext {
        &self.context
    }

    pub fn highlighted(&self) -> Option<&str> {
        self.highlighted.as_deref()
    }

    pub fn is_loading(&self, edge: LoadingEdge) -> bool {
        self.spinners.contains(&edge)
    }

    pub fn snapshot(&self) -> HistorySnapshot {
        let mut loading: Vec<LoadingEdge> = self.spinners.iter().copied().collect();
        loading.sort_by_key(|edge| *edge as u8);
        HistorySnapshot {
            sections: self.store.sections().to_vec(),
            cursor: self.cursor.clone(),
            highlighted: self.highlighted.clone(),
            loading,
        }
    }

    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    pub(crate) fn push_effect(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    pub fn update_conversation(&mut self, meta: ConversationMeta) {
        if meta.id != self.cursor.conversation_id {
            debug!(
                "Ignoring metadata for conversation {} while {} is open",
                meta.id, self.cursor.conversation_id
            );
            return;
        }
        self.cursor.refresh(&meta);
    }

    pub fn update_context(&mut self, context: SyncContext) {
        let was_connected = self.context.is_connected();
        self.context = context;
        match (was_connected, self.context.is_connected()) {
            (true, false) => {
                info!(
                    "Connection lost in conversation {}, tail at {}",
                    self.cursor.conversation_id, self.cursor.last_message_time
                );
                self.anchors.mark_disconnected();
                self.disconnect_tail = Some(self.cursor.last_message_time);
            }
            (false, true) => {
                if let Some(remembered) = self.disconnect_tail.take() {
                    self.on_reconnected(remembered);
                }
            }
            _ => {}
        }
    }

    pub fn on_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
        let conversation_id = self.cursor.conversation_id;

        let last_visible = !self.cursor.has_more_bottom
            && self
                .store
                .last_message()
                .is_some_and(|last| self.viewport.visible.contains(&last.unique_id));
        if last_visible && !self.at_bottom {
            self.anchors.clear(conversation_id);
        }
        self.at_bottom = last_visible;

        let settled = matches!(
            self.viewport.phase,
            ScrollPhase::DragEnded | ScrollPhase::DecelerationEnded
        );
        if settled && !last_visible && !self.viewport.programmatic {
            self.save_anchor();
        }

        if self.viewport.phase != ScrollPhase::Decelerating {
            if let Some(reply) = self.deferred_top.take() {
                debug!("Deceleration ended, applying held top page");
                self.set_loading(LoadingEdge::Top, false);
                self.apply_reply(reply);
            }
        }

        self.request_visible_reactions();
    }

    fn save_anchor(&mut self) {
        let first = self
            .viewport
            .visible
            .iter()
            .filter_map(|uid| self.store.index_of_unique(uid))
            .filter_map(|path| self.store.get(path))
            .find_map(|row| row.id.map(|id| (id, row.time)));
        let Some((message_id, time)) = first else {
            return;
        };
        let conversation_id = self.cursor.conversation_id;
        if self
            .anchors
            .save(conversation_id, message_id, time, self.viewport.top_offset)
        {
            trace!("Anchored conversation {} at message {}", conversation_id, message_id);
        }
    }

    /// Insert an upload placeholder for the local user. The confirmed
    /// message replaces it when it arrives with the same unique id.
    pub fn add_pending_upload(&mut self, unique_id: String, text: String) {
        let now = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
        let time = match self.store.last_row() {
            Some(last) if last.time >= now => last.time + 1,
            _ => now,
        };
        let row = MessageRow::uploading(
            self.cursor.conversation_id,
            self.context.current_user_id,
            time,
            text,
            Some(unique_id.clone()),
        );
        let result = merge_batch(&mut self.store, vec![row]);
        let target = self
            .store
            .index_of_unique(&unique_id)
            .map(|path| ScrollTarget::new(path, ScrollPosition::Bottom));
        self.emit_merge(&result, target, true);
    }

    pub fn set_selected(&mut self, unique_id: &str, selected: bool) {
        let Some(path) = self.store.index_of_unique(unique_id) else {
            trace!("Selection target {} is not resident", unique_id);
            return;
        };
        if let Some(row) = self.store.get_mut(path) {
            if row.is_selected != selected {
                row.is_selected = selected;
                self.sink.reloaded(path);
            }
        }
    }

    /// Highlight one row, clearing any previous highlight first.
    pub(crate) fn highlight(&mut self, unique_id: &str) {
        if let Some(previous) = self.highlighted.take() {
            if previous != unique_id {
                self.set_highlight_flag(&previous, false);
            }
        }
        self.set_highlight_flag(unique_id, true);
        self.highlighted = Some(unique_id.to_string());
        self.highlight_generation += 1;
        self.effects.push(Effect::Unhighlight {
            unique_id: unique_id.to_string(),
            generation: self.highlight_generation,
            after: self.config.highlight_duration,
        });
    }

    pub fn on_unhighlight(&mut self, unique_id: &str, generation: u64) {
        if generation != self.highlight_generation || self.highlighted.as_deref() != Some(unique_id) {
            return;
        }
        self.highlighted = None;
        self.set_highlight_flag(unique_id, false);
    }

    fn set_highlight_flag(&mut self, unique_id: &str, value: bool) {
        let Some(path) = self.store.index_of_unique(unique_id) else {
            return;
        };
        if let Some(row) = self.store.get_mut(path) {
            if row.is_highlighted != value {
                row.is_highlighted = value;
                self.sink.reloaded(path);
            }
        }
    }

    pub fn on_enriched(&mut self, result: EnrichResult) {
        match result {
            EnrichResult::Reactions {
                requested,
                mut summaries,
            } => {
                self.enrichment.release_reactions(&requested);
                for id in requested {
                    let groups = summaries.remove(&id).unwrap_or_default();
                    let Some(path) = self.store.index_of_id(id) else {
                        continue;
                    };
                    if let Some(row) = self.store.get_mut(path) {
                        row.reactions = ReactionSummary { groups, valid: true };
                        self.sink.reloaded(path);
                    }
                }
            }
            EnrichResult::ReactionsFailed { requested } => {
                self.enrichment.release_reactions(&requested);
            }
            EnrichResult::AvatarFailed { owner_id } => {
                self.enrichment.release_avatar(owner_id);
            }
            EnrichResult::Avatar { owner_id, image } => {
                self.enrichment.store_avatar(owner_id, image.clone());
                let Some(image) = image else {
                    return;
                };
                let paths: Vec<IndexPath> = self
                    .store
                    .index_paths()
                    .filter(|path| {
                        self.store.get(*path).is_some_and(|row| {
                            row.owner_id == owner_id && row.is_last_of_user_run && row.avatar.is_none()
                        })
                    })
                    .collect();
                for path in paths {
                    if let Some(row) = self.store.get_mut(path) {
                        row.avatar = Some(image.clone());
                        self.sink.reloaded(path);
                    }
                }
            }
        }
    }

    /// Emit the view deltas of a merge in dependency order: relocation
    /// removals, insertions (or a plain scroll), then reloads.
    pub(crate) fn emit_merge(
        &mut self,
        result: &MergeResult,
        scroll_to: Option<ScrollTarget>,
        animate: bool,
    ) {
        let touched: Vec<IndexPath> = result
            .inserted
            .iter()
            .copied()
            .chain(result.reloads())
            .collect();
        self.apply_cached_avatars(&touched);

        if !result.removed.is_empty() {
            self.sink
                .deleted(&result.removed.sections, &result.removed.rows);
        }
        if !result.inserted.is_empty() {
            self.sink.inserted(
                &result.inserted_sections,
                &result.inserted_rows,
                scroll_to,
                animate,
            );
        } else if let Some(target) = scroll_to {
            self.sink.scrolled_to(target, animate);
        }
        for path in result.reloads() {
            self.sink.reloaded(path);
        }

        self.request_enrichment(&touched);
        self.refresh_empty_state();
    }

    /// Drop every resident row before a scenario repopulates the window.
    pub(crate) fn reset_window(&mut self) {
        let sections = self.store.clear();
        if !sections.is_empty() {
            self.sink.deleted(&sections, &[]);
        }
        self.highlighted = None;
        self.at_bottom = false;
    }

    pub(crate) fn set_loading(&mut self, edge: LoadingEdge, loading: bool) {
        let changed = if loading {
            self.spinners.insert(edge)
        } else {
            self.spinners.remove(&edge)
        };
        if changed {
            self.sink.loading_changed(edge, loading);
        }
    }

    /// Hide the spinner of `edge` unless another fetch still uses it.
    pub(crate) fn release_edge(&mut self, edge: LoadingEdge) {
        if !self.fetch_edges.values().any(|e| *e == edge) {
            self.set_loading(edge, false);
        }
    }

    pub(crate) fn refresh_empty_state(&mut self) {
        if self.fetches.is_loading(Direction::Both) {
            return;
        }
        let is_empty = !self.store.rows().any(|row| row.is_message());
        if self.empty != Some(is_empty) {
            self.empty = Some(is_empty);
            self.sink.empty_state_changed(is_empty);
        }
    }

    fn apply_cached_avatars(&mut self, paths: &[IndexPath]) {
        for path in paths {
            let Some(row) = self.store.get(*path) else {
                continue;
            };
            if !row.is_last_of_user_run || row.avatar.is_some() {
                continue;
            }
            if let Some(image) = self.enrichment.cached_avatar(row.owner_id) {
                if let Some(row) = self.store.get_mut(*path) {
                    row.avatar = Some(image);
                }
            }
        }
    }

    /// Queue reactions for rows lacking a valid summary and avatars for run
    /// tails that have none.
    pub(crate) fn request_enrichment(&mut self, paths: &[IndexPath]) {
        let mut reaction_ids = Vec::new();
        let mut owners = Vec::new();
        for path in paths {
            let Some(row) = self.store.get(*path) else {
                continue;
            };
            if let Some(id) = row.id.filter(|_| !row.reactions.valid) {
                reaction_ids.push(id);
            }
            if row.is_last_of_user_run && row.avatar.is_none() && !owners.contains(&row.owner_id) {
                owners.push(row.owner_id);
            }
        }

        self.request_reactions(reaction_ids);
        for owner_id in owners {
            if self.enrichment.claim_avatar(owner_id) {
                self.effects.push(Effect::Enrich(EnrichRequest::Avatar { owner_id }));
            }
        }
    }

    pub(crate) fn request_visible_reactions(&mut self) {
        let ids: Vec<i64> = self
            .viewport
            .visible
            .iter()
            .filter_map(|uid| self.store.index_of_unique(uid))
            .filter_map(|path| self.store.get(path))
            .filter(|row| !row.reactions.valid)
            .filter_map(|row| row.id)
            .collect();
        self.request_reactions(ids);
    }

    fn request_reactions(&mut self, ids: Vec<i64>) {
        let message_ids = self.enrichment.claim_reactions(ids);
        if message_ids.is_empty() {
            return;
        }
        self.effects.push(Effect::Enrich(EnrichRequest::Reactions {
            conversation_id: self.cursor.conversation_id,
            message_ids,
        }));
    }

    /// Mark every resident summary stale. Visible rows are refetched now,
    /// the rest when they scroll into view.
    pub(crate) fn invalidate_reactions(&mut self) {
        for row in self.store.rows_mut() {
            if row.id.is_some() {
                row.reactions.valid = false;
            }
        }
        self.enrichment.reset_in_flight();
        self.request_visible_reactions();
    }

    pub fn close(&mut self) {
        self.cancel_fetches();
        info!("Closed conversation {}", self.cursor.conversation_id);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::anchor::MemoryAnchorStore;
    use crate::sink::{ChannelSink, ViewUpdate};
    use crate::store::tests::{T0, message};

    pub(crate) const ME: i64 = 1;
    pub(crate) const OTHER: i64 = 2;

    /// All fixtures share one day; message `id` is at `t(id)`.
    pub(crate) fn t(id: i64) -> u64 {
        T0 + id as u64 * 1000
    }

    pub(crate) fn msg(id: i64, owner_id: i64) -> Message {
        message(id, owner_id, t(id))
    }

    pub(crate) fn page(ids: std::ops::RangeInclusive<i64>, owner_id: i64) -> Vec<Message> {
        ids.map(|id| msg(id, owner_id)).collect()
    }

    pub(crate) fn meta(last_seen: i64, last: i64, unread: u64) -> ConversationMeta {
        ConversationMeta {
            id: 1,
            last_seen_message_id: last_seen,
            last_seen_message_time: if last_seen > 0 { t(last_seen) } else { 0 },
            last_message_id: last,
            last_message_time: if last > 0 { t(last) } else { 0 },
            unread_count: unread,
            pinned_message: None,
        }
    }

    pub(crate) struct Harness {
        pub controller: HistoryController,
        pub updates: UnboundedReceiver<ViewUpdate>,
    }

    impl Harness {
        pub fn new() -> Self {
            Self::with_anchors(Box::new(MemoryAnchorStore::default()))
        }

        pub fn with_anchors(anchors: Box<dyn AnchorStore>) -> Self {
            let (sink, updates) = ChannelSink::new();
            let controller = HistoryController::new(
                HistoryConfig::default(),
                SyncContext::new(ME),
                anchors,
                Arc::new(sink),
            );
            Self { controller, updates }
        }

        /// Put rows in the store directly, as if a scenario had loaded them.
        pub fn seed(&mut self, meta: ConversationMeta, messages: Vec<Message>) {
            self.controller.cursor = ConversationCursor::from_meta(&meta);
            self.controller.cursor.has_more_top = false;
            self.controller.cursor.has_more_bottom = false;
            let rows = messages.into_iter().map(MessageRow::from_message).collect();
            merge_batch(&mut self.controller.store, rows);
            self.controller.empty = Some(self.controller.store.is_empty());
            self.controller.take_effects();
        }

        pub fn drain(&mut self) -> Vec<ViewUpdate> {
            let mut out = Vec::new();
            while let Ok(update) = self.updates.try_recv() {
                out.push(update);
            }
            out
        }

        pub fn fetch_jobs(&mut self) -> Vec<FetchJob> {
            self.controller
                .take_effects()
                .into_iter()
                .filter_map(|effect| match effect {
                    Effect::Fetch(job) => Some(job),
                    _ => None,
                })
                .collect()
        }

        pub fn take_fetch(&mut self) -> FetchJob {
            let mut jobs = self.fetch_jobs();
            assert_eq!(jobs.len(), 1, "expected exactly one fetch");
            jobs.remove(0)
        }

        pub fn unique_ids(&self) -> Vec<String> {
            self.controller
                .store
                .rows()
                .map(|row| row.unique_id.clone())
                .collect()
        }
    }
}
