//! Which fetches populate the window, and what happens when they return.

use futures_util::future::OptionFuture;
use tracing::{debug, info, warn};

use haven_types::api::FetchRequest;
use haven_types::models::{ConversationMeta, Message};

use crate::anchor::ScrollAnchor;
use crate::controller::{ConversationCursor, Effect, HistoryController, ScrollPhase};
use crate::error::FetchError;
use crate::fetch::{Cursor, Direction, FetchTicket, HistorySource, PageStatus, fetch_page};
use crate::merge::{MergeResult, merge_batch};
use crate::row::MessageRow;
use crate::sink::{LoadingEdge, ScrollPosition, ScrollTarget};
use crate::store::IndexPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioKind {
    RestoreAnchor,
    UnreadGap,
    NeverOpened,
    CaughtUp,
    MoveTo,
    ReconnectGap,
    LoadMoreTop,
    LoadMoreBottom,
}

impl ScenarioKind {
    pub fn key(self) -> &'static str {
        match self {
            ScenarioKind::RestoreAnchor => "restore-anchor",
            ScenarioKind::UnreadGap => "unread-gap",
            ScenarioKind::NeverOpened => "never-opened",
            ScenarioKind::CaughtUp => "caught-up",
            ScenarioKind::MoveTo => "move-to",
            ScenarioKind::ReconnectGap => "reconnect-gap",
            ScenarioKind::LoadMoreTop => "load-more-top",
            ScenarioKind::LoadMoreBottom => "load-more-bottom",
        }
    }
}

/// Everything open-time selection looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpenInputs {
    pub store_empty: bool,
    pub has_unread: bool,
    pub last_seen_is_last: bool,
    /// Nothing was ever seen, but the conversation has messages.
    pub never_opened: bool,
    pub has_saved_anchor: bool,
}

/// First matching scenario wins. `None` keeps a populated window as is.
pub fn select_open_scenario(inputs: OpenInputs) -> Option<ScenarioKind> {
    if !inputs.store_empty {
        return None;
    }
    let kind = if inputs.has_saved_anchor {
        ScenarioKind::RestoreAnchor
    } else if inputs.has_unread && !inputs.never_opened {
        ScenarioKind::UnreadGap
    } else if inputs.never_opened {
        ScenarioKind::NeverOpened
    } else {
        // Caught up, and the fallback for inconsistent metadata.
        ScenarioKind::CaughtUp
    };
    Some(kind)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Scenario {
    RestoreAnchor(ScrollAnchor),
    UnreadGap { banner_time: u64 },
    NeverOpened,
    CaughtUp,
    MoveTo { message_id: i64, time: u64 },
    ReconnectGap { from_time: u64 },
    LoadMoreTop { to_time: u64 },
    LoadMoreBottom { from_time: u64 },
}

impl Scenario {
    pub fn kind(&self) -> ScenarioKind {
        match self {
            Scenario::RestoreAnchor(_) => ScenarioKind::RestoreAnchor,
            Scenario::UnreadGap { .. } => ScenarioKind::UnreadGap,
            Scenario::NeverOpened => ScenarioKind::NeverOpened,
            Scenario::CaughtUp => ScenarioKind::CaughtUp,
            Scenario::MoveTo { .. } => ScenarioKind::MoveTo,
            Scenario::ReconnectGap { .. } => ScenarioKind::ReconnectGap,
            Scenario::LoadMoreTop { .. } => ScenarioKind::LoadMoreTop,
            Scenario::LoadMoreBottom { .. } => ScenarioKind::LoadMoreBottom,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Scenario::LoadMoreTop { .. } => Direction::Top,
            Scenario::LoadMoreBottom { .. } | Scenario::ReconnectGap { .. } => Direction::Bottom,
            _ => Direction::Both,
        }
    }

    pub fn loading_edge(&self) -> LoadingEdge {
        match self {
            Scenario::LoadMoreTop { .. } => LoadingEdge::Top,
            Scenario::LoadMoreBottom { .. } => LoadingEdge::Bottom,
            _ => LoadingEdge::Center,
        }
    }

    /// Scenarios that throw the resident rows away and repopulate.
    pub fn replaces_window(&self) -> bool {
        self.direction() == Direction::Both
    }

    /// `(top, bottom)` cursors. Top results are merged before bottom ones.
    pub fn cursors(&self) -> (Option<Cursor>, Option<Cursor>) {
        match *self {
            Scenario::RestoreAnchor(anchor) => (
                Some(Cursor::ToTime(anchor.message_time)),
                Some(Cursor::FromTime(anchor.message_time)),
            ),
            Scenario::UnreadGap { banner_time } => (
                Some(Cursor::ToTime(banner_time)),
                Some(Cursor::FromTime(banner_time)),
            ),
            Scenario::NeverOpened => (None, Some(Cursor::FromTime(0))),
            Scenario::CaughtUp => (Some(Cursor::Offset(0)), None),
            Scenario::MoveTo { time, .. } => {
                (Some(Cursor::ToTime(time)), Some(Cursor::FromTime(time)))
            }
            Scenario::ReconnectGap { from_time } => (None, Some(Cursor::FromTime(from_time))),
            Scenario::LoadMoreTop { to_time } => (Some(Cursor::ToTime(to_time)), None),
            Scenario::LoadMoreBottom { from_time } => (None, Some(Cursor::FromTime(from_time))),
        }
    }
}

/// Requests of one scenario, run concurrently by the actor.
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub ticket: FetchTicket,
    pub scenario: Scenario,
    pub top: Option<FetchRequest>,
    pub bottom: Option<FetchRequest>,
}

impl FetchJob {
    pub async fn run<S: HistorySource>(self, source: &S) -> FetchReply {
        let token = self.ticket.token.clone();
        let top = OptionFuture::from(self.top.clone().map(|req| fetch_page(source, &token, req)));
        let bottom =
            OptionFuture::from(self.bottom.clone().map(|req| fetch_page(source, &token, req)));
        let (top, bottom) = tokio::join!(top, bottom);
        self.reply(top, bottom)
    }

    pub fn reply(
        self,
        top: Option<Result<Vec<Message>, FetchError>>,
        bottom: Option<Result<Vec<Message>, FetchError>>,
    ) -> FetchReply {
        FetchReply {
            direction: self.ticket.direction,
            generation: self.ticket.generation,
            scenario: self.scenario,
            top,
            bottom,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchReply {
    pub direction: Direction,
    pub generation: u64,
    pub scenario: Scenario,
    pub top: Option<Result<Vec<Message>, FetchError>>,
    pub bottom: Option<Result<Vec<Message>, FetchError>>,
}

impl FetchReply {
    fn is_ok(&self) -> bool {
        !matches!(self.top, Some(Err(_))) && !matches!(self.bottom, Some(Err(_)))
    }
}

fn rows_of(messages: &Option<Vec<Message>>) -> Vec<MessageRow> {
    messages
        .iter()
        .flatten()
        .cloned()
        .map(MessageRow::from_message)
        .collect()
}

impl HistoryController {
    pub fn open(&mut self, meta: ConversationMeta) {
        info!("Opening conversation {}", meta.id);
        self.cursor = ConversationCursor::from_meta(&meta);
        self.edits.clear();
        self.anchors.reset_for_open();
        self.select_and_start();
    }

    fn select_and_start(&mut self) {
        let conversation_id = self.cursor.conversation_id;
        let inputs = OpenInputs {
            store_empty: self.store.is_empty(),
            has_unread: self.cursor.unread_count > 0,
            last_seen_is_last: self.cursor.last_seen_message_id == self.cursor.last_message_id,
            never_opened: self.cursor.last_seen_message_id == 0 && self.cursor.last_message_id != 0,
            has_saved_anchor: self.anchors.peek(conversation_id).is_some(),
        };
        let Some(mut kind) = select_open_scenario(inputs) else {
            debug!("Conversation {} already populated", conversation_id);
            return;
        };
        if kind == ScenarioKind::RestoreAnchor {
            if let Some(anchor) = self.anchors.restore(conversation_id) {
                self.start_scenario(Scenario::RestoreAnchor(anchor));
                return;
            }
            debug!("Saved anchor for {} vanished, using the next rule", conversation_id);
            let without_anchor = OpenInputs {
                has_saved_anchor: false,
                ..inputs
            };
            kind = select_open_scenario(without_anchor).unwrap_or(ScenarioKind::CaughtUp);
        }
        let scenario = match kind {
            ScenarioKind::UnreadGap => Scenario::UnreadGap {
                banner_time: self.cursor.last_seen_message_time + 1,
            },
            ScenarioKind::NeverOpened => Scenario::NeverOpened,
            _ => Scenario::CaughtUp,
        };
        self.start_scenario(scenario);
    }

    /// Navigate to a message, fetching around it if it is not resident.
    pub fn move_to(&mut self, message_id: i64, time: u64) {
        if let Some(path) = self.store.index_of_id(message_id) {
            debug!("Message {} is resident, scrolling locally", message_id);
            self.sink
                .scrolled_to(ScrollTarget::new(path, ScrollPosition::Middle), true);
            if let Some(unique_id) = self.store.get(path).map(|row| row.unique_id.clone()) {
                self.highlight(&unique_id);
            }
            return;
        }
        self.start_scenario(Scenario::MoveTo { message_id, time });
    }

    pub fn jump_to_pin(&mut self) {
        match self.cursor.pinned {
            Some(pin) => self.move_to(pin.message_id, pin.time),
            None => debug!("Conversation {} has no pinned message", self.cursor.conversation_id),
        }
    }

    pub fn jump_to_bottom(&mut self) {
        let tail_id = self.store.last_confirmed().and_then(|row| row.id).unwrap_or(0);
        let nothing_unread =
            tail_id >= self.cursor.last_seen_message_id || self.cursor.unread_count == 0;
        if !nothing_unread {
            self.start_scenario(Scenario::UnreadGap {
                banner_time: self.cursor.last_seen_message_time + 1,
            });
            return;
        }

        let tail_is_last = !self.cursor.has_more_bottom || tail_id >= self.cursor.last_message_id;
        match self.store.last_index() {
            Some(path) if tail_is_last => {
                self.sink
                    .scrolled_to(ScrollTarget::new(path, ScrollPosition::Bottom), true);
                self.at_bottom = true;
            }
            _ => self.start_scenario(Scenario::CaughtUp),
        }
    }

    /// Start a load-more when the viewport is near an edge that has more.
    /// Called by the actor once scrolling has been quiet for a while.
    pub fn evaluate_edge_loads(&mut self) {
        if !self.fetches.is_idle()
            || self.deferred_top.is_some()
            || self.viewport.programmatic
            || self.store.is_empty()
        {
            return;
        }
        let threshold = self.config.load_more_threshold;

        if self.cursor.has_more_top && self.viewport.distance_to_top() <= threshold {
            if let Some(first) = self.store.first_message() {
                let to_time = first.time;
                self.begin_fetch(Scenario::LoadMoreTop { to_time });
                return;
            }
        }
        if self.cursor.has_more_bottom && self.viewport.distance_to_bottom() <= threshold {
            if let Some(last) = self.store.last_confirmed() {
                let from_time = last.time;
                self.begin_fetch(Scenario::LoadMoreBottom { from_time });
            }
        }
    }

    pub(crate) fn on_reconnected(&mut self, remembered: u64) {
        self.invalidate_reactions();
        match self.store.last_confirmed().map(|row| row.time) {
            Some(tail) if tail >= remembered => {
                self.start_scenario(Scenario::ReconnectGap { from_time: tail + 1 });
            }
            Some(_) => debug!("Window is not at the tail, skipping gap fill"),
            None if self.fetches.is_idle() => self.select_and_start(),
            None => {}
        }
    }

    /// Cancel whatever is in flight and run `scenario`.
    pub(crate) fn start_scenario(&mut self, scenario: Scenario) {
        info!(
            "Starting {} in conversation {}",
            scenario.kind().key(),
            self.cursor.conversation_id
        );
        self.cancel_fetches();
        if scenario.replaces_window() {
            self.reset_window();
        }
        self.begin_fetch(scenario);
    }

    fn begin_fetch(&mut self, scenario: Scenario) {
        let direction = scenario.direction();
        let edge = scenario.loading_edge();
        let ticket = self.fetches.begin(direction, scenario.kind().key());
        let (conversation_id, count) = (self.cursor.conversation_id, self.fetches.page_size());
        let (top, bottom) = scenario.cursors();

        self.fetch_edges.insert(direction, edge);
        self.set_loading(edge, true);
        self.push_effect(Effect::Fetch(FetchJob {
            ticket,
            scenario,
            top: top.map(|c| c.request(conversation_id, count)),
            bottom: bottom.map(|c| c.request(conversation_id, count)),
        }));
    }

    pub(crate) fn cancel_fetches(&mut self) {
        for direction in self.fetches.cancel_all() {
            if let Some(edge) = self.fetch_edges.remove(&direction) {
                self.release_edge(edge);
            }
        }
        if self.deferred_top.take().is_some() {
            self.set_loading(LoadingEdge::Top, false);
        }
    }

    pub fn on_fetch_reply(&mut self, reply: FetchReply) {
        if !self.fetches.finish(reply.direction, reply.generation) {
            debug!(
                "Discarding superseded {} generation {}",
                reply.scenario.kind().key(),
                reply.generation
            );
            return;
        }
        let edge = self.fetch_edges.remove(&reply.direction);

        let hold = matches!(reply.scenario, Scenario::LoadMoreTop { .. })
            && self.viewport.phase == ScrollPhase::Decelerating
            && reply.is_ok();
        if hold {
            debug!("Holding top page until deceleration ends");
            self.deferred_top = Some(reply);
            return;
        }

        if let Some(edge) = edge {
            self.release_edge(edge);
        }
        self.apply_reply(reply);
    }

    pub(crate) fn apply_reply(&mut self, reply: FetchReply) {
        let FetchReply {
            scenario,
            top,
            bottom,
            ..
        } = reply;

        let (top, bottom) = match (top.transpose(), bottom.transpose()) {
            (Ok(top), Ok(bottom)) => (top, bottom),
            (Err(e), _) | (_, Err(e)) => {
                self.fetch_failed(&scenario, e);
                return;
            }
        };

        let page_size = self.fetches.page_size();
        let more = |messages: &Option<Vec<Message>>| {
            messages
                .as_ref()
                .is_some_and(|m| PageStatus::from_count(m.len(), page_size).has_more())
        };
        let (top_more, bottom_more) = (more(&top), more(&bottom));
        let mut rows = rows_of(&top);
        rows.extend(rows_of(&bottom));
        self.overlay_pushed(&mut rows);
        for row in &rows {
            if let Some(id) = row.id {
                self.cursor.observe(id, row.time);
            }
        }

        match scenario {
            Scenario::RestoreAnchor(anchor) => {
                self.cursor.has_more_top = true;
                self.cursor.has_more_bottom = bottom_more;
                let result = merge_batch(&mut self.store, rows);
                let target = self
                    .store
                    .index_of_id(anchor.message_id)
                    .or_else(|| self.nearest_index(anchor.message_time))
                    .map(|index| ScrollTarget {
                        index,
                        position: ScrollPosition::Top,
                        pixel_offset: anchor.pixel_offset,
                    });
                self.emit_merge(&result, target, false);
            }
            Scenario::UnreadGap { banner_time } => {
                self.cursor.has_more_top = top_more;
                self.cursor.has_more_bottom = bottom_more;
                rows.push(MessageRow::unread_banner(self.cursor.conversation_id, banner_time));
                let result = merge_batch(&mut self.store, rows);
                let target = self
                    .store
                    .banner_index()
                    .map(|index| ScrollTarget::new(index, ScrollPosition::Top));
                self.emit_merge(&result, target, false);
            }
            Scenario::NeverOpened => {
                self.cursor.has_more_top = false;
                self.cursor.has_more_bottom = false;
                if let Some(last) = rows.iter().map(|row| row.time).max() {
                    rows.push(MessageRow::unread_banner(self.cursor.conversation_id, last + 1));
                }
                let result = merge_batch(&mut self.store, rows);
                self.emit_at_bottom(&result);
            }
            Scenario::CaughtUp => {
                self.cursor.has_more_top = top_more;
                self.cursor.has_more_bottom = false;
                let result = merge_batch(&mut self.store, rows);
                self.emit_at_bottom(&result);
            }
            Scenario::MoveTo { message_id, time } => {
                self.cursor.has_more_top = top_more;
                self.cursor.has_more_bottom = bottom_more;
                let result = merge_batch(&mut self.store, rows);
                let exact = self.store.index_of_id(message_id);
                let target = exact
                    .or_else(|| self.nearest_index(time))
                    .map(|index| ScrollTarget::new(index, ScrollPosition::Middle));
                self.emit_merge(&result, target, false);
                let highlighted = exact
                    .and_then(|path| self.store.get(path))
                    .map(|row| row.unique_id.clone());
                match highlighted {
                    Some(unique_id) => self.highlight(&unique_id),
                    None => warn!("Message {} not found around {}", message_id, time),
                }
            }
            Scenario::ReconnectGap { .. } => {
                self.cursor.has_more_bottom = bottom_more;
                if rows.is_empty() {
                    debug!("No messages missed while disconnected");
                    self.refresh_empty_state();
                    return;
                }
                let me = self.context.current_user_id;
                let unread = self.cursor.unread_count > 0 || rows.iter().any(|r| r.owner_id != me);
                let first_time = rows.iter().map(|row| row.time).min();
                if let (true, Some(first_time)) = (unread, first_time) {
                    if let Some(banner) = self.store.banner_index() {
                        self.remove_paths(&[banner]);
                    }
                    rows.push(MessageRow::unread_banner(
                        self.cursor.conversation_id,
                        first_time.saturating_sub(1),
                    ));
                }
                let result = merge_batch(&mut self.store, rows);
                self.emit_merge(&result, None, false);
            }
            Scenario::LoadMoreTop { .. } => {
                self.cursor.has_more_top = top_more;
                let result = merge_batch(&mut self.store, rows);
                self.emit_merge(&result, None, false);
            }
            Scenario::LoadMoreBottom { .. } => {
                self.cursor.has_more_bottom = bottom_more;
                let result = merge_batch(&mut self.store, rows);
                self.emit_merge(&result, None, false);
            }
        }

        if scenario.replaces_window() {
            self.replay_buffered();
        }
    }

    fn emit_at_bottom(&mut self, result: &MergeResult) {
        let target = self
            .store
            .last_index()
            .map(|index| ScrollTarget::new(index, ScrollPosition::Bottom));
        self.emit_merge(result, target, false);
        self.at_bottom = target.is_some();
    }

    fn fetch_failed(&mut self, scenario: &Scenario, error: FetchError) {
        match error {
            FetchError::Cancelled => debug!("{} cancelled", scenario.kind().key()),
            FetchError::Failed(_) => warn!("{} failed: {}", scenario.kind().key(), error),
        }
        self.refresh_empty_state();
        if scenario.replaces_window() {
            self.replay_buffered();
        }
    }

    /// First message at or after `time`, else the last row.
    fn nearest_index(&self, time: u64) -> Option<IndexPath> {
        self.store
            .position(|row| row.is_message() && row.time >= time)
            .or_else(|| self.store.last_index())
    }
}
