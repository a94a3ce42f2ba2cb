//! Push events applied to the resident window.
//!
//! Events go through the same single writer as fetch merges, so an event
//! always sees the latest store and a later fetch merge cannot undo it.

use tracing::{debug, trace};

use haven_types::events::PushEvent;
use haven_types::models::{Message, PinnedMessage};

use crate::controller::HistoryController;
use crate::fetch::Direction;
use crate::merge::{merge_batch, neighbour_ids, restitch_ids};
use crate::row::MessageRow;
use crate::sink::{ScrollPosition, ScrollTarget};
use crate::store::{IndexPath, Removal};

impl HistoryController {
    pub fn apply_push(&mut self, event: PushEvent) {
        if event.conversation_id() != self.cursor.conversation_id {
            trace!(
                "Ignoring event for conversation {} while {} is open",
                event.conversation_id(),
                self.cursor.conversation_id
            );
            return;
        }
        match event {
            PushEvent::NewMessage { message } => self.on_new_message(message),
            PushEvent::Edited { message } => self.on_edited(message),
            PushEvent::Deleted { message_ids, .. } => self.on_deleted(&message_ids),
            PushEvent::Delivered {
                message_id,
                unique_id,
                ..
            } => self.on_receipt(message_id, unique_id.as_deref(), false),
            PushEvent::Seen {
                message_id,
                unique_id,
                ..
            } => self.on_receipt(message_id, unique_id.as_deref(), true),
            PushEvent::Pinned {
                message_id, time, ..
            } => self.on_pinned(message_id, time),
            PushEvent::Unpinned { message_id, .. } => self.on_unpinned(message_id),
        }
    }

    /// The newest resident row is the newest message of the conversation.
    fn tail_is_current(&self) -> bool {
        match self.store.last_confirmed().and_then(|row| row.id) {
            Some(tail) => tail >= self.cursor.last_message_id,
            None => self.cursor.last_message_id == 0,
        }
    }

    fn on_new_message(&mut self, message: Message) {
        if self.fetches.is_loading(Direction::Both) {
            trace!("Window is being replaced, buffering message {}", message.id);
            self.buffered.push(message);
            return;
        }

        let has_placeholder = self.store.index_of_unique(&message.unique_id).is_some();
        let accept = has_placeholder || self.tail_is_current();
        let own = message.owner_id == self.context.current_user_id;

        self.cursor.observe(message.id, message.time);
        if !own && !has_placeholder {
            self.cursor.unread_count += 1;
        }

        if !accept {
            debug!("Tail is not current, leaving message {} to a later fetch", message.id);
            self.cursor.has_more_bottom = true;
            return;
        }

        let follow = self.at_bottom || own;
        let row = MessageRow::from_message(message);
        let unique_id = row.unique_id.clone();
        let result = merge_batch(&mut self.store, vec![row]);
        let target = if follow {
            self.store
                .index_of_unique(&unique_id)
                .map(|path| ScrollTarget::new(path, ScrollPosition::Bottom))
        } else {
            None
        };
        self.emit_merge(&result, target, true);
    }

    /// Re-apply messages that arrived while the window was replaced.
    pub(crate) fn replay_buffered(&mut self) {
        for message in std::mem::take(&mut self.buffered) {
            self.on_new_message(message);
        }
    }

    fn on_edited(&mut self, message: Message) {
        self.edits.insert(message.id, message.clone());
        let Some(current) = self
            .store
            .index_of_id(message.id)
            .and_then(|path| self.store.get(path))
        else {
            trace!("Edited message {} is not resident", message.id);
            return;
        };

        let mut edited = current.clone();
        edited.text = message.text;
        edited.time = message.time;
        edited.edited = true;
        edited.refresh_derived();

        let result = merge_batch(&mut self.store, vec![edited]);
        let single_move = result.removed.sections.is_empty()
            && result.inserted_sections.is_empty()
            && result.removed.rows.len() == 1
            && result.inserted.len() == 1;
        if !single_move {
            self.emit_merge(&result, None, false);
            return;
        }

        let (from, to) = (result.removed.rows[0], result.inserted[0]);
        self.sink.moved_row(from, to);
        self.sink.reloaded(to);
        for path in &result.restitched {
            self.sink.reloaded(*path);
        }
        let mut touched = vec![to];
        touched.extend(&result.restitched);
        self.request_enrichment(&touched);
    }

    /// Bring fetched copies up to date with edits and pins pushed while
    /// the page was in flight.
    pub(crate) fn overlay_pushed(&self, rows: &mut [MessageRow]) {
        let pinned_id = self.cursor.pinned.map(|pin| pin.message_id);
        for row in rows.iter_mut() {
            let Some(id) = row.id else {
                continue;
            };
            row.pinned = pinned_id == Some(id);
            if let Some(edit) = self.edits.get(&id) {
                row.text.clone_from(&edit.text);
                row.time = edit.time;
                row.edited = true;
                row.refresh_derived();
            }
        }
    }

    fn on_deleted(&mut self, message_ids: &[i64]) {
        for id in message_ids {
            self.store.tombstone(*id);
        }
        let paths: Vec<IndexPath> = message_ids
            .iter()
            .filter_map(|id| self.store.index_of_id(*id))
            .collect();
        if paths.is_empty() {
            return;
        }

        let removal = self.remove_paths(&paths);
        if removal
            .removed
            .iter()
            .any(|row| self.highlighted.as_deref() == Some(row.unique_id.as_str()))
        {
            self.highlighted = None;
        }
        if self
            .cursor
            .pinned
            .is_some_and(|pin| message_ids.contains(&pin.message_id))
        {
            self.cursor.pinned = None;
        }
        if message_ids.contains(&self.cursor.last_message_id) && !self.cursor.has_more_bottom {
            let tail = self.store.last_confirmed().and_then(|row| row.id.map(|id| (id, row.time)));
            let (id, time) = tail.unwrap_or((0, 0));
            self.cursor.last_message_id = id;
            self.cursor.last_message_time = time;
        }
        self.refresh_empty_state();
    }

    /// Remove rows, move run boundaries onto the surviving neighbours and
    /// reload those.
    pub(crate) fn remove_paths(&mut self, paths: &[IndexPath]) -> Removal {
        let seam = neighbour_ids(&self.store, paths);
        let removal = self.store.remove_at(paths);
        if removal.removed.is_empty() {
            return removal;
        }
        self.sink.deleted(&removal.sections, &removal.rows);
        let changed = restitch_ids(&mut self.store, &seam);
        for path in &changed {
            self.sink.reloaded(*path);
        }
        self.request_enrichment(&changed);
        removal
    }

    /// Receipts are cumulative: a receipt for one of our messages covers
    /// every earlier message of ours.
    fn on_receipt(&mut self, message_id: i64, unique_id: Option<&str>, seen: bool) {
        let target = unique_id
            .and_then(|uid| self.store.index_of_unique(uid))
            .or_else(|| self.store.index_of_id(message_id));
        let Some(target) = target else {
            trace!("Receipt for message {} is not resident", message_id);
            return;
        };
        let Some(target_time) = self.store.get(target).map(|row| row.time) else {
            return;
        };

        let me = self.context.current_user_id;
        let paths: Vec<IndexPath> = self
            .store
            .index_paths()
            .filter(|path| {
                *path == target
                    || self.store.get(*path).is_some_and(|row| {
                        row.is_message() && row.owner_id == me && row.time <= target_time
                    })
            })
            .collect();

        for path in paths {
            let Some(row) = self.store.get_mut(path) else {
                continue;
            };
            let already = if seen { row.seen } else { row.delivered };
            if already {
                continue;
            }
            row.delivered = true;
            if seen {
                row.seen = true;
            }
            self.sink.reloaded(path);
        }
    }

    fn on_pinned(&mut self, message_id: i64, time: u64) {
        self.cursor.pinned = Some(PinnedMessage { message_id, time });
        let paths: Vec<IndexPath> = self
            .store
            .index_paths()
            .filter(|path| {
                self.store
                    .get(*path)
                    .is_some_and(|row| row.pinned != (row.id == Some(message_id)))
            })
            .collect();
        for path in paths {
            if let Some(row) = self.store.get_mut(path) {
                row.pinned = row.id == Some(message_id);
                self.sink.reloaded(path);
            }
        }
    }

    fn on_unpinned(&mut self, message_id: i64) {
        if self.cursor.pinned.is_some_and(|pin| pin.message_id == message_id) {
            self.cursor.pinned = None;
        }
        let Some(path) = self.store.index_of_id(message_id) else {
            return;
        };
        if let Some(row) = self.store.get_mut(path) {
            if row.pinned {
                row.pinned = false;
                self.sink.reloaded(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::*;
    use crate::row::UNREAD_BANNER_ID;
    use crate::sink::ViewUpdate;

    fn deleted(ids: &[i64]) -> PushEvent {
        PushEvent::Deleted {
            message_ids: ids.to_vec(),
            conversation_id: 1,
        }
    }

    #[test]
    fn deleting_run_tail_moves_flag_to_previous_row() {
        let mut h = Harness::new();
        let mut messages = page(70..=74, ME);
        messages.extend(page(75..=77, OTHER));
        h.seed(meta(77, 77, 0), messages);
        let last = h.controller.store.index_of_id(77).unwrap();
        assert!(h.controller.store.get(last).unwrap().is_last_of_user_run);
        h.drain();

        h.controller.apply_push(deleted(&[77]));

        let previous = h.controller.store.index_of_id(76).unwrap();
        assert!(h.controller.store.get(previous).unwrap().is_last_of_user_run);
        let updates = h.drain();
        assert_eq!(
            updates[..2],
            [
                ViewUpdate::Deleted {
                    sections: vec![],
                    rows: vec![last]
                },
                ViewUpdate::Reloaded(previous),
            ]
        );
        assert_eq!(h.controller.cursor.last_message_id, 76);
    }

    #[test]
    fn deleted_rows_do_not_come_back_with_a_late_fetch() {
        let mut h = Harness::new();
        h.seed(meta(5, 5, 0), page(1..=5, OTHER));
        h.controller.apply_push(deleted(&[3]));

        let rows = page(1..=5, OTHER).into_iter().map(MessageRow::from_message).collect();
        merge_batch(&mut h.controller.store, rows);
        assert!(h.controller.store.index_of_id(3).is_none());
        assert_eq!(h.controller.store.row_count(), 4);
    }

    #[test]
    fn deleting_the_only_message_empties_the_view() {
        let mut h = Harness::new();
        h.seed(meta(1, 1, 0), page(1..=1, OTHER));
        h.drain();

        h.controller.apply_push(deleted(&[1]));
        assert_eq!(
            h.drain(),
            vec![
                ViewUpdate::Deleted {
                    sections: vec![0],
                    rows: vec![]
                },
                ViewUpdate::EmptyStateChanged(true),
            ]
        );
    }

    #[test]
    fn new_message_at_tail_is_appended() {
        let mut h = Harness::new();
        h.seed(meta(5, 5, 0), page(1..=5, OTHER));
        h.controller.at_bottom = true;
        h.drain();

        h.controller.apply_push(PushEvent::NewMessage { message: msg(6, OTHER) });

        assert_eq!(h.controller.store.last_row().unwrap().id, Some(6));
        assert_eq!(h.controller.cursor.last_message_id, 6);
        assert_eq!(h.controller.cursor.unread_count, 1);
        let updates = h.drain();
        assert!(matches!(
            &updates[0],
            ViewUpdate::Inserted { rows, scroll_to: Some(_), animate: true, .. }
                if rows == &vec![IndexPath::new(0, 5)]
        ));
        // Row 5 is no longer the end of the run.
        assert!(updates.contains(&ViewUpdate::Reloaded(IndexPath::new(0, 4))));
    }

    #[test]
    fn new_message_from_someone_else_does_not_scroll_when_reading_history() {
        let mut h = Harness::new();
        h.seed(meta(5, 5, 0), page(1..=5, OTHER));
        h.controller.at_bottom = false;
        h.drain();

        h.controller.apply_push(PushEvent::NewMessage { message: msg(6, OTHER) });
        assert!(matches!(
            h.drain().first(),
            Some(ViewUpdate::Inserted { scroll_to: None, .. })
        ));
    }

    #[test]
    fn new_message_is_dropped_when_tail_is_not_resident() {
        let mut h = Harness::new();
        h.seed(meta(40, 40, 0), page(1..=20, OTHER));

        h.controller.apply_push(PushEvent::NewMessage { message: msg(41, OTHER) });

        assert_eq!(h.controller.store.row_count(), 20);
        assert_eq!(h.controller.cursor.last_message_id, 41);
        assert!(h.controller.cursor.has_more_bottom);
    }

    #[test]
    fn confirmed_upload_replaces_placeholder_even_off_tail() {
        let mut h = Harness::new();
        h.seed(meta(40, 40, 0), page(1..=20, OTHER));
        h.controller.add_pending_upload("local-9".into(), "hi".into());

        let mut confirmed = msg(41, ME);
        confirmed.unique_id = "local-9".into();
        h.controller.apply_push(PushEvent::NewMessage { message: confirmed });

        let row = h.controller.store.last_row().unwrap();
        assert_eq!((row.id, row.unique_id.as_str()), (Some(41), "local-9"));
        assert_eq!(h.controller.store.row_count(), 21);
    }

    #[test]
    fn new_messages_wait_for_a_window_replacement() {
        let mut h = Harness::new();
        h.controller.open(meta(10, 10, 0));
        let job = h.take_fetch();

        h.controller.apply_push(PushEvent::NewMessage { message: msg(11, OTHER) });
        assert!(h.controller.store.is_empty());

        h.controller
            .on_fetch_reply(job.reply(Some(Ok(page(1..=10, OTHER))), None));
        assert_eq!(h.controller.store.last_row().unwrap().id, Some(11));
        assert_eq!(h.controller.store.row_count(), 11);
    }

    #[test]
    fn edit_updates_text_in_place() {
        let mut h = Harness::new();
        h.seed(meta(3, 3, 0), page(1..=3, OTHER));
        h.drain();

        let mut message = msg(2, OTHER);
        message.text = "fixed typo\nmore".into();
        h.controller.apply_push(PushEvent::Edited { message });

        let row = h.controller.store.get(IndexPath::new(0, 1)).unwrap();
        assert!(row.edited);
        assert_eq!(row.preview, "fixed typo");
        assert_eq!(h.drain(), vec![ViewUpdate::Reloaded(IndexPath::new(0, 1))]);
    }

    #[test]
    fn edit_that_reorders_emits_a_move() {
        let mut h = Harness::new();
        h.seed(meta(3, 3, 0), page(1..=3, OTHER));
        h.drain();

        let mut message = msg(1, OTHER);
        message.time = t(3) + 1;
        h.controller.apply_push(PushEvent::Edited { message });

        assert_eq!(
            h.controller.store.rows().map(|r| r.id).collect::<Vec<_>>(),
            vec![Some(2), Some(3), Some(1)]
        );
        let updates = h.drain();
        assert_eq!(
            updates[0],
            ViewUpdate::MovedRow {
                from: IndexPath::new(0, 0),
                to: IndexPath::new(0, 2)
            }
        );
    }

    #[test]
    fn seen_receipt_is_cumulative_over_own_messages() {
        let mut h = Harness::new();
        let mut messages = page(1..=3, ME);
        messages.push(msg(4, OTHER));
        messages.extend(page(5..=6, ME));
        h.seed(meta(6, 6, 0), messages);

        h.controller.apply_push(PushEvent::Seen {
            thread_id: 1,
            message_id: 5,
            unique_id: None,
        });

        let seen: Vec<bool> = h.controller.store.rows().map(|r| r.seen).collect();
        assert_eq!(seen, vec![true, true, true, false, true, false]);
        assert!(h.controller.store.rows().filter(|r| r.seen).all(|r| r.delivered));
    }

    #[test]
    fn delivered_receipt_finds_placeholder_by_correlation_key() {
        let mut h = Harness::new();
        h.seed(meta(2, 2, 0), page(1..=2, OTHER));
        h.controller.add_pending_upload("local-1".into(), "hey".into());

        h.controller.apply_push(PushEvent::Delivered {
            thread_id: 1,
            message_id: 99,
            unique_id: Some("local-1".into()),
        });
        let row = h.controller.store.last_row().unwrap();
        assert!(row.delivered && !row.seen);
    }

    #[test]
    fn new_pin_unpins_previous_row() {
        let mut h = Harness::new();
        h.seed(meta(3, 3, 0), page(1..=3, OTHER));
        h.drain();

        h.controller.apply_push(PushEvent::Pinned {
            thread_id: 1,
            message_id: 1,
            time: t(1),
        });
        h.controller.apply_push(PushEvent::Pinned {
            thread_id: 1,
            message_id: 3,
            time: t(3),
        });

        let pinned: Vec<bool> = h.controller.store.rows().map(|r| r.pinned).collect();
        assert_eq!(pinned, vec![false, false, true]);
        assert_eq!(h.controller.cursor.pinned.map(|p| p.message_id), Some(3));
        assert_eq!(h.drain().len(), 3);

        h.controller.apply_push(PushEvent::Unpinned {
            thread_id: 1,
            message_id: 3,
        });
        assert!(h.controller.store.rows().all(|r| !r.pinned));
        assert!(h.controller.cursor.pinned.is_none());
    }

    #[test]
    fn events_for_other_conversations_are_ignored() {
        let mut h = Harness::new();
        h.seed(meta(3, 3, 0), page(1..=3, OTHER));
        h.controller.apply_push(PushEvent::Deleted {
            message_ids: vec![2],
            conversation_id: 99,
        });
        assert_eq!(h.controller.store.row_count(), 3);
        assert!(h.controller.store.rows().all(|r| r.unique_id != UNREAD_BANNER_ID));
    }

    #[test]
    fn page_in_flight_does_not_undo_pushed_edit_or_pin() {
        let mut h = Harness::new();
        h.seed(meta(30, 30, 0), page(1..=30, OTHER));
        h.controller.cursor.has_more_bottom = true;
        h.controller.evaluate_edge_loads();
        let job = h.take_fetch();

        let mut edit = msg(30, OTHER);
        edit.text = "edited text".into();
        edit.edited = true;
        h.controller.apply_push(PushEvent::Edited { message: edit });
        h.controller.apply_push(PushEvent::Pinned {
            thread_id: 1,
            message_id: 30,
            time: t(30),
        });

        h.controller
            .on_fetch_reply(job.reply(None, Some(Ok(page(30..=54, OTHER)))));

        let path = h.controller.store.index_of_id(30).unwrap();
        let row = h.controller.store.get(path).unwrap();
        assert_eq!(row.text, "edited text");
        assert!(row.edited && row.pinned);
        assert_eq!(h.controller.cursor.pinned.map(|p| p.message_id), Some(30));
        assert_eq!(h.controller.store.rows().filter(|r| r.pinned).count(), 1);
        assert_eq!(h.controller.store.row_count(), 54);
    }
}
