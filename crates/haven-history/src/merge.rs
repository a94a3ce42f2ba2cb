//! Insert-or-update merging of row batches and avatar-run stitching.
//!
//! Stitching is always recomputed locally: an inserted, updated or removed
//! row only affects its own flags and those of its direct neighbours in the
//! same section.

use std::collections::{BTreeSet, HashSet};

use chrono::NaiveDate;
use tracing::{debug, trace};

use crate::row::{MessageRow, day_of};
use crate::store::{HistoryStore, IndexPath, Removal};

/// View-relevant outcome of one merge. All paths refer to the store after
/// the merge, except `removed`, which refers to the store before it.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MergeResult {
    /// Updated rows whose old position no longer matched their new time.
    /// They were taken out and re-inserted; emit this removal first.
    pub removed: Removal,
    pub inserted_sections: Vec<usize>,
    /// New rows in sections that existed before the merge.
    pub inserted_rows: Vec<IndexPath>,
    /// Every new row, including those in new sections.
    pub inserted: Vec<IndexPath>,
    pub updated: Vec<IndexPath>,
    /// Untouched rows whose stitching flags flipped.
    pub restitched: Vec<IndexPath>,
    /// Rows dropped because their id was deleted earlier in the session.
    pub skipped: usize,
}

impl MergeResult {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
            && self.inserted.is_empty()
            && self.updated.is_empty()
            && self.restitched.is_empty()
    }

    /// Rows whose content changed in place and need a reload.
    pub fn reloads(&self) -> impl Iterator<Item = IndexPath> + '_ {
        self.updated.iter().chain(self.restitched.iter()).copied()
    }
}

/// Merge `incoming` into `store`. Re-merging rows that are already present
/// updates them, so merging the same batch twice equals merging it once.
pub fn merge_batch(store: &mut HistoryStore, incoming: Vec<MessageRow>) -> MergeResult {
    let mut result = MergeResult::default();
    let batch = dedupe(incoming);

    let mut fresh: Vec<MessageRow> = Vec::new();
    let mut updated_ids: Vec<String> = Vec::new();
    let mut relocations: Vec<(IndexPath, MessageRow)> = Vec::new();

    for row in batch {
        if row.id.is_some_and(|id| store.is_tombstoned(id)) {
            trace!("Skipping deleted message {:?}", row.id);
            result.skipped += 1;
            continue;
        }

        let existing = store
            .index_of_unique(&row.unique_id)
            .or_else(|| row.id.and_then(|id| store.index_of_id(id)));

        match existing {
            Some(path) if fits_in_place(store, path, &row) => {
                if let Some(current) = store.get_mut(path) {
                    updated_ids.push(current.unique_id.clone());
                    current.absorb(row);
                }
            }
            Some(path) => relocations.push((path, row)),
            None => fresh.push(row),
        }
    }

    let mut inserted_ids: Vec<String> = fresh.iter().map(|r| r.unique_id.clone()).collect();
    let mut seam_ids: Vec<String> = Vec::new();

    if !relocations.is_empty() {
        relocations.sort_by_key(|(path, _)| *path);
        let paths: Vec<IndexPath> = relocations.iter().map(|(path, _)| *path).collect();
        seam_ids = neighbour_ids(store, &paths);
        result.removed = store.remove_at(&paths);

        let removed = std::mem::take(&mut result.removed.removed);
        for (mut old, (_, incoming)) in removed.into_iter().zip(relocations) {
            old.absorb(incoming);
            inserted_ids.push(old.unique_id.clone());
            fresh.push(old);
        }
    }

    let existing_dates: HashSet<NaiveDate> = store.sections().iter().map(|s| s.date).collect();

    for row in fresh {
        store.insert(row);
    }
    store.sort_all();

    result.inserted = resolve(store, &inserted_ids);
    result.updated = resolve(store, &updated_ids);
    result.inserted_sections = store
        .sections()
        .iter()
        .enumerate()
        .filter(|(_, s)| !existing_dates.contains(&s.date))
        .map(|(idx, _)| idx)
        .collect();
    result.inserted_rows = result
        .inserted
        .iter()
        .copied()
        .filter(|p| !result.inserted_sections.contains(&p.section))
        .collect();

    let touched: Vec<IndexPath> = result
        .inserted
        .iter()
        .chain(result.updated.iter())
        .copied()
        .collect();
    let mut targets = touched.clone();
    targets.extend(resolve(store, &seam_ids));
    let changed = restitch_around(store, &targets);
    result.restitched = changed
        .into_iter()
        .filter(|p| !touched.contains(p))
        .collect();

    debug!(
        "Merged batch: {} inserted, {} updated, {} relocated, {} restitched, {} skipped",
        result.inserted.len(),
        result.updated.len(),
        result.removed.rows.len() + result.removed.sections.len(),
        result.restitched.len(),
        result.skipped,
    );
    result
}

/// Recompute stitching for each path and its direct neighbours. Returns the
/// paths whose flags changed.
pub fn restitch_around(store: &mut HistoryStore, paths: &[IndexPath]) -> Vec<IndexPath> {
    let mut targets = BTreeSet::new();
    for path in paths {
        for row in path.row.saturating_sub(1)..=path.row + 1 {
            let candidate = IndexPath::new(path.section, row);
            if store.get(candidate).is_some() {
                targets.insert(candidate);
            }
        }
    }

    let mut changed = Vec::new();
    for path in targets {
        let Some(section) = store.sections().get(path.section) else {
            continue;
        };
        let (first, last) = stitch_flags(&section.rows, path.row);
        if let Some(row) = store.get_mut(path) {
            if row.is_first_of_user_run != first || row.is_last_of_user_run != last {
                row.is_first_of_user_run = first;
                row.is_last_of_user_run = last;
                changed.push(path);
            }
        }
    }
    changed
}

/// Restitch the rows with the given unique ids (and their neighbours).
/// Ids no longer in the store are ignored.
pub fn restitch_ids(store: &mut HistoryStore, unique_ids: &[String]) -> Vec<IndexPath> {
    let paths = resolve(store, unique_ids);
    restitch_around(store, &paths)
}

/// `(is_first_of_user_run, is_last_of_user_run)` for `rows[idx]`. The
/// banner belongs to no run and splits runs around it.
pub fn stitch_flags(rows: &[MessageRow], idx: usize) -> (bool, bool) {
    let Some(row) = rows.get(idx) else {
        return (false, false);
    };
    if !row.is_message() {
        return (false, false);
    }
    let same_owner =
        |other: Option<&MessageRow>| other.is_some_and(|o| o.is_message() && o.owner_id == row.owner_id);
    let prev = idx.checked_sub(1).and_then(|i| rows.get(i));
    let next = rows.get(idx + 1);
    (!same_owner(prev), !same_owner(next))
}

/// Unique ids of the rows directly before and after each path, excluding
/// the paths themselves.
pub(crate) fn neighbour_ids(store: &HistoryStore, paths: &[IndexPath]) -> Vec<String> {
    let mut out = Vec::new();
    for path in paths {
        let before = path.row.checked_sub(1).map(|r| IndexPath::new(path.section, r));
        let after = Some(IndexPath::new(path.section, path.row + 1));
        for candidate in [before, after].into_iter().flatten() {
            if paths.contains(&candidate) {
                continue;
            }
            if let Some(row) = store.get(candidate) {
                out.push(row.unique_id.clone());
            }
        }
    }
    out
}

pub(crate) fn resolve(store: &HistoryStore, unique_ids: &[String]) -> Vec<IndexPath> {
    let mut paths: Vec<IndexPath> = unique_ids
        .iter()
        .filter_map(|id| store.index_of_unique(id))
        .collect();
    paths.sort_unstable();
    paths.dedup();
    paths
}

/// Last occurrence of a unique id wins; first-seen order is kept.
fn dedupe(incoming: Vec<MessageRow>) -> Vec<MessageRow> {
    let mut out: Vec<MessageRow> = Vec::with_capacity(incoming.len());
    for row in incoming {
        match out.iter_mut().find(|r| r.unique_id == row.unique_id) {
            Some(slot) => *slot = row,
            None => out.push(row),
        }
    }
    out
}

/// Whether `incoming` can replace the row at `path` without breaking the
/// section's day or its ordering.
fn fits_in_place(store: &HistoryStore, path: IndexPath, incoming: &MessageRow) -> bool {
    let Some(section) = store.sections().get(path.section) else {
        return false;
    };
    if day_of(incoming.time) != section.date {
        return false;
    }
    let key = |r: &MessageRow| (r.time, r.is_banner());
    let new_key = key(incoming);
    let prev_ok = path
        .row
        .checked_sub(1)
        .and_then(|i| section.rows.get(i))
        .is_none_or(|p| key(p) <= new_key);
    let next_ok = section
        .rows
        .get(path.row + 1)
        .is_none_or(|n| new_key <= key(n));
    prev_ok && next_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::RowKind;
    use crate::store::tests::{DAY, T0, ids, row};

    /// Every maximal same-owner run has exactly one first and one last row.
    fn assert_stitching(store: &HistoryStore) {
        for section in store.sections() {
            let mut idx = 0;
            while idx < section.rows.len() {
                if !section.rows[idx].is_message() {
                    idx += 1;
                    continue;
                }
                let owner = section.rows[idx].owner_id;
                let start = idx;
                while idx < section.rows.len()
                    && section.rows[idx].is_message()
                    && section.rows[idx].owner_id == owner
                {
                    idx += 1;
                }
                let run = &section.rows[start..idx];
                assert_eq!(run.iter().filter(|r| r.is_first_of_user_run).count(), 1);
                assert_eq!(run.iter().filter(|r| r.is_last_of_user_run).count(), 1);
                assert!(run[0].is_first_of_user_run);
                assert!(run[run.len() - 1].is_last_of_user_run);
            }
        }
    }

    fn assert_ordered(store: &HistoryStore) {
        let sections = store.sections();
        for pair in sections.windows(2) {
            assert!(pair[0].date < pair[1].date);
        }
        for section in sections {
            for pair in section.rows.windows(2) {
                assert!(pair[0].time <= pair[1].time);
            }
        }
    }

    fn assert_unique(store: &HistoryStore) {
        let mut seen = HashSet::new();
        for r in store.rows() {
            assert!(seen.insert(r.unique_id.clone()), "duplicate {}", r.unique_id);
        }
    }

    #[test]
    fn merges_new_rows_in_order_with_stitching() {
        let mut store = HistoryStore::new();
        let result = merge_batch(
            &mut store,
            vec![row(3, 2, T0 + 30), row(1, 1, T0 + 10), row(2, 1, T0 + 20)],
        );

        assert_eq!(ids(&store), vec![Some(1), Some(2), Some(3)]);
        assert_eq!(result.inserted.len(), 3);
        assert_eq!(result.inserted_sections, vec![0]);
        assert!(result.inserted_rows.is_empty());
        assert_stitching(&store);
    }

    #[test]
    fn merging_twice_is_idempotent() {
        let batch = vec![
            row(1, 1, T0 + 10),
            row(2, 1, T0 + 20),
            row(3, 2, T0 + DAY),
            row(4, 2, T0 + DAY + 1),
        ];
        let mut once = HistoryStore::new();
        merge_batch(&mut once, batch.clone());

        let mut twice = HistoryStore::new();
        merge_batch(&mut twice, batch.clone());
        let second = merge_batch(&mut twice, batch);

        assert_eq!(once.sections(), twice.sections());
        assert!(second.inserted.is_empty());
        assert_eq!(second.updated.len(), 4);
        assert!(second.restitched.is_empty());
    }

    #[test]
    fn overlapping_pages_never_duplicate() {
        let mut store = HistoryStore::new();
        let first: Vec<MessageRow> = (1..=10).map(|i| row(i, i % 3, T0 + i as u64)).collect();
        let second: Vec<MessageRow> = (6..=15).map(|i| row(i, i % 3, T0 + i as u64)).collect();
        merge_batch(&mut store, first);
        let result = merge_batch(&mut store, second);

        assert_eq!(store.row_count(), 15);
        assert_eq!(result.inserted.len(), 5);
        assert_unique(&store);
        assert_ordered(&store);
        assert_stitching(&store);
    }

    #[test]
    fn confirmed_upload_replaces_placeholder() {
        let mut store = HistoryStore::new();
        merge_batch(&mut store, vec![row(1, 1, T0 + 10)]);
        let placeholder = MessageRow::uploading(1, 1, T0 + 50, "hi", Some("local-1".into()));
        merge_batch(&mut store, vec![placeholder]);

        let mut confirmed = row(2, 1, T0 + 50);
        confirmed.unique_id = "local-1".into();
        let result = merge_batch(&mut store, vec![confirmed]);

        assert_eq!(store.row_count(), 2);
        assert_eq!(result.updated, vec![IndexPath::new(0, 1)]);
        let r = store.get(IndexPath::new(0, 1)).unwrap();
        assert_eq!(r.id, Some(2));
        assert_eq!(r.kind, RowKind::Normal);
    }

    #[test]
    fn update_that_reorders_is_relocated() {
        let mut store = HistoryStore::new();
        merge_batch(&mut store, vec![row(1, 1, T0 + 10), row(2, 1, T0 + 20)]);
        store.get_mut(IndexPath::new(0, 0)).unwrap().is_selected = true;

        let result = merge_batch(&mut store, vec![row(1, 1, T0 + 30)]);

        assert_eq!(ids(&store), vec![Some(2), Some(1)]);
        assert_eq!(result.removed.rows, vec![IndexPath::new(0, 0)]);
        assert_eq!(result.inserted, vec![IndexPath::new(0, 1)]);
        assert!(store.get(IndexPath::new(0, 1)).unwrap().is_selected);
        assert_stitching(&store);
    }

    #[test]
    fn owner_change_at_seam_flips_neighbour() {
        let mut store = HistoryStore::new();
        merge_batch(&mut store, vec![row(1, 1, T0 + 10), row(2, 1, T0 + 20)]);
        assert!(store.get(IndexPath::new(0, 1)).unwrap().is_last_of_user_run);

        let result = merge_batch(&mut store, vec![row(3, 1, T0 + 30)]);

        assert_eq!(result.restitched, vec![IndexPath::new(0, 1)]);
        assert!(!store.get(IndexPath::new(0, 1)).unwrap().is_last_of_user_run);
        assert!(store.get(IndexPath::new(0, 2)).unwrap().is_last_of_user_run);
    }

    #[test]
    fn banner_splits_runs() {
        let mut store = HistoryStore::new();
        merge_batch(
            &mut store,
            vec![
                row(1, 1, T0 + 10),
                MessageRow::unread_banner(1, T0 + 11),
                row(2, 1, T0 + 20),
            ],
        );
        let rows = &store.sections()[0].rows;
        assert!(rows[0].is_first_of_user_run && rows[0].is_last_of_user_run);
        assert!(!rows[1].is_first_of_user_run && !rows[1].is_last_of_user_run);
        assert!(rows[2].is_first_of_user_run && rows[2].is_last_of_user_run);
    }

    #[test]
    fn tombstoned_ids_are_not_resurrected() {
        let mut store = HistoryStore::new();
        store.tombstone(2);
        let result = merge_batch(&mut store, vec![row(1, 1, T0), row(2, 1, T0 + 1)]);
        assert_eq!(result.skipped, 1);
        assert_eq!(ids(&store), vec![Some(1)]);
    }

    #[test]
    fn duplicate_rows_within_a_batch_collapse() {
        let mut store = HistoryStore::new();
        let mut edited = row(1, 1, T0);
        edited.text = "edited".into();
        merge_batch(&mut store, vec![row(1, 1, T0), edited]);
        assert_eq!(store.row_count(), 1);
        assert_eq!(store.first_row().unwrap().text, "edited");
    }

    #[test]
    fn random_merge_sequences_keep_invariants() {
        // Deterministic LCG so the test is reproducible without extra crates.
        let mut seed: u64 = 0x5eed;
        let mut next = move || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            seed >> 33
        };

        let mut store = HistoryStore::new();
        for _ in 0..40 {
            let batch: Vec<MessageRow> = (0..(next() % 12))
                .map(|_| {
                    let id = (next() % 60) as i64 + 1;
                    let owner = (next() % 3) as i64;
                    row(id, owner, T0 + (id as u64) * DAY / 7)
                })
                .collect();
            merge_batch(&mut store, batch);
            assert_unique(&store);
            assert_ordered(&store);
            assert_stitching(&store);
        }
    }
}
