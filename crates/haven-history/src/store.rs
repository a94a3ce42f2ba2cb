use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use chrono::NaiveDate;
use tracing::warn;

use crate::error::HistoryError;
use crate::row::{MessageRow, UNREAD_BANNER_ID};

/// Position of a row: section index and row index within that section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexPath {
    pub section: usize,
    pub row: usize,
}

impl IndexPath {
    pub fn new(section: usize, row: usize) -> Self {
        Self { section, row }
    }
}

impl fmt::Display for IndexPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "section {} row {}", self.section, self.row)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub date: NaiveDate,
    pub rows: Vec<MessageRow>,
}

/// What a removal actually took out of the store.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Removal {
    /// Rows removed from sections that still exist.
    pub rows: Vec<IndexPath>,
    /// Sections removed because they became empty.
    pub sections: Vec<usize>,
    pub removed: Vec<MessageRow>,
}

impl Removal {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.sections.is_empty()
    }
}

/// Date-sectioned, ordered message rows of one conversation.
#[derive(Debug, Default)]
pub struct HistoryStore {
    sections: Vec<Section>,
    /// Ids deleted during this session. Never re-inserted.
    tombstones: HashSet<i64>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn row_count(&self) -> usize {
        self.sections.iter().map(|s| s.rows.len()).sum()
    }

    pub fn get(&self, path: IndexPath) -> Option<&MessageRow> {
        self.sections.get(path.section)?.rows.get(path.row)
    }

    pub fn get_mut(&mut self, path: IndexPath) -> Option<&mut MessageRow> {
        self.sections.get_mut(path.section)?.rows.get_mut(path.row)
    }

    /// Append to the section matching the row's day, creating it if
    /// needed. Callers sort once per batch with [`HistoryStore::sort_all`].
    pub fn insert(&mut self, row: MessageRow) -> IndexPath {
        let date = row.day();
        let section = match self.sections.iter().position(|s| s.date == date) {
            Some(idx) => idx,
            None => {
                self.sections.push(Section {
                    date,
                    rows: Vec::new(),
                });
                self.sections.len() - 1
            }
        };
        let rows = &mut self.sections[section].rows;
        rows.push(row);
        IndexPath::new(section, rows.len() - 1)
    }

    pub fn sort_all(&mut self) {
        for section in &mut self.sections {
            section.rows.sort_by(compare_rows);
        }
        self.sections.sort_by_key(|s| s.date);
    }

    pub fn index_of_unique(&self, unique_id: &str) -> Option<IndexPath> {
        self.position(|row| row.unique_id == unique_id)
    }

    pub fn index_of_id(&self, id: i64) -> Option<IndexPath> {
        self.position(|row| row.id == Some(id))
    }

    pub fn banner_index(&self) -> Option<IndexPath> {
        self.index_of_unique(UNREAD_BANNER_ID)
    }

    pub fn position<F>(&self, mut pred: F) -> Option<IndexPath>
    where
        F: FnMut(&MessageRow) -> bool,
    {
        self.sections.iter().enumerate().find_map(|(s, section)| {
            section
                .rows
                .iter()
                .position(&mut pred)
                .map(|r| IndexPath::new(s, r))
        })
    }

    /// Remove rows. Unknown paths are skipped with a warning: a deferred
    /// deletion can race a fetch that already reshaped the store.
    pub fn remove_at(&mut self, paths: &[IndexPath]) -> Removal {
        let mut valid: Vec<IndexPath> = Vec::with_capacity(paths.len());
        for &path in paths {
            if self.get(path).is_none() {
                warn!("Removal skipped: {}", HistoryError::Inconsistent(path));
                continue;
            }
            if !valid.contains(&path) {
                valid.push(path);
            }
        }

        // Descending so earlier paths stay valid while removing.
        valid.sort_unstable_by(|a, b| b.cmp(a));

        let mut removal = Removal::default();
        for path in valid {
            let row = self.sections[path.section].rows.remove(path.row);
            removal.removed.push(row);
            removal.rows.push(path);
        }

        let emptied: Vec<usize> = self
            .sections
            .iter()
            .enumerate()
            .filter(|(_, s)| s.rows.is_empty())
            .map(|(idx, _)| idx)
            .collect();
        for &idx in emptied.iter().rev() {
            self.sections.remove(idx);
        }

        removal.rows.retain(|p| !emptied.contains(&p.section));
        removal.rows.reverse();
        removal.removed.reverse();
        removal.sections = emptied;
        removal
    }

    /// Drop every section. Returns the removed section indices.
    pub fn clear(&mut self) -> Vec<usize> {
        let removed = (0..self.sections.len()).collect();
        self.sections.clear();
        removed
    }

    pub fn first_row(&self) -> Option<&MessageRow> {
        self.rows().next()
    }

    pub fn last_row(&self) -> Option<&MessageRow> {
        self.sections.last()?.rows.last()
    }

    pub fn first_message(&self) -> Option<&MessageRow> {
        self.rows().find(|r| r.is_message())
    }

    pub fn last_message(&self) -> Option<&MessageRow> {
        self.rows().rev().find(|r| r.is_message())
    }

    /// Last row that carries a server id.
    pub fn last_confirmed(&self) -> Option<&MessageRow> {
        self.rows().rev().find(|r| r.id.is_some())
    }

    pub fn last_index(&self) -> Option<IndexPath> {
        let section = self.sections.len().checked_sub(1)?;
        let row = self.sections[section].rows.len().checked_sub(1)?;
        Some(IndexPath::new(section, row))
    }

    pub fn rows(&self) -> impl DoubleEndedIterator<Item = &MessageRow> {
        self.sections.iter().flat_map(|s| s.rows.iter())
    }

    pub fn rows_mut(&mut self) -> impl Iterator<Item = &mut MessageRow> {
        self.sections.iter_mut().flat_map(|s| s.rows.iter_mut())
    }

    pub fn index_paths(&self) -> impl Iterator<Item = IndexPath> + '_ {
        self.sections
            .iter()
            .enumerate()
            .flat_map(|(s, section)| (0..section.rows.len()).map(move |r| IndexPath::new(s, r)))
    }

    pub fn tombstone(&mut self, id: i64) {
        self.tombstones.insert(id);
    }

    pub fn is_tombstoned(&self, id: i64) -> bool {
        self.tombstones.contains(&id)
    }
}

/// Ascending by time. The banner never sorts before a real row with the
/// same time.
fn compare_rows(a: &MessageRow, b: &MessageRow) -> Ordering {
    a.time
        .cmp(&b.time)
        .then_with(|| a.is_banner().cmp(&b.is_banner()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use haven_types::models::Message;

    pub(crate) const DAY: u64 = 86_400_000;
    /// 2024-01-01T00:00:00Z
    pub(crate) const T0: u64 = 1_704_067_200_000;

    pub(crate) fn message(id: i64, owner_id: i64, time: u64) -> Message {
        Message {
            id,
            unique_id: format!("u-{}", id),
            conversation_id: 1,
            owner_id,
            time,
            text: format!("message {}", id),
            edited: false,
            delivered: false,
            seen: false,
            pinned: false,
        }
    }

    pub(crate) fn row(id: i64, owner_id: i64, time: u64) -> MessageRow {
        MessageRow::from_message(message(id, owner_id, time))
    }

    pub(crate) fn ids(store: &HistoryStore) -> Vec<Option<i64>> {
        store.rows().map(|r| r.id).collect()
    }

    #[test]
    fn insert_groups_by_day_and_sort_orders_everything() {
        let mut store = HistoryStore::new();
        store.insert(row(3, 1, T0 + DAY + 5));
        store.insert(row(2, 1, T0 + 10));
        store.insert(row(1, 1, T0 + 1));
        assert_eq!(store.sections().len(), 2);

        store.sort_all();
        assert_eq!(ids(&store), vec![Some(1), Some(2), Some(3)]);
        assert!(store.sections()[0].date < store.sections()[1].date);
    }

    #[test]
    fn banner_sorts_after_rows_with_equal_time() {
        let mut store = HistoryStore::new();
        store.insert(MessageRow::unread_banner(1, T0 + 10));
        store.insert(row(2, 1, T0 + 11));
        store.insert(row(1, 1, T0 + 10));
        store.sort_all();

        let order: Vec<&str> = store.rows().map(|r| r.unique_id.as_str()).collect();
        assert_eq!(order, vec!["u-1", UNREAD_BANNER_ID, "u-2"]);
    }

    #[test]
    fn lookups_by_unique_id_and_id() {
        let mut store = HistoryStore::new();
        store.insert(row(1, 1, T0));
        store.insert(row(2, 1, T0 + DAY));
        store.sort_all();

        assert_eq!(store.index_of_id(2), Some(IndexPath::new(1, 0)));
        assert_eq!(store.index_of_unique("u-1"), Some(IndexPath::new(0, 0)));
        assert_eq!(store.index_of_id(9), None);
    }

    #[test]
    fn removing_last_row_of_section_reports_section_separately() {
        let mut store = HistoryStore::new();
        store.insert(row(1, 1, T0));
        store.insert(row(2, 1, T0 + 1));
        store.insert(row(3, 1, T0 + DAY));
        store.sort_all();

        let removal = store.remove_at(&[IndexPath::new(1, 0), IndexPath::new(0, 1)]);
        assert_eq!(removal.sections, vec![1]);
        assert_eq!(removal.rows, vec![IndexPath::new(0, 1)]);
        assert_eq!(removal.removed.len(), 2);
        assert_eq!(ids(&store), vec![Some(1)]);
    }

    #[test]
    fn removing_unknown_index_is_a_no_op() {
        let mut store = HistoryStore::new();
        store.insert(row(1, 1, T0));

        let removal = store.remove_at(&[IndexPath::new(4, 0), IndexPath::new(0, 3)]);
        assert!(removal.is_empty());
        assert_eq!(store.row_count(), 1);
    }

    #[test]
    fn clear_reports_every_section() {
        let mut store = HistoryStore::new();
        store.insert(row(1, 1, T0));
        store.insert(row(2, 1, T0 + DAY));
        assert_eq!(store.clear(), vec![0, 1]);
        assert!(store.is_empty());
    }
}
