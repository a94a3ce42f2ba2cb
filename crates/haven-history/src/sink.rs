//! View delta callbacks emitted by the history engine.
//!
//! The view layer implements [`HistoryViewSink`]; the engine holds it as a
//! shared handle and never owns the view. All indices are valid for the
//! store state right after the mutation they describe.

use tokio::sync::mpsc;

use crate::store::IndexPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollPosition {
    Top,
    Middle,
    Bottom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadingEdge {
    Top,
    Bottom,
    Center,
}

/// Where to scroll after a change. `pixel_offset` is applied on top of the
/// position when restoring a saved anchor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollTarget {
    pub index: IndexPath,
    pub position: ScrollPosition,
    pub pixel_offset: f64,
}

impl ScrollTarget {
    pub fn new(index: IndexPath, position: ScrollPosition) -> Self {
        Self {
            index,
            position,
            pixel_offset: 0.0,
        }
    }
}

pub trait HistoryViewSink: Send + Sync {
    fn inserted(
        &self,
        sections: &[usize],
        rows: &[IndexPath],
        scroll_to: Option<ScrollTarget>,
        animate: bool,
    );
    fn deleted(&self, sections: &[usize], rows: &[IndexPath]);
    fn reloaded(&self, row: IndexPath);
    fn moved_row(&self, from: IndexPath, to: IndexPath);
    fn scrolled_to(&self, target: ScrollTarget, animate: bool);
    fn loading_changed(&self, edge: LoadingEdge, is_loading: bool);
    fn empty_state_changed(&self, is_empty: bool);
}

/// Owned form of every callback, for sinks that forward over a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewUpdate {
    Inserted {
        sections: Vec<usize>,
        rows: Vec<IndexPath>,
        scroll_to: Option<ScrollTarget>,
        animate: bool,
    },
    Deleted {
        sections: Vec<usize>,
        rows: Vec<IndexPath>,
    },
    Reloaded(IndexPath),
    MovedRow {
        from: IndexPath,
        to: IndexPath,
    },
    ScrolledTo {
        target: ScrollTarget,
        animate: bool,
    },
    LoadingChanged {
        edge: LoadingEdge,
        is_loading: bool,
    },
    EmptyStateChanged(bool),
}

/// Forwards every callback as a [`ViewUpdate`] to a UI thread or a test.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ViewUpdate>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ViewUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, update: ViewUpdate) {
        let _ = self.tx.send(update);
    }
}

impl HistoryViewSink for ChannelSink {
    fn inserted(
        &self,
        sections: &[usize],
        rows: &[IndexPath],
        scroll_to: Option<ScrollTarget>,
        animate: bool,
    ) {
        self.send(ViewUpdate::Inserted {
            sections: sections.to_vec(),
            rows: rows.to_vec(),
            scroll_to,
            animate,
        });
    }

    fn deleted(&self, sections: &[usize], rows: &[IndexPath]) {
        self.send(ViewUpdate::Deleted {
            sections: sections.to_vec(),
            rows: rows.to_vec(),
        });
    }

    fn reloaded(&self, row: IndexPath) {
        self.send(ViewUpdate::Reloaded(row));
    }

    fn moved_row(&self, from: IndexPath, to: IndexPath) {
        self.send(ViewUpdate::MovedRow { from, to });
    }

    fn scrolled_to(&self, target: ScrollTarget, animate: bool) {
        self.send(ViewUpdate::ScrolledTo { target, animate });
    }

    fn loading_changed(&self, edge: LoadingEdge, is_loading: bool) {
        self.send(ViewUpdate::LoadingChanged { edge, is_loading });
    }

    fn empty_state_changed(&self, is_empty: bool) {
        self.send(ViewUpdate::EmptyStateChanged(is_empty));
    }
}

/// Sink that uses the `tracing` crate. Structural changes log at debug,
/// per-row reloads at trace.
pub struct TracingSink;

impl HistoryViewSink for TracingSink {
    fn inserted(
        &self,
        sections: &[usize],
        rows: &[IndexPath],
        scroll_to: Option<ScrollTarget>,
        animate: bool,
    ) {
        tracing::debug!(
            sections = sections.len(),
            rows = rows.len(),
            scroll_to = ?scroll_to.map(|t| t.index),
            animate,
            "inserted",
        );
    }

    fn deleted(&self, sections: &[usize], rows: &[IndexPath]) {
        tracing::debug!(sections = sections.len(), rows = rows.len(), "deleted");
    }

    fn reloaded(&self, row: IndexPath) {
        tracing::trace!(%row, "reloaded");
    }

    fn moved_row(&self, from: IndexPath, to: IndexPath) {
        tracing::trace!(%from, %to, "moved_row");
    }

    fn scrolled_to(&self, target: ScrollTarget, animate: bool) {
        tracing::debug!(index = %target.index, position = ?target.position, animate, "scrolled_to");
    }

    fn loading_changed(&self, edge: LoadingEdge, is_loading: bool) {
        tracing::debug!(?edge, is_loading, "loading_changed");
    }

    fn empty_state_changed(&self, is_empty: bool) {
        tracing::debug!(is_empty, "empty_state_changed");
    }
}

