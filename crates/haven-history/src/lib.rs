//! Message history engine for a Haven conversation view.
//!
//! A [`HistoryController`] owns the sectioned row store and decides which
//! pages to fetch. [`spawn_history`] runs it on a tokio task and hands out
//! a [`HistoryHandle`]. The view only sees deltas through a
//! [`HistoryViewSink`].

pub mod actor;
pub mod anchor;
pub mod config;
pub mod context;
pub mod controller;
pub mod enrichment;
pub mod error;
pub mod fetch;
pub mod http;
pub mod merge;
pub mod reconciler;
pub mod row;
pub mod scenario;
pub mod sink;
pub mod store;

pub use actor::{HistoryHandle, spawn_history};
pub use anchor::{AnchorStore, MemoryAnchorStore, ScrollAnchor};
pub use config::HistoryConfig;
pub use context::{ConnectionStatus, SyncContext};
pub use controller::{ConversationCursor, HistoryController, HistorySnapshot, ScrollPhase, Viewport};
pub use enrichment::EnrichmentSource;
pub use error::{FetchError, HistoryError};
pub use fetch::HistorySource;
pub use http::HttpHistorySource;
pub use row::{MessageRow, RowKind};
pub use sink::{ChannelSink, HistoryViewSink, LoadingEdge, ScrollPosition, ScrollTarget, TracingSink, ViewUpdate};
pub use store::{HistoryStore, IndexPath};
