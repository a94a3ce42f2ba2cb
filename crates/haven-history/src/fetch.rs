use std::collections::HashMap;
use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use haven_types::api::{FetchRequest, SortOrder};
use haven_types::models::{ConversationMeta, Message};

use crate::error::FetchError;

/// Which part of the window a fetch belongs to. `Both` is used by
/// scenarios that repopulate the window around a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Top,
    Bottom,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Strictly older than the time, newest first.
    ToTime(u64),
    /// At or after the time, oldest first.
    FromTime(u64),
    /// Page number from the newest message, used when no time anchor exists.
    Offset(u32),
}

impl Cursor {
    pub fn request(self, conversation_id: i64, count: usize) -> FetchRequest {
        let mut req = FetchRequest {
            conversation_id,
            count,
            from_time: None,
            to_time: None,
            offset: None,
            order: SortOrder::Desc,
        };
        match self {
            Cursor::ToTime(t) => req.to_time = Some(t),
            Cursor::FromTime(t) => {
                req.from_time = Some(t);
                req.order = SortOrder::Asc;
            }
            Cursor::Offset(n) => req.offset = Some(n),
        }
        req
    }
}

/// Whether an edge may have more rows. Exhaustion is a normal outcome,
/// not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    More,
    Exhausted,
}

impl PageStatus {
    /// Judged on the raw count returned by the server, before dedup.
    pub fn from_count(count: usize, page_size: usize) -> Self {
        if count < page_size {
            PageStatus::Exhausted
        } else {
            PageStatus::More
        }
    }

    pub fn has_more(self) -> bool {
        self == PageStatus::More
    }
}

/// Remote history endpoint.
pub trait HistorySource: Send + Sync + 'static {
    fn fetch(
        &self,
        request: FetchRequest,
    ) -> impl Future<Output = Result<Vec<Message>, FetchError>> + Send;

    fn conversation(
        &self,
        conversation_id: i64,
    ) -> impl Future<Output = Result<ConversationMeta, FetchError>> + Send;
}

/// A fetch that is allowed to run. The coordinator discards its result if
/// a newer fetch for the same direction was started in the meantime.
#[derive(Debug, Clone)]
pub struct FetchTicket {
    pub direction: Direction,
    pub generation: u64,
    pub token: CancellationToken,
}

#[derive(Debug)]
struct PendingFetch {
    scenario_key: String,
    generation: u64,
    token: CancellationToken,
}

/// Single-flight bookkeeping: at most one pending fetch per direction.
#[derive(Debug)]
pub struct FetchCoordinator {
    page_size: usize,
    next_generation: u64,
    in_flight: HashMap<Direction, PendingFetch>,
}

impl FetchCoordinator {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            next_generation: 1,
            in_flight: HashMap::new(),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Start a fetch, cancelling whatever was in flight for `direction`.
    pub fn begin(&mut self, direction: Direction, scenario_key: impl Into<String>) -> FetchTicket {
        let generation = self.next_generation;
        self.next_generation += 1;
        let token = CancellationToken::new();
        let pending = PendingFetch {
            scenario_key: scenario_key.into(),
            generation,
            token: token.clone(),
        };
        debug!(
            "Fetch {:?} generation {} started for {}",
            direction, generation, pending.scenario_key
        );
        if let Some(previous) = self.in_flight.insert(direction, pending) {
            debug!(
                "Fetch {:?} generation {} ({}) superseded",
                direction, previous.generation, previous.scenario_key
            );
            previous.token.cancel();
        }
        FetchTicket {
            direction,
            generation,
            token,
        }
    }

    /// Mark a fetch as finished. Returns false when its result is stale and
    /// must be discarded.
    pub fn finish(&mut self, direction: Direction, generation: u64) -> bool {
        match self.in_flight.get(&direction) {
            Some(pending) if pending.generation == generation => {
                self.in_flight.remove(&direction);
                true
            }
            _ => {
                trace!("Discarding stale {:?} generation {}", direction, generation);
                false
            }
        }
    }

    /// Cancel everything. Returns the directions that were in flight.
    pub fn cancel_all(&mut self) -> Vec<Direction> {
        let mut cancelled = Vec::new();
        for (direction, pending) in self.in_flight.drain() {
            pending.token.cancel();
            cancelled.push(direction);
        }
        cancelled
    }

    pub fn is_loading(&self, direction: Direction) -> bool {
        self.in_flight.contains_key(&direction)
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn status(&self, count: usize) -> PageStatus {
        PageStatus::from_count(count, self.page_size)
    }
}

/// Run one request unless the ticket is cancelled first.
pub async fn fetch_page<S: HistorySource>(
    source: &S,
    token: &CancellationToken,
    request: FetchRequest,
) -> Result<Vec<Message>, FetchError> {
    tokio::select! {
        _ = token.cancelled() => Err(FetchError::Cancelled),
        result = source.fetch(request) => result,
    }
}
