//! Background reactions and avatar fetching.
//!
//! The history actor decides what is missing ([`EnrichmentState`]) and the
//! [`EnrichmentQueue`] worker fetches it off the single-writer path. Results
//! are posted back and applied by the actor like any other mutation.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use haven_types::api::ReactionGroup;

use crate::error::FetchError;

/// Remote endpoints for enrichment data.
pub trait EnrichmentSource: Send + Sync + 'static {
    /// Summaries keyed by message id. Ids without reactions may be absent.
    fn fetch_reactions(
        &self,
        conversation_id: i64,
        message_ids: Vec<i64>,
    ) -> impl Future<Output = Result<HashMap<i64, Vec<ReactionGroup>>, FetchError>> + Send;

    fn fetch_avatar(
        &self,
        owner_id: i64,
    ) -> impl Future<Output = Result<Option<Bytes>, FetchError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrichRequest {
    Reactions {
        conversation_id: i64,
        message_ids: Vec<i64>,
    },
    Avatar {
        owner_id: i64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnrichResult {
    Reactions {
        requested: Vec<i64>,
        summaries: HashMap<i64, Vec<ReactionGroup>>,
    },
    ReactionsFailed {
        requested: Vec<i64>,
    },
    /// `image == None` means the owner has no avatar.
    Avatar {
        owner_id: i64,
        image: Option<Bytes>,
    },
    AvatarFailed {
        owner_id: i64,
    },
}

/// What has been asked for and what is cached. Owned by the actor.
#[derive(Debug, Default)]
pub struct EnrichmentState {
    reactions_in_flight: HashSet<i64>,
    /// `None` records that the owner has no avatar.
    avatars: HashMap<i64, Option<Bytes>>,
    avatars_in_flight: HashSet<i64>,
}

impl EnrichmentState {
    /// Ids that still need a reactions request. Marks them in flight.
    pub fn claim_reactions(&mut self, ids: impl IntoIterator<Item = i64>) -> Vec<i64> {
        let mut claimed: Vec<i64> = ids
            .into_iter()
            .filter(|id| self.reactions_in_flight.insert(*id))
            .collect();
        claimed.sort_unstable();
        claimed
    }

    pub fn release_reactions(&mut self, ids: &[i64]) {
        for id in ids {
            self.reactions_in_flight.remove(id);
        }
    }

    pub fn cached_avatar(&self, owner_id: i64) -> Option<Bytes> {
        self.avatars.get(&owner_id).cloned().flatten()
    }

    /// True if a request for this owner should be sent now.
    pub fn claim_avatar(&mut self, owner_id: i64) -> bool {
        !self.avatars.contains_key(&owner_id) && self.avatars_in_flight.insert(owner_id)
    }

    pub fn store_avatar(&mut self, owner_id: i64, image: Option<Bytes>) {
        self.avatars_in_flight.remove(&owner_id);
        self.avatars.insert(owner_id, image);
    }

    /// Forget a failed request so the next batch retries it.
    pub fn release_avatar(&mut self, owner_id: i64) {
        self.avatars_in_flight.remove(&owner_id);
    }

    /// Forget in-flight claims after the worker was cancelled.
    pub fn reset_in_flight(&mut self) {
        self.reactions_in_flight.clear();
        self.avatars_in_flight.clear();
    }
}

/// Handle to the enrichment worker task.
pub struct EnrichmentQueue {
    tx: mpsc::UnboundedSender<EnrichRequest>,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl EnrichmentQueue {
    /// Spawn the worker. `on_result` is called from the worker task.
    pub fn spawn<E, F>(source: Arc<E>, on_result: F) -> Self
    where
        E: EnrichmentSource,
        F: Fn(EnrichResult) + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<EnrichRequest>();
        let token = CancellationToken::new();
        let worker_token = token.clone();

        let handle = tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    _ = worker_token.cancelled() => break,
                    request = rx.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                };

                let result = tokio::select! {
                    _ = worker_token.cancelled() => break,
                    result = run_request(source.as_ref(), request) => result,
                };
                on_result(result);
            }
            debug!("Enrichment worker stopped");
        });

        Self { tx, token, handle }
    }

    pub fn enqueue(&self, request: EnrichRequest) {
        if self.tx.send(request).is_err() {
            warn!("Enrichment worker is gone, dropping request");
        }
    }

    pub fn shutdown(self) {
        self.token.cancel();
        drop(self.tx);
        drop(self.handle);
    }
}

async fn run_request<E: EnrichmentSource>(source: &E, request: EnrichRequest) -> EnrichResult {
    match request {
        EnrichRequest::Reactions {
            conversation_id,
            message_ids,
        } => match source.fetch_reactions(conversation_id, message_ids.clone()).await {
            Ok(summaries) => EnrichResult::Reactions {
                requested: message_ids,
                summaries,
            },
            Err(e) => {
                warn!("Reaction fetch for {} messages failed: {}", message_ids.len(), e);
                EnrichResult::ReactionsFailed {
                    requested: message_ids,
                }
            }
        },
        EnrichRequest::Avatar { owner_id } => match source.fetch_avatar(owner_id).await {
            Ok(image) => EnrichResult::Avatar { owner_id, image },
            Err(e) => {
                warn!("Avatar fetch for {} failed: {}", owner_id, e);
                EnrichResult::AvatarFailed { owner_id }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reactions_are_claimed_once() {
        let mut state = EnrichmentState::default();
        assert_eq!(state.claim_reactions([3, 1, 2]), vec![1, 2, 3]);
        assert_eq!(state.claim_reactions([2, 4]), vec![4]);

        state.release_reactions(&[2]);
        assert_eq!(state.claim_reactions([2]), vec![2]);
    }

    #[test]
    fn avatars_are_cached_per_owner() {
        let mut state = EnrichmentState::default();
        assert!(state.claim_avatar(7));
        assert!(!state.claim_avatar(7));

        state.store_avatar(7, Some(Bytes::from_static(b"png")));
        assert!(!state.claim_avatar(7));
        assert_eq!(state.cached_avatar(7), Some(Bytes::from_static(b"png")));

        assert!(state.claim_avatar(8));
        state.store_avatar(8, None);
        assert!(!state.claim_avatar(8));
        assert_eq!(state.cached_avatar(8), None);

        assert!(state.claim_avatar(9));
        state.release_avatar(9);
        assert!(state.claim_avatar(9));
    }

    struct FixedSource;

    impl EnrichmentSource for FixedSource {
        async fn fetch_reactions(
            &self,
            _conversation_id: i64,
            message_ids: Vec<i64>,
        ) -> Result<HashMap<i64, Vec<ReactionGroup>>, FetchError> {
            Ok(message_ids
                .into_iter()
                .map(|id| {
                    let group = ReactionGroup {
                        emoji: "👍".into(),
                        count: 1,
                        user_ids: vec![id],
                    };
                    (id, vec![group])
                })
                .collect())
        }

        async fn fetch_avatar(&self, _owner_id: i64) -> Result<Option<Bytes>, FetchError> {
            Err(FetchError::Failed("offline".into()))
        }
    }

    #[tokio::test]
    async fn worker_posts_results_back() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = EnrichmentQueue::spawn(Arc::new(FixedSource), move |result| {
            let _ = tx.send(result);
        });

        queue.enqueue(EnrichRequest::Reactions {
            conversation_id: 1,
            message_ids: vec![5],
        });
        queue.enqueue(EnrichRequest::Avatar { owner_id: 2 });

        match rx.recv().await.unwrap() {
            EnrichResult::Reactions { requested, summaries } => {
                assert_eq!(requested, vec![5]);
                assert_eq!(summaries[&5][0].count, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            rx.recv().await.unwrap(),
            EnrichResult::AvatarFailed { owner_id: 2 }
        );
        queue.shutdown();
    }
}
