//! Candidate store: per-(batch, entity) cache of settlement candidates.
//!
//! Each entity is fetched at most once per batch. A fetch failure is kept as
//! [`CacheEntry::Error`], distinct from a legitimately empty result, and is
//! not retried unless the caller asks for it through
//! [`SettlementEngine::retry_failed`].
//!
//! Concurrent callers for the same entity share one request: the first caller
//! marks the slot as fetching and the others wait on its completion signal.
//! Every slot carries a generation number, so a response that arrives after
//! its entity was evicted (or after the batch was replaced) is discarded
//! instead of being written back.

use std::collections::{BTreeSet, HashMap};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{CandidateQuery, SettlementApi};
use crate::engine::SettlementEngine;
use crate::error::{EngineError, EngineResult};
use crate::models::{BatchId, BatchScope, EntityId, ReferenceId, SettlementBatch, TransactionCandidate};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEntry {
    NotFetched,
    Fetching,
    /// The backend returned no candidates.
    Empty,
    Loaded(Vec<TransactionCandidate>),
    /// The fetch failed; the reason is kept for display.
    Error(String),
}

impl CacheEntry {
    /// Candidates as a list. `Error` reads as an empty list, matching the
    /// dashboard's "treat a failed fetch as zero candidates" behaviour.
    pub fn candidates(&self) -> &[TransactionCandidate] {
        match self {
            CacheEntry::Loaded(list) => list,
            _ => &[],
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            CacheEntry::Empty | CacheEntry::Loaded(_) | CacheEntry::Error(_)
        )
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            CacheEntry::Error(reason) => Some(reason),
            _ => None,
        }
    }
}

enum SlotState {
    Fetching(watch::Receiver<bool>),
    Ready(CacheEntry),
}

struct CacheSlot {
    batch_id: BatchId,
    generation: u64,
    state: SlotState,
}

/// What a caller of `fetch_candidates` has to do next.
pub(crate) enum FetchStep {
    Ready(CacheEntry),
    Wait(watch::Receiver<bool>),
    Fetch {
        generation: u64,
        done: watch::Sender<bool>,
    },
}

#[derive(Default)]
pub(crate) struct CandidateCache {
    slots: HashMap<EntityId, CacheSlot>,
    next_generation: u64,
}

impl CandidateCache {
    pub fn entry(&self, entity_id: &str) -> CacheEntry {
        match self.slots.get(entity_id).map(|s| &s.state) {
            None => CacheEntry::NotFetched,
            Some(SlotState::Fetching(_)) => CacheEntry::Fetching,
            Some(SlotState::Ready(entry)) => entry.clone(),
        }
    }

    pub fn begin(&mut self, batch_id: &str, entity_id: &str) -> FetchStep {
        if let Some(slot) = self.slots.get(entity_id) {
            if slot.batch_id == batch_id {
                match &slot.state {
                    SlotState::Ready(entry) => return FetchStep::Ready(entry.clone()),
                    // A closed channel means the fetching caller went away
                    // without finishing; start over.
                    SlotState::Fetching(rx) if rx.has_changed().is_ok() => {
                        return FetchStep::Wait(rx.clone())
                    }
                    SlotState::Fetching(_) => {}
                }
            }
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let (done, rx) = watch::channel(false);
        self.slots.insert(
            entity_id.to_string(),
            CacheSlot {
                batch_id: batch_id.to_string(),
                generation,
                state: SlotState::Fetching(rx),
            },
        );
        FetchStep::Fetch { generation, done }
    }

    /// Store a fetch result. Returns `false` when the slot no longer belongs
    /// to this fetch and the result was discarded.
    pub fn complete(
        &mut self,
        batch_id: &str,
        entity_id: &str,
        generation: u64,
        entry: CacheEntry,
    ) -> bool {
        match self.slots.get_mut(entity_id) {
            Some(slot) if slot.batch_id == batch_id && slot.generation == generation => {
                slot.state = SlotState::Ready(entry);
                true
            }
            _ => false,
        }
    }

    pub fn valid(&self, entity_id: &str) -> Vec<TransactionCandidate> {
        match self.slots.get(entity_id).map(|s| &s.state) {
            Some(SlotState::Ready(CacheEntry::Loaded(list))) => {
                list.iter().filter(|c| c.is_valid()).cloned().collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn valid_ids(&self, entity_id: &str) -> BTreeSet<ReferenceId> {
        match self.slots.get(entity_id).map(|s| &s.state) {
            Some(SlotState::Ready(CacheEntry::Loaded(list))) => list
                .iter()
                .filter(|c| c.is_valid())
                .map(|c| c.reference_id.clone())
                .collect(),
            _ => BTreeSet::new(),
        }
    }

    pub fn evict(&mut self, entity_id: &str) -> bool {
        self.slots.remove(entity_id).is_some()
    }

    /// Forget a failed entry so the next fetch goes to the network again.
    pub fn clear_error(&mut self, entity_id: &str) -> bool {
        let failed = matches!(
            self.slots.get(entity_id).map(|s| &s.state),
            Some(SlotState::Ready(CacheEntry::Error(_)))
        );
        if failed {
            self.slots.remove(entity_id);
        }
        failed
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

fn candidate_query(batch: &SettlementBatch, entity_id: &str) -> CandidateQuery {
    match &batch.scope {
        BatchScope::Direct { .. } => CandidateQuery::Direct {
            batch_id: batch.id.clone(),
        },
        BatchScope::Franchise { .. } => CandidateQuery::Franchise {
            batch_id: batch.id.clone(),
            merchant_id: entity_id.to_string(),
            cycle_key: batch.cycle_key,
            product_id: batch.product_id,
        },
    }
}

// ---------------------------------------------------------------------------
// Engine operations
// ---------------------------------------------------------------------------

impl<A> SettlementEngine<A> {
    /// Current cache entry for an entity, without fetching.
    pub fn candidates(&self, entity_id: &str) -> CacheEntry {
        self.workspace().cache.entry(entity_id)
    }

    /// Cached candidates that carry no error reason.
    pub fn get_valid(&self, entity_id: &str) -> Vec<TransactionCandidate> {
        self.workspace().cache.valid(entity_id)
    }

    /// Drop an entity's cache entry. Its selection goes with it, since a
    /// selection may only reference cached candidates.
    pub fn evict(&self, entity_id: &str) -> bool {
        let mut ws = self.workspace();
        ws.selection.clear_entity(entity_id);
        ws.cache.evict(entity_id)
    }
}

impl<A: SettlementApi> SettlementEngine<A> {
    /// Return the entity's candidates, fetching them on first access.
    pub async fn fetch_candidates(
        &self,
        batch: &SettlementBatch,
        entity_id: &str,
    ) -> EngineResult<CacheEntry> {
        loop {
            let step = {
                let mut ws = self.workspace();
                ws.require_batch(&batch.id)?;
                ws.require_active_entity(entity_id)?;
                ws.cache.begin(&batch.id, entity_id)
            };

            match step {
                FetchStep::Ready(entry) => return Ok(entry),
                FetchStep::Wait(mut rx) => {
                    debug!(batch_id = %batch.id, entity_id, "waiting for in-flight candidate fetch");
                    // An error only means the fetching caller was dropped;
                    // the next pass through `begin` sorts that out.
                    let _ = rx.wait_for(|done| *done).await;
                }
                FetchStep::Fetch { generation, done } => {
                    let entry = self.load_candidates(batch, entity_id).await;
                    let stored = self.workspace().cache.complete(
                        &batch.id,
                        entity_id,
                        generation,
                        entry.clone(),
                    );
                    let _ = done.send(true);

                    if !stored {
                        info!(
                            batch_id = %batch.id,
                            entity_id,
                            "discarding candidate response for removed merchant"
                        );
                        return Err(EngineError::validation(format!(
                            "Merchant {entity_id} was removed from batch {} before its candidates arrived",
                            batch.id
                        )));
                    }
                    return Ok(entry);
                }
            }
        }
    }

    /// Explicitly refetch an entity whose previous fetch failed. Entries in
    /// any other state are returned as cached.
    pub async fn retry_failed(
        &self,
        batch: &SettlementBatch,
        entity_id: &str,
    ) -> EngineResult<CacheEntry> {
        {
            let mut ws = self.workspace();
            ws.require_batch(&batch.id)?;
            if ws.cache.clear_error(entity_id) {
                info!(batch_id = %batch.id, entity_id, "retrying failed candidate fetch");
            }
        }
        self.fetch_candidates(batch, entity_id).await
    }

    async fn load_candidates(&self, batch: &SettlementBatch, entity_id: &str) -> CacheEntry {
        let query = candidate_query(batch, entity_id);
        let result = self
            .api
            .fetch_candidates(&query)
            .await
            .and_then(|body| TransactionCandidate::list_from_value(&body));

        match result {
            Ok(list) if list.is_empty() => CacheEntry::Empty,
            Ok(list) => {
                let invalid = list.iter().filter(|c| !c.is_valid()).count();
                debug!(
                    batch_id = %batch.id,
                    entity_id,
                    candidates = list.len(),
                    invalid,
                    "candidates loaded"
                );
                CacheEntry::Loaded(list)
            }
            Err(e) => {
                warn!(batch_id = %batch.id, entity_id, error = %e, "candidate fetch failed");
                CacheEntry::Error(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{candidate, direct_engine, franchise_engine, invalid_candidate};
    use rust_decimal_macros::dec;

    #[test]
    fn test_late_completion_for_evicted_slot_is_rejected() {
        let mut cache = CandidateCache::default();
        let FetchStep::Fetch { generation, .. } = cache.begin("b-1", "m-1") else {
            panic!("expected a fresh fetch");
        };
        assert_eq!(cache.entry("m-1"), CacheEntry::Fetching);
        assert!(cache.evict("m-1"));
        assert!(!cache.complete("b-1", "m-1", generation, CacheEntry::Empty));
        assert_eq!(cache.entry("m-1"), CacheEntry::NotFetched);
    }

    #[test]
    fn test_completion_from_older_generation_is_rejected() {
        let mut cache = CandidateCache::default();
        let FetchStep::Fetch { generation: old, .. } = cache.begin("b-1", "m-1") else {
            panic!("expected a fresh fetch");
        };
        cache.evict("m-1");
        let FetchStep::Fetch { generation: new, done } = cache.begin("b-1", "m-1") else {
            panic!("expected a fresh fetch");
        };
        assert!(!cache.complete("b-1", "m-1", old, CacheEntry::Empty));
        assert!(cache.complete("b-1", "m-1", new, CacheEntry::Error("boom".into())));
        drop(done);
        assert_eq!(cache.entry("m-1").error(), Some("boom"));
    }

    #[tokio::test]
    async fn test_fetch_is_cached_for_the_batch_lifetime() {
        let (engine, mock, batch) = direct_engine("m-1").await;
        mock.set_candidates("m-1", vec![candidate("t1", "10.00", "0.10")]);

        let first = engine.fetch_candidates(&batch, "m-1").await.unwrap();
        mock.set_candidates("m-1", vec![candidate("t2", "99.00", "1.00")]);
        let second = engine.fetch_candidates(&batch, "m-1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.candidates()[0].reference_id, "t1");
        assert_eq!(mock.fetch_count("m-1"), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_distinct_from_empty_and_not_retried() {
        let (engine, mock, batch) = franchise_engine(&["m-1", "m-2"]).await;
        mock.set_candidates("m-1", Vec::new());
        mock.fail_candidates("m-2", EngineError::Transport("timed out".into()));

        let empty = engine.fetch_candidates(&batch, "m-1").await.unwrap();
        let failed = engine.fetch_candidates(&batch, "m-2").await.unwrap();
        assert_eq!(empty, CacheEntry::Empty);
        assert_eq!(failed, CacheEntry::Error("timed out".into()));
        assert!(failed.candidates().is_empty());

        engine.fetch_candidates(&batch, "m-2").await.unwrap();
        assert_eq!(mock.fetch_count("m-2"), 1);

        mock.set_candidates("m-2", vec![candidate("t9", "5.00", "0.05")]);
        let retried = engine.retry_failed(&batch, "m-2").await.unwrap();
        assert_eq!(retried.candidates().len(), 1);
        assert_eq!(mock.fetch_count("m-2"), 2);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_request() {
        let (engine, mock, batch) = franchise_engine(&["m-1"]).await;
        mock.set_candidates("m-1", vec![candidate("t1", "1.00", "0.00")]);
        mock.hold("m-1");

        let (a, b, _) = tokio::join!(
            engine.fetch_candidates(&batch, "m-1"),
            engine.fetch_candidates(&batch, "m-1"),
            async {
                tokio::task::yield_now().await;
                mock.release("m-1");
            }
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(mock.fetch_count("m-1"), 1);
    }

    #[tokio::test]
    async fn test_out_of_order_completion_updates_only_own_slot() {
        let (engine, mock, batch) = franchise_engine(&["m-1", "m-2"]).await;
        mock.set_candidates("m-1", vec![candidate("a1", "1.00", "0.00")]);
        mock.set_candidates("m-2", vec![candidate("b1", "2.00", "0.00")]);
        mock.hold("m-1");

        let (first, second, _) = tokio::join!(
            engine.fetch_candidates(&batch, "m-1"),
            engine.fetch_candidates(&batch, "m-2"),
            async {
                tokio::task::yield_now().await;
                mock.release("m-1");
            }
        );
        assert_eq!(first.unwrap().candidates()[0].reference_id, "a1");
        assert_eq!(second.unwrap().candidates()[0].reference_id, "b1");
        assert_eq!(engine.get_valid("m-1")[0].reference_id, "a1");
        assert_eq!(engine.get_valid("m-2")[0].reference_id, "b1");
    }

    #[tokio::test]
    async fn test_late_response_for_removed_merchant_is_discarded() {
        let (engine, mock, batch) = franchise_engine(&["m-1", "m-2"]).await;
        mock.set_candidates("m-2", vec![candidate("b1", "2.00", "0.00")]);
        mock.hold("m-2");

        let (late, _) = tokio::join!(engine.fetch_candidates(&batch, "m-2"), async {
            tokio::task::yield_now().await;
            engine.remove_entity("m-2").unwrap();
            mock.release("m-2");
        });
        assert!(late.unwrap_err().is_validation());
        assert_eq!(engine.candidates("m-2"), CacheEntry::NotFetched);
    }

    #[tokio::test]
    async fn test_get_valid_skips_error_candidates() {
        let (engine, mock, batch) = direct_engine("m-1").await;
        mock.set_candidates(
            "m-1",
            vec![
                candidate("t1", "10.00", "0.10"),
                invalid_candidate("t2", "20.00", "Chargeback pending"),
            ],
        );
        engine.fetch_candidates(&batch, "m-1").await.unwrap();
        let valid = engine.get_valid("m-1");
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].amount, dec!(10.00));
    }

    #[tokio::test]
    async fn test_malformed_candidate_rows_are_cached_as_error() {
        let (engine, mock, batch) = franchise_engine(&["m-1", "m-2"]).await;
        mock.set_candidates(
            "m-1",
            vec![
                candidate("t1", "4.00", "0.00"),
                candidate("t2", "3.00", "0.00"),
                candidate("t2", "3.00", "0.00"),
            ],
        );
        mock.set_candidates(
            "m-2",
            vec![serde_json::json!({
                "transactionReferenceId": "u1", "amount": "12,50", "fee": "0.10"
            })],
        );

        for merchant in ["m-1", "m-2"] {
            let entry = engine.fetch_candidates(&batch, merchant).await.unwrap();
            assert!(entry.error().is_some(), "{merchant}: {entry:?}");
            assert_eq!(engine.select_all(merchant).unwrap(), 0);
            assert_eq!(engine.totals(merchant).total_valid_count, 0);
        }
        assert_eq!(
            engine.candidates("m-1").error(),
            Some("Invalid response from settlement API: duplicate candidate t2")
        );
    }

    #[tokio::test]
    async fn test_evict_drops_selection_and_forces_refetch() {
        let (engine, mock, batch) = direct_engine("m-1").await;
        mock.set_candidates("m-1", vec![candidate("t1", "2.00", "0.02")]);
        engine.fetch_candidates(&batch, "m-1").await.unwrap();
        engine.toggle("m-1", "t1").unwrap();

        assert!(engine.evict("m-1"));
        assert!(engine.selected_ids("m-1").is_empty());
        assert!(!engine.evict("m-1"));

        engine.fetch_candidates(&batch, "m-1").await.unwrap();
        assert_eq!(mock.fetch_count("m-1"), 2);
    }

    #[tokio::test]
    async fn test_fetch_for_entity_outside_batch_is_rejected() {
        let (engine, mock, batch) = franchise_engine(&["m-1"]).await;
        let err = engine.fetch_candidates(&batch, "m-9").await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(mock.fetch_count("m-9"), 0);
    }
}
