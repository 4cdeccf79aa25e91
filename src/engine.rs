//! Settlement engine state.
//!
//! The active batch, its candidate cache, the per-entity selections and the
//! set of active entities live together in one [`Workspace`] behind a single
//! lock. Operations that touch more than one of them (entity removal, batch
//! replacement, reset after commit) therefore never expose a half-applied
//! state. The lock is never held across an `.await`.
//!
//! The operations themselves are spread over the component modules:
//! `batch`, `candidates`, `selection`, `commit` and `guard`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use crate::api::HttpSettlementApi;
use crate::candidates::CandidateCache;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::{EntityId, SettlementBatch};
use crate::selection::SelectionState;

#[derive(Default)]
pub(crate) struct Workspace {
    pub batch: Option<SettlementBatch>,
    pub active_entities: BTreeSet<EntityId>,
    pub cache: CandidateCache,
    pub selection: SelectionState,
}

impl Workspace {
    /// Drop the batch together with every cache entry and selection.
    pub fn reset(&mut self) {
        self.batch = None;
        self.active_entities.clear();
        self.cache.clear();
        self.selection.clear();
    }

    /// Make `batch` the active batch. A different batch replaces the current
    /// one wholesale. The same batch keeps its caches; the active set is
    /// brought in line with the returned scope, dropping entities that left
    /// it and admitting the ones that joined.
    pub fn install(&mut self, batch: SettlementBatch) {
        let same_batch = self.batch.as_ref().is_some_and(|b| b.id == batch.id);
        if !same_batch {
            if let Some(previous) = self.batch.as_ref() {
                info!(
                    previous_batch = %previous.id,
                    batch_id = %batch.id,
                    "replacing active settlement batch"
                );
            }
            self.reset();
            self.active_entities = batch.scope.entities();
        } else {
            let dropped: Vec<EntityId> = self
                .active_entities
                .iter()
                .filter(|e| !batch.scope.contains(e))
                .cloned()
                .collect();
            for entity in dropped {
                self.remove_entity(&entity);
            }
            for entity in batch.scope.entities() {
                if self.active_entities.insert(entity.clone()) {
                    debug!(batch_id = %batch.id, entity_id = %entity, "merchant joined active batch");
                }
            }
        }
        self.batch = Some(batch);
    }

    /// Remove an entity with its selection and cache entry in one step.
    pub fn remove_entity(&mut self, entity_id: &str) -> bool {
        let was_active = self.active_entities.remove(entity_id);
        self.selection.clear_entity(entity_id);
        self.cache.evict(entity_id);
        was_active
    }

    pub fn require_batch(&self, batch_id: &str) -> EngineResult<&SettlementBatch> {
        match self.batch.as_ref() {
            Some(b) if b.id == batch_id => Ok(b),
            Some(b) => Err(EngineError::validation(format!(
                "Batch {batch_id} is not the active batch (active: {})",
                b.id
            ))),
            None => Err(EngineError::validation("No active settlement batch")),
        }
    }

    pub fn require_active_entity(&self, entity_id: &str) -> EngineResult<()> {
        if self.active_entities.contains(entity_id) {
            Ok(())
        } else {
            Err(EngineError::validation(format!(
                "Merchant {entity_id} is not part of the active batch"
            )))
        }
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.batch.is_some() && self.selection.has_any()
    }
}

// ---------------------------------------------------------------------------
// In-flight flags
// ---------------------------------------------------------------------------

/// Non-reentrant marker for one kind of operation. Released on drop.
pub(crate) struct InFlight<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlight<'a> {
    pub fn acquire(flag: &'a AtomicBool, operation: &'static str) -> EngineResult<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .map_err(|_| EngineError::Busy(operation))?;
        Ok(Self { flag })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SettlementEngine<A> {
    pub(crate) api: Arc<A>,
    pub(crate) config: EngineConfig,
    pub(crate) state: Mutex<Workspace>,
    pub(crate) creating: AtomicBool,
    pub(crate) committing: AtomicBool,
}

impl SettlementEngine<HttpSettlementApi> {
    /// Engine backed by the HTTP settlement API described by `config`.
    pub fn connect(config: EngineConfig) -> EngineResult<Self> {
        let api = HttpSettlementApi::new(config.clone())?;
        Self::new(config, Arc::new(api))
    }
}

impl<A> SettlementEngine<A> {
    pub fn new(config: EngineConfig, api: Arc<A>) -> EngineResult<Self> {
        config.validate()?;
        debug!(created_by = %config.created_by, api = %config.api_base_url, "settlement engine ready");
        Ok(Self {
            api,
            config,
            state: Mutex::new(Workspace::default()),
            creating: AtomicBool::new(false),
            committing: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// A panic while the lock was held cannot leave a half-written workspace
    /// (every mutation is a single assignment or a `reset`), so poisoning is
    /// ignored.
    pub(crate) fn workspace(&self) -> MutexGuard<'_, Workspace> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_creating(&self) -> bool {
        self.creating.load(Ordering::SeqCst)
    }

    pub fn is_committing(&self) -> bool {
        self.committing.load(Ordering::SeqCst)
    }

    pub fn active_entities(&self) -> Vec<EntityId> {
        self.workspace().active_entities.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_flag_is_not_reentrant() {
        let flag = AtomicBool::new(false);
        let first = InFlight::acquire(&flag, "Batch creation").expect("first acquire");
        assert_eq!(
            InFlight::acquire(&flag, "Batch creation").err(),
            Some(EngineError::Busy("Batch creation"))
        );
        drop(first);
        assert!(InFlight::acquire(&flag, "Batch creation").is_ok());
    }

    #[test]
    fn test_engine_rejects_config_without_user() {
        let cfg = EngineConfig::new("localhost:9000", "");
        let result = SettlementEngine::new(cfg, Arc::new(()));
        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}
