//! Selection tracking and derived totals.
//!
//! A selection only ever references valid (error-free) candidates that are
//! present in the cache for the same entity; every mutation checks the id
//! against the cache first. Totals are never stored: they are recomputed from
//! the cache and the selection on each call.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

use crate::engine::SettlementEngine;
use crate::error::{EngineError, EngineResult};
use crate::models::{EntityId, ReferenceId, TransactionCandidate};
use crate::tristate::{GroupState, TriStateGroup};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionTotals {
    pub selected_count: usize,
    pub total_valid_count: usize,
    pub amount: Decimal,
    pub fee: Decimal,
    pub net: Decimal,
}

impl SelectionTotals {
    pub fn compute(valid: &[TransactionCandidate], selected: &BTreeSet<ReferenceId>) -> Self {
        let mut totals = Self {
            total_valid_count: valid.len(),
            ..Self::default()
        };
        for c in valid.iter().filter(|c| selected.contains(&c.reference_id)) {
            totals.selected_count += 1;
            totals.amount += c.amount;
            totals.fee += c.fee;
            totals.net += c.net_amount;
        }
        totals
    }

    fn absorb(&mut self, other: &SelectionTotals) {
        self.selected_count += other.selected_count;
        self.total_valid_count += other.total_valid_count;
        self.amount += other.amount;
        self.fee += other.fee;
        self.net += other.net;
    }
}

#[derive(Default)]
pub(crate) struct SelectionState {
    by_entity: HashMap<EntityId, BTreeSet<ReferenceId>>,
}

impl SelectionState {
    pub fn get(&self, entity_id: &str) -> Option<&BTreeSet<ReferenceId>> {
        self.by_entity.get(entity_id)
    }

    pub fn entry(&mut self, entity_id: &str) -> &mut BTreeSet<ReferenceId> {
        self.by_entity.entry(entity_id.to_string()).or_default()
    }

    pub fn clear_entity(&mut self, entity_id: &str) {
        self.by_entity.remove(entity_id);
    }

    pub fn clear(&mut self) {
        self.by_entity.clear();
    }

    pub fn has_any(&self) -> bool {
        self.by_entity.values().any(|ids| !ids.is_empty())
    }

    /// Non-empty selections only.
    pub fn snapshot(&self) -> BTreeMap<EntityId, Vec<ReferenceId>> {
        self.by_entity
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(entity, ids)| (entity.clone(), ids.iter().cloned().collect()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Engine operations
// ---------------------------------------------------------------------------

impl<A> SettlementEngine<A> {
    /// Flip one candidate in or out of the entity's selection. Returns whether
    /// it is selected afterwards.
    pub fn toggle(&self, entity_id: &str, reference_id: &str) -> EngineResult<bool> {
        let mut ws = self.workspace();
        ws.require_active_entity(entity_id)?;
        if !ws.cache.valid_ids(entity_id).contains(reference_id) {
            return Err(EngineError::validation(format!(
                "Transaction {reference_id} is not a selectable candidate for merchant {entity_id}"
            )));
        }

        let ids = ws.selection.entry(entity_id);
        let selected = if ids.remove(reference_id) {
            false
        } else {
            ids.insert(reference_id.to_string());
            true
        };
        Ok(selected)
    }

    /// Select every valid cached candidate. Returns the number selected.
    pub fn select_all(&self, entity_id: &str) -> EngineResult<usize> {
        let mut ws = self.workspace();
        ws.require_active_entity(entity_id)?;
        let valid = ws.cache.valid_ids(entity_id);
        let count = valid.len();
        *ws.selection.entry(entity_id) = valid;
        Ok(count)
    }

    pub fn select_none(&self, entity_id: &str) -> EngineResult<()> {
        let mut ws = self.workspace();
        ws.require_active_entity(entity_id)?;
        ws.selection.clear_entity(entity_id);
        Ok(())
    }

    pub fn totals(&self, entity_id: &str) -> SelectionTotals {
        let ws = self.workspace();
        let valid = ws.cache.valid(entity_id);
        let empty = BTreeSet::new();
        let selected = ws.selection.get(entity_id).unwrap_or(&empty);
        SelectionTotals::compute(&valid, selected)
    }

    /// Totals summed over every active entity.
    pub fn grand_totals(&self) -> SelectionTotals {
        let ws = self.workspace();
        let empty = BTreeSet::new();
        let mut sum = SelectionTotals::default();
        for entity in &ws.active_entities {
            let valid = ws.cache.valid(entity);
            let selected = ws.selection.get(entity).unwrap_or(&empty);
            sum.absorb(&SelectionTotals::compute(&valid, selected));
        }
        sum
    }

    pub fn selected_ids(&self, entity_id: &str) -> Vec<ReferenceId> {
        self.workspace()
            .selection
            .get(entity_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Non-empty selections keyed by entity.
    pub fn selection_map(&self) -> BTreeMap<EntityId, Vec<ReferenceId>> {
        self.workspace().selection.snapshot()
    }

    /// FULL / PARTIAL / NONE over the entity's valid candidates.
    pub fn group_state(&self, entity_id: &str) -> GroupState {
        let ws = self.workspace();
        let valid = ws.cache.valid(entity_id);
        let empty = BTreeSet::new();
        let selected = ws.selection.get(entity_id).unwrap_or(&empty);
        TriStateGroup::new(&valid, |c: &TransactionCandidate| c.reference_id.clone()).state(selected)
    }

    /// Header checkbox click: FULL or PARTIAL clears, NONE selects all.
    pub fn toggle_group(&self, entity_id: &str) -> EngineResult<GroupState> {
        let mut ws = self.workspace();
        ws.require_active_entity(entity_id)?;
        let valid = ws.cache.valid(entity_id);
        let group = TriStateGroup::new(&valid, |c: &TransactionCandidate| c.reference_id.clone());
        Ok(group.toggle(ws.selection.entry(entity_id)))
    }

    /// Take an entity out of the active set, dropping its selection and its
    /// cache entry together.
    pub fn remove_entity(&self, entity_id: &str) -> EngineResult<()> {
        let mut ws = self.workspace();
        if ws.batch.is_none() {
            return Err(EngineError::validation("No active settlement batch"));
        }
        if ws.remove_entity(entity_id) {
            debug!(entity_id, "merchant removed from active batch");
        }
        Ok(())
    }

    /// Re-admit a merchant of the active franchise batch. Its candidates are
    /// fetched afresh on next access.
    pub fn add_entity(&self, entity_id: &str) -> EngineResult<()> {
        let mut ws = self.workspace();
        let batch = ws
            .batch
            .as_ref()
            .ok_or_else(|| EngineError::validation("No active settlement batch"))?;
        if !batch.scope.contains(entity_id) {
            return Err(EngineError::validation(format!(
                "Merchant {entity_id} is not in the scope of batch {}",
                batch.id
            )));
        }
        ws.active_entities.insert(entity_id.to_string());
        Ok(())
    }

    /// Start buffering toggles; see [`ToggleBuffer`].
    pub fn buffer_toggles(&self) -> ToggleBuffer<'_, A> {
        ToggleBuffer {
            engine: self,
            pending: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Toggle buffering
// ---------------------------------------------------------------------------

/// Collects rapid toggles and applies them in one locked pass on
/// [`flush`](ToggleBuffer::flush). Anything still pending when the buffer is
/// dropped is flushed then.
pub struct ToggleBuffer<'a, A> {
    engine: &'a SettlementEngine<A>,
    pending: Vec<(EntityId, ReferenceId)>,
}

impl<A> ToggleBuffer<'_, A> {
    pub fn push(&mut self, entity_id: &str, reference_id: &str) {
        self.pending
            .push((entity_id.to_string(), reference_id.to_string()));
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Apply all pending toggles. Either every toggle is applied or, when one
    /// of them names an unknown or invalid candidate, none is. The buffer is
    /// empty afterwards in both cases.
    pub fn flush(&mut self) -> EngineResult<usize> {
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return Ok(0);
        }

        let mut ws = self.engine.workspace();
        for (entity_id, reference_id) in &pending {
            ws.require_active_entity(entity_id)?;
            if !ws.cache.valid_ids(entity_id).contains(reference_id) {
                return Err(EngineError::validation(format!(
                    "Transaction {reference_id} is not a selectable candidate for merchant {entity_id}"
                )));
            }
        }
        for (entity_id, reference_id) in &pending {
            let ids = ws.selection.entry(entity_id);
            if !ids.remove(reference_id) {
                ids.insert(reference_id.clone());
            }
        }
        Ok(pending.len())
    }
}

impl<A> Drop for ToggleBuffer<'_, A> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "dropping buffered toggles that could not be applied");
        }
    }
}
