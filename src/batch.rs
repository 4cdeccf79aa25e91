//! Batch lifecycle: create-or-get, franchise batches, cancellation and
//! filter changes.
//!
//! A failed create leaves the workspace exactly as it was. A successful create
//! installs the returned batch; when it differs from the active one the old
//! batch's caches and selections are discarded with it.

use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{info, warn};

use crate::api::{CreateBatchRequest, EntityKind, FranchiseBatchRequest, SettlementApi};
use crate::engine::{InFlight, SettlementEngine};
use crate::error::{EngineError, EngineResult};
use crate::guard::{ConfirmationGate, UNSAVED_CHANGES_PROMPT};
use crate::models::{
    BatchFilter, BatchScope, BatchStatus, CycleKey, EntityId, ReferenceEntity, SettlementBatch,
};
use crate::tristate::{GroupState, TriStateGroup};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelOutcome {
    Cancelled,
    /// The user declined to discard unsaved selections. Nothing changed.
    Declined,
}

fn require_filter(root_id: &str, label: &str, product_id: i64) -> EngineResult<()> {
    if root_id.trim().is_empty() {
        return Err(EngineError::validation(format!("Select a {label}")));
    }
    if product_id <= 0 {
        return Err(EngineError::validation("Select a product"));
    }
    Ok(())
}

impl<A> SettlementEngine<A> {
    pub fn active_batch(&self) -> Option<SettlementBatch> {
        self.workspace().batch.clone()
    }

    pub fn active_filter(&self) -> Option<BatchFilter> {
        self.workspace().batch.as_ref().map(SettlementBatch::filter)
    }

    /// Record a change of the defining filter. Anything other than the active
    /// batch's own filter discards the batch, its caches and its selections.
    /// Returns whether a reset happened.
    pub fn apply_filter(&self, filter: &BatchFilter) -> bool {
        let mut ws = self.workspace();
        match ws.batch.as_ref() {
            Some(batch) if batch.filter() != *filter => {
                info!(
                    batch_id = %batch.id,
                    cycle_key = %filter.cycle_key,
                    product_id = filter.product_id,
                    "settlement filter changed, discarding active batch"
                );
                ws.reset();
                true
            }
            _ => false,
        }
    }
}

impl<A: SettlementApi> SettlementEngine<A> {
    /// Create the direct batch for `(entity, cycle, product)`, or get the one
    /// the backend already has open for it.
    pub async fn create_or_get_batch(
        &self,
        entity_id: &str,
        cycle_key: CycleKey,
        product_id: i64,
    ) -> EngineResult<SettlementBatch> {
        require_filter(entity_id, "merchant", product_id)?;
        let _in_flight = InFlight::acquire(&self.creating, "Batch creation")?;

        let req = CreateBatchRequest {
            entity_id: entity_id.trim().to_string(),
            cycle_key,
            created_by: self.config.created_by.clone(),
            product_id,
        };
        let body = self.api.create_batch(&req).await?;
        let scope = BatchScope::Direct {
            merchant_id: req.entity_id.clone(),
        };
        let batch = SettlementBatch::from_response(
            &body,
            scope,
            cycle_key,
            product_id,
            &self.config.created_by,
        )?;

        info!(
            batch_id = %batch.id,
            merchant_id = %req.entity_id,
            cycle_key = %cycle_key,
            product_id,
            status = %batch.status,
            "direct settlement batch ready"
        );
        self.workspace().install(batch.clone());
        Ok(batch)
    }

    /// Create a batch spanning the given merchants of a franchise.
    pub async fn create_franchise_batch(
        &self,
        franchise_id: &str,
        cycle_key: CycleKey,
        product_id: i64,
        merchant_ids: &[EntityId],
    ) -> EngineResult<SettlementBatch> {
        require_filter(franchise_id, "franchise", product_id)?;
        let merchants: BTreeSet<EntityId> = merchant_ids
            .iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        if merchants.is_empty() {
            return Err(EngineError::validation("Select at least one merchant"));
        }
        let _in_flight = InFlight::acquire(&self.creating, "Batch creation")?;

        let req = FranchiseBatchRequest {
            franchise_id: franchise_id.trim().to_string(),
            cycle_key,
            created_by: self.config.created_by.clone(),
            product_id,
            merchant_ids: merchants.iter().cloned().collect(),
        };
        let body = self.api.create_franchise_batch(&req).await?;
        let scope = BatchScope::Franchise {
            franchise_id: req.franchise_id.clone(),
            merchant_ids: merchants,
        };
        let batch = SettlementBatch::from_response(
            &body,
            scope,
            cycle_key,
            product_id,
            &self.config.created_by,
        )?;

        info!(
            batch_id = %batch.id,
            franchise_id = %req.franchise_id,
            merchants = req.merchant_ids.len(),
            cycle_key = %cycle_key,
            product_id,
            "franchise settlement batch ready"
        );
        self.workspace().install(batch.clone());
        Ok(batch)
    }

    /// Cancel the active batch. Unsaved selections need the gate's approval
    /// first; a declined prompt changes nothing and sends nothing.
    pub async fn cancel_batch(&self, gate: &dyn ConfirmationGate) -> EngineResult<CancelOutcome> {
        let (batch_id, needs_confirmation) = {
            let ws = self.workspace();
            let batch = ws
                .batch
                .as_ref()
                .ok_or_else(|| EngineError::validation("No active settlement batch"))?;
            if !batch.status.can_transition_to(BatchStatus::Cancelled) {
                return Err(EngineError::InvalidTransition {
                    from: batch.status,
                    to: BatchStatus::Cancelled,
                });
            }
            (batch.id.clone(), ws.has_unsaved_changes())
        };

        if needs_confirmation && !gate.confirm(UNSAVED_CHANGES_PROMPT) {
            info!(batch_id = %batch_id, "batch cancel declined by user");
            return Ok(CancelOutcome::Declined);
        }

        self.api.cancel_batch(&batch_id).await?;

        let mut ws = self.workspace();
        match ws.batch.as_mut() {
            Some(batch) if batch.id == batch_id => {
                batch.transition(BatchStatus::Cancelled)?;
                ws.reset();
                info!(batch_id = %batch_id, "settlement batch cancelled");
            }
            _ => warn!(batch_id = %batch_id, "batch was replaced while its cancel was in flight"),
        }
        Ok(CancelOutcome::Cancelled)
    }

    pub async fn list_merchants(&self) -> EngineResult<Vec<ReferenceEntity>> {
        self.list_reference(EntityKind::Merchants).await
    }

    pub async fn list_franchises(&self) -> EngineResult<Vec<ReferenceEntity>> {
        self.list_reference(EntityKind::Franchises).await
    }

    pub async fn list_products(&self) -> EngineResult<Vec<ReferenceEntity>> {
        self.list_reference(EntityKind::Products).await
    }

    async fn list_reference(&self, kind: EntityKind) -> EngineResult<Vec<ReferenceEntity>> {
        let body = self.api.list_entities(kind).await?;
        ReferenceEntity::list_from_value(&body)
    }
}

// ---------------------------------------------------------------------------
// Franchise merchant picker
// ---------------------------------------------------------------------------

fn merchant_id(m: &ReferenceEntity) -> EntityId {
    m.id.clone()
}

/// Merchant checklist shown before a franchise batch is created.
#[derive(Debug, Clone, Default)]
pub struct MerchantPicker {
    merchants: Vec<ReferenceEntity>,
    selected: BTreeSet<EntityId>,
}

impl MerchantPicker {
    pub fn new(merchants: Vec<ReferenceEntity>) -> Self {
        Self {
            merchants,
            selected: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> GroupState {
        TriStateGroup::new(&self.merchants, merchant_id).state(&self.selected)
    }

    pub fn toggle_all(&mut self) -> GroupState {
        TriStateGroup::new(&self.merchants, merchant_id).toggle(&mut self.selected)
    }

    pub fn toggle(&mut self, merchant_id: &str) -> bool {
        if !self.merchants.iter().any(|m| m.id == merchant_id) {
            return false;
        }
        if !self.selected.remove(merchant_id) {
            self.selected.insert(merchant_id.to_string());
        }
        true
    }

    pub fn selected_ids(&self) -> Vec<EntityId> {
        self.selected.iter().cloned().collect()
    }
}
