//! Settlement commits.
//!
//! A commit is validated locally first (topology, open batch, non-empty and
//! selectable ids) and then sent as one all-or-nothing call. The active batch
//! reads PROCESSING while that call is out, which also blocks cancellation.
//! Success moves it to COMMITTED and resets the whole workspace. Failure (or a
//! dropped commit future) puts it back to OPEN with everything else untouched,
//! so the same commit can be retried against the same batch.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::api::SettlementApi;
use crate::engine::{InFlight, SettlementEngine, Workspace};
use crate::error::{EngineError, EngineResult};
use crate::models::{
    BatchId, BatchScope, BatchStatus, EntityId, ReferenceId, SettlementBatch, Topology,
};
use crate::selection::SelectionTotals;

const EMPTY_SELECTION: &str = "Select at least one transaction";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitReceipt {
    pub batch_id: BatchId,
    pub topology: Topology,
    pub entity_count: usize,
    /// Totals of what was submitted, taken from the cache before the reset.
    pub totals: SelectionTotals,
    /// Raw backend response.
    pub response: Value,
}

/// Check that `batch` is the active, open batch and that every id is a
/// selectable candidate of its entity. Returns the submitted totals.
fn validate_submission(
    ws: &Workspace,
    batch: &SettlementBatch,
    submission: &BTreeMap<EntityId, Vec<ReferenceId>>,
) -> EngineResult<SelectionTotals> {
    let active = ws.require_batch(&batch.id)?;
    if active.status != BatchStatus::Open {
        return Err(EngineError::validation(format!(
            "Batch {} is {} and cannot be committed",
            active.id, active.status
        )));
    }

    let mut totals = SelectionTotals::default();
    for (entity_id, ids) in submission {
        ws.require_active_entity(entity_id)?;
        let valid_ids = ws.cache.valid_ids(entity_id);
        if let Some(unknown) = ids.iter().find(|id| !valid_ids.contains(*id)) {
            return Err(EngineError::validation(format!(
                "Transaction {unknown} is not a selectable candidate for merchant {entity_id}"
            )));
        }
        let chosen: BTreeSet<ReferenceId> = ids.iter().cloned().collect();
        let part = SelectionTotals::compute(&ws.cache.valid(entity_id), &chosen);
        totals.selected_count += part.selected_count;
        totals.total_valid_count += part.total_valid_count;
        totals.amount += part.amount;
        totals.fee += part.fee;
        totals.net += part.net;
    }
    Ok(totals)
}

fn dedup(ids: &[ReferenceId]) -> Vec<ReferenceId> {
    let mut seen = BTreeSet::new();
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

/// Marks the active batch PROCESSING for as long as its commit request is
/// out. Dropped without [`settle`](PendingCommit::settle), it rolls the batch
/// back to OPEN.
struct PendingCommit<'a, A> {
    engine: &'a SettlementEngine<A>,
    batch_id: BatchId,
    settled: bool,
}

impl<A> PendingCommit<'_, A> {
    /// Mark the batch committed and clear everything, if it is still the
    /// active batch.
    fn settle(mut self) -> EngineResult<()> {
        self.settled = true;
        let mut ws = self.engine.workspace();
        match ws.batch.as_mut() {
            Some(active) if active.id == self.batch_id => {
                // A create-or-get during the call may have reinstalled it as OPEN.
                if active.status == BatchStatus::Open {
                    active.transition(BatchStatus::Processing)?;
                }
                active.transition(BatchStatus::Committed)?;
                ws.reset();
            }
            _ => warn!(batch_id = %self.batch_id, "batch was replaced while its commit was in flight"),
        }
        Ok(())
    }
}

impl<A> Drop for PendingCommit<'_, A> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut ws = self.engine.workspace();
        let active = ws
            .batch
            .as_mut()
            .filter(|b| b.id == self.batch_id && b.status == BatchStatus::Processing);
        if let Some(active) = active {
            // Rollback of an unconfirmed commit, not a lifecycle step.
            active.status = BatchStatus::Open;
            debug!(batch_id = %self.batch_id, "commit did not complete, batch reopened");
        }
    }
}

impl<A> SettlementEngine<A> {
    /// Validate the submission and move the active batch to PROCESSING in one
    /// locked step.
    fn begin_commit(
        &self,
        batch: &SettlementBatch,
        submission: &BTreeMap<EntityId, Vec<ReferenceId>>,
    ) -> EngineResult<(PendingCommit<'_, A>, SelectionTotals)> {
        let mut ws = self.workspace();
        let totals = validate_submission(&ws, batch, submission)?;
        if let Some(active) = ws.batch.as_mut() {
            active.transition(BatchStatus::Processing)?;
        }
        let pending = PendingCommit {
            engine: self,
            batch_id: batch.id.clone(),
            settled: false,
        };
        Ok((pending, totals))
    }
}

impl<A: SettlementApi> SettlementEngine<A> {
    /// Settle `selected_ids` of a direct batch.
    pub async fn commit_direct(
        &self,
        batch: &SettlementBatch,
        selected_ids: &[ReferenceId],
    ) -> EngineResult<CommitReceipt> {
        let merchant_id = match &batch.scope {
            BatchScope::Direct { merchant_id } => merchant_id.clone(),
            BatchScope::Franchise { .. } => {
                return Err(EngineError::validation(
                    "Franchise batches are committed per merchant",
                ))
            }
        };
        let ids = dedup(selected_ids);
        if ids.is_empty() {
            return Err(EngineError::validation(EMPTY_SELECTION));
        }
        let _in_flight = InFlight::acquire(&self.committing, "Settlement commit")?;

        let submission = BTreeMap::from([(merchant_id, ids)]);
        let (pending, totals) = self.begin_commit(batch, &submission)?;
        let ids = submission.into_values().next().unwrap_or_default();

        let response = self.api.commit_direct(&batch.id, &ids).await.map_err(|e| {
            warn!(batch_id = %batch.id, error = %e, "direct settlement commit failed");
            e
        })?;
        pending.settle()?;

        info!(
            batch_id = %batch.id,
            transactions = totals.selected_count,
            amount = %totals.amount,
            net = %totals.net,
            "direct settlement committed"
        );
        Ok(CommitReceipt {
            batch_id: batch.id.clone(),
            topology: Topology::Direct,
            entity_count: 1,
            totals,
            response,
        })
    }

    /// Settle a franchise batch. Merchants with an empty list are left out;
    /// if nothing remains the commit fails locally.
    pub async fn commit_franchise(
        &self,
        batch: &SettlementBatch,
        selection_map: &BTreeMap<EntityId, Vec<ReferenceId>>,
    ) -> EngineResult<CommitReceipt> {
        if batch.topology() != Topology::Franchise {
            return Err(EngineError::validation(
                "Direct batches are committed with a flat transaction list",
            ));
        }
        let filtered: BTreeMap<EntityId, Vec<ReferenceId>> = selection_map
            .iter()
            .map(|(entity, ids)| (entity.clone(), dedup(ids)))
            .filter(|(_, ids)| !ids.is_empty())
            .collect();
        if filtered.is_empty() {
            return Err(EngineError::validation(EMPTY_SELECTION));
        }
        let _in_flight = InFlight::acquire(&self.committing, "Settlement commit")?;

        let (pending, totals) = self.begin_commit(batch, &filtered)?;

        let response = self
            .api
            .commit_franchise(&batch.id, &filtered)
            .await
            .map_err(|e| {
                warn!(batch_id = %batch.id, error = %e, "franchise settlement commit failed");
                e
            })?;
        pending.settle()?;

        info!(
            batch_id = %batch.id,
            merchants = filtered.len(),
            transactions = totals.selected_count,
            amount = %totals.amount,
            net = %totals.net,
            "franchise settlement committed"
        );
        Ok(CommitReceipt {
            batch_id: batch.id.clone(),
            topology: Topology::Franchise,
            entity_count: filtered.len(),
            totals,
            response,
        })
    }

    /// Commit whatever is currently selected in the active batch.
    pub async fn commit_current(&self) -> EngineResult<CommitReceipt> {
        let (batch, selection) = {
            let ws = self.workspace();
            let batch = ws
                .batch
                .clone()
                .ok_or_else(|| EngineError::validation("No active settlement batch"))?;
            (batch, ws.selection.snapshot())
        };

        match batch.topology() {
            Topology::Direct => {
                let ids: Vec<ReferenceId> = selection.into_values().flatten().collect();
                self.commit_direct(&batch, &ids).await
            }
            Topology::Franchise => self.commit_franchise(&batch, &selection).await,
        }
    }
}
