//! Scripted in-memory settlement API and fixtures for the unit tests.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use crate::api::{
    CandidateQuery, CreateBatchRequest, EntityKind, FranchiseBatchRequest, SettlementApi,
};
use crate::config::EngineConfig;
use crate::engine::SettlementEngine;
use crate::error::{EngineError, EngineResult};
use crate::models::{BatchId, CycleKey, EntityId, ReferenceId, SettlementBatch};

#[derive(Default)]
struct MockState {
    next_batch: u64,
    /// Open batch per create key, so repeated creates return the same id.
    open_batches: HashMap<String, BatchId>,
    direct_merchants: HashMap<BatchId, EntityId>,
    created: Vec<CreateBatchRequest>,
    franchise_created: Vec<FranchiseBatchRequest>,
    /// When set, every franchise create answers with this id whatever the
    /// merchant list.
    pinned_franchise_batch: Option<BatchId>,
    create_failure: Option<EngineError>,
    candidates: HashMap<EntityId, Result<Vec<Value>, EngineError>>,
    fetches: HashMap<EntityId, usize>,
    commit_failure: Option<EngineError>,
    commit_attempts: usize,
    direct_commits: Vec<(BatchId, Vec<ReferenceId>)>,
    franchise_commits: Vec<(BatchId, BTreeMap<EntityId, Vec<ReferenceId>>)>,
    cancel_failure: Option<EngineError>,
    cancels: Vec<BatchId>,
    reference: HashMap<&'static str, Value>,
}

#[derive(Default)]
pub(crate) struct MockSettlementApi {
    state: Mutex<MockState>,
    candidate_gates: Mutex<HashMap<EntityId, Arc<Semaphore>>>,
    commit_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockSettlementApi {
    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_candidates(&self, entity_id: &str, rows: Vec<Value>) {
        self.state()
            .candidates
            .insert(entity_id.to_string(), Ok(rows));
    }

    pub fn fail_candidates(&self, entity_id: &str, err: EngineError) {
        self.state()
            .candidates
            .insert(entity_id.to_string(), Err(err));
    }

    pub fn fetch_count(&self, entity_id: &str) -> usize {
        self.state().fetches.get(entity_id).copied().unwrap_or(0)
    }

    /// Block the next candidate response for `entity_id` until `release`.
    pub fn hold(&self, entity_id: &str) {
        self.candidate_gates
            .lock()
            .unwrap()
            .insert(entity_id.to_string(), Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, entity_id: &str) {
        if let Some(gate) = self.candidate_gates.lock().unwrap().get(entity_id) {
            gate.add_permits(1);
        }
    }

    pub fn hold_commits(&self) {
        *self.commit_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_commits(&self) {
        if let Some(gate) = self.commit_gate.lock().unwrap().as_ref() {
            gate.add_permits(1);
        }
    }

    pub fn pin_franchise_batch(&self, batch_id: &str) {
        self.state().pinned_franchise_batch = Some(batch_id.to_string());
    }

    pub fn fail_next_create(&self, err: EngineError) {
        self.state().create_failure = Some(err);
    }

    pub fn fail_next_commit(&self, err: EngineError) {
        self.state().commit_failure = Some(err);
    }

    pub fn fail_next_cancel(&self, err: EngineError) {
        self.state().cancel_failure = Some(err);
    }

    pub fn set_reference(&self, kind: EntityKind, rows: Value) {
        self.state().reference.insert(kind.route(), rows);
    }

    pub fn create_count(&self) -> usize {
        let state = self.state();
        state.created.len() + state.franchise_created.len()
    }

    pub fn created_requests(&self) -> Vec<CreateBatchRequest> {
        self.state().created.clone()
    }

    pub fn commit_attempts(&self) -> usize {
        self.state().commit_attempts
    }

    pub fn direct_commits(&self) -> Vec<(BatchId, Vec<ReferenceId>)> {
        self.state().direct_commits.clone()
    }

    pub fn franchise_commits(&self) -> Vec<(BatchId, BTreeMap<EntityId, Vec<ReferenceId>>)> {
        self.state().franchise_commits.clone()
    }

    pub fn cancel_count(&self) -> usize {
        self.state().cancels.len()
    }

    fn open_batch(&self, key: String, created_by: &str) -> EngineResult<Value> {
        let mut state = self.state();
        if let Some(err) = state.create_failure.take() {
            return Err(err);
        }
        let pinned = key
            .starts_with("franchise|")
            .then(|| state.pinned_franchise_batch.clone())
            .flatten();
        let id = match pinned.or_else(|| state.open_batches.get(&key).cloned()) {
            Some(id) => id,
            None => {
                state.next_batch += 1;
                let id = format!("batch-{}", state.next_batch);
                state.open_batches.insert(key, id.clone());
                id
            }
        };
        Ok(serde_json::json!({
            "id": id,
            "status": "OPEN",
            "createdBy": created_by,
            "createdAt": "2026-10-19T08:00:00Z",
        }))
    }

    fn close_batch(state: &mut MockState, batch_id: &str) {
        state.open_batches.retain(|_, id| id != batch_id);
    }

    async fn pass_commit_gate(&self) {
        let gate = self.commit_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
            *self.commit_gate.lock().unwrap() = None;
        }
    }
}

#[async_trait]
impl SettlementApi for MockSettlementApi {
    async fn list_entities(&self, kind: EntityKind) -> EngineResult<Value> {
        Ok(self
            .state()
            .reference
            .get(kind.route())
            .cloned()
            .unwrap_or_else(|| serde_json::json!([])))
    }

    async fn create_batch(&self, req: &CreateBatchRequest) -> EngineResult<Value> {
        self.state().created.push(req.clone());
        let key = format!("{}|{}|{}", req.entity_id, req.cycle_key, req.product_id);
        let body = self.open_batch(key, &req.created_by)?;
        if let Some(id) = body["id"].as_str() {
            self.state()
                .direct_merchants
                .insert(id.to_string(), req.entity_id.clone());
        }
        Ok(body)
    }

    async fn create_franchise_batch(&self, req: &FranchiseBatchRequest) -> EngineResult<Value> {
        self.state().franchise_created.push(req.clone());
        let key = format!(
            "franchise|{}|{}|{}|{}",
            req.franchise_id,
            req.cycle_key,
            req.product_id,
            req.merchant_ids.join(",")
        );
        self.open_batch(key, &req.created_by)
    }

    async fn fetch_candidates(&self, query: &CandidateQuery) -> EngineResult<Value> {
        let entity_id = match query {
            CandidateQuery::Direct { batch_id } => self
                .state()
                .direct_merchants
                .get(batch_id)
                .cloned()
                .unwrap_or_default(),
            CandidateQuery::Franchise { merchant_id, .. } => merchant_id.clone(),
        };
        *self.state().fetches.entry(entity_id.clone()).or_default() += 1;

        let gate = self.candidate_gates.lock().unwrap().get(&entity_id).cloned();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
            self.candidate_gates.lock().unwrap().remove(&entity_id);
        }

        match self.state().candidates.get(&entity_id) {
            Some(Ok(rows)) => Ok(Value::Array(rows.clone())),
            Some(Err(err)) => Err(err.clone()),
            None => Ok(serde_json::json!([])),
        }
    }

    async fn commit_direct(
        &self,
        batch_id: &str,
        vendor_tx_ids: &[ReferenceId],
    ) -> EngineResult<Value> {
        self.state().commit_attempts += 1;
        self.pass_commit_gate().await;

        let mut state = self.state();
        if let Some(err) = state.commit_failure.take() {
            return Err(err);
        }
        state
            .direct_commits
            .push((batch_id.to_string(), vendor_tx_ids.to_vec()));
        Self::close_batch(&mut state, batch_id);
        Ok(serde_json::json!({ "success": true, "settled": vendor_tx_ids.len() }))
    }

    async fn commit_franchise(
        &self,
        batch_id: &str,
        selection: &BTreeMap<EntityId, Vec<ReferenceId>>,
    ) -> EngineResult<Value> {
        self.state().commit_attempts += 1;
        self.pass_commit_gate().await;

        let mut state = self.state();
        if let Some(err) = state.commit_failure.take() {
            return Err(err);
        }
        state
            .franchise_commits
            .push((batch_id.to_string(), selection.clone()));
        Self::close_batch(&mut state, batch_id);
        Ok(serde_json::json!({ "success": true }))
    }

    async fn cancel_batch(&self, batch_id: &str) -> EngineResult<()> {
        let mut state = self.state();
        if let Some(err) = state.cancel_failure.take() {
            return Err(err);
        }
        state.cancels.push(batch_id.to_string());
        Self::close_batch(&mut state, batch_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub(crate) fn candidate(id: &str, amount: &str, fee: &str) -> Value {
    let net = Decimal::from_str(amount).unwrap() - Decimal::from_str(fee).unwrap();
    serde_json::json!({
        "transactionReferenceId": id,
        "amount": amount,
        "fee": fee,
        "netAmount": net.to_string(),
    })
}

pub(crate) fn invalid_candidate(id: &str, amount: &str, reason: &str) -> Value {
    serde_json::json!({
        "transactionReferenceId": id,
        "amount": amount,
        "fee": "0",
        "netAmount": amount,
        "error": reason,
    })
}

pub(crate) fn reference_rows(rows: &[(&str, &str)]) -> Value {
    Value::Array(
        rows.iter()
            .map(|(id, name)| serde_json::json!({ "id": id, "name": name, "status": "active" }))
            .collect(),
    )
}

pub(crate) fn test_config() -> EngineConfig {
    EngineConfig::new("localhost:9400", "tester")
}

pub(crate) fn engine_with(mock: Arc<MockSettlementApi>) -> SettlementEngine<MockSettlementApi> {
    SettlementEngine::new(test_config(), mock).expect("test engine")
}

pub(crate) async fn direct_engine(
    merchant_id: &str,
) -> (
    SettlementEngine<MockSettlementApi>,
    Arc<MockSettlementApi>,
    SettlementBatch,
) {
    let mock = Arc::new(MockSettlementApi::default());
    let engine = engine_with(mock.clone());
    let batch = engine
        .create_or_get_batch(merchant_id, CycleKey::T0, 7)
        .await
        .expect("direct batch");
    (engine, mock, batch)
}

pub(crate) async fn franchise_engine(
    merchant_ids: &[&str],
) -> (
    SettlementEngine<MockSettlementApi>,
    Arc<MockSettlementApi>,
    SettlementBatch,
) {
    let mock = Arc::new(MockSettlementApi::default());
    let engine = engine_with(mock.clone());
    let merchants: Vec<EntityId> = merchant_ids.iter().map(|m| m.to_string()).collect();
    let batch = engine
        .create_franchise_batch("f-1", CycleKey::T1, 7, &merchants)
        .await
        .expect("franchise batch");
    (engine, mock, batch)
}
