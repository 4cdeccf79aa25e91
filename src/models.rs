//! Settlement data model: batches, candidates and the filters that define a
//! batch.
//!
//! Response bodies are read through the tolerant `value_*` helpers so that
//! both camelCase and snake_case field spellings from the settlement API are
//! accepted.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{EngineError, EngineResult};

pub type BatchId = String;
pub type EntityId = String;
pub type ReferenceId = String;

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

/// First non-empty string (or number rendered as a string) under any of `keys`.
pub(crate) fn value_str(v: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match v.get(*key) {
            Some(Value::String(s)) => {
                let trimmed = s.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

pub(crate) fn value_i64(v: &Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        match v.get(*key) {
            Some(Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    return Some(i);
                }
            }
            Some(Value::String(s)) => {
                if let Ok(i) = s.trim().parse::<i64>() {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Monetary values arrive either as JSON numbers or as decimal strings.
pub(crate) fn value_decimal(v: &Value, keys: &[&str]) -> Option<Decimal> {
    for key in keys {
        let raw = match v.get(*key) {
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::String(s)) => s.trim().to_string(),
            _ => continue,
        };
        if let Ok(d) = Decimal::from_str(&raw).or_else(|_| Decimal::from_scientific(&raw)) {
            return Some(d);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Cycle key
// ---------------------------------------------------------------------------

/// Settlement timing tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CycleKey {
    T0,
    T1,
    T2,
}

impl CycleKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleKey::T0 => "T0",
            CycleKey::T1 => "T1",
            CycleKey::T2 => "T2",
        }
    }
}

impl fmt::Display for CycleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CycleKey {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "T0" => Ok(CycleKey::T0),
            "T1" => Ok(CycleKey::T1),
            "T2" => Ok(CycleKey::T2),
            other => Err(EngineError::validation(format!(
                "Invalid cycle key: {other}. Must be T0, T1, or T2"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Batch status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BatchStatus {
    Open,
    Processing,
    Committed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Open => "OPEN",
            BatchStatus::Processing => "PROCESSING",
            BatchStatus::Committed => "COMMITTED",
            BatchStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Committed | BatchStatus::Cancelled)
    }

    /// OPEN -> PROCESSING -> COMMITTED, or OPEN -> CANCELLED.
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        matches!(
            (self, next),
            (BatchStatus::Open, BatchStatus::Processing)
                | (BatchStatus::Processing, BatchStatus::Committed)
                | (BatchStatus::Open, BatchStatus::Cancelled)
        )
    }

    fn parse_lenient(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OPEN" | "PENDING" | "CREATED" => Some(BatchStatus::Open),
            "PROCESSING" | "IN_PROGRESS" => Some(BatchStatus::Processing),
            "COMMITTED" | "COMPLETED" | "SETTLED" => Some(BatchStatus::Committed),
            "CANCELLED" | "CANCELED" => Some(BatchStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Scope and filter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    Direct,
    Franchise,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchScope {
    Direct {
        merchant_id: EntityId,
    },
    Franchise {
        franchise_id: EntityId,
        merchant_ids: BTreeSet<EntityId>,
    },
}

impl BatchScope {
    pub fn topology(&self) -> Topology {
        match self {
            BatchScope::Direct { .. } => Topology::Direct,
            BatchScope::Franchise { .. } => Topology::Franchise,
        }
    }

    /// Entities whose candidates belong to this batch.
    pub fn entities(&self) -> BTreeSet<EntityId> {
        match self {
            BatchScope::Direct { merchant_id } => BTreeSet::from([merchant_id.clone()]),
            BatchScope::Franchise { merchant_ids, .. } => merchant_ids.clone(),
        }
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        match self {
            BatchScope::Direct { merchant_id } => merchant_id == entity_id,
            BatchScope::Franchise { merchant_ids, .. } => merchant_ids.contains(entity_id),
        }
    }
}

/// The user-facing choices that define a batch. Changing any of them discards
/// the active batch with all of its caches and selections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFilter {
    pub topology: Topology,
    /// Merchant id for direct batches, franchise id for franchise batches.
    pub root_id: EntityId,
    pub cycle_key: CycleKey,
    pub product_id: i64,
}

// ---------------------------------------------------------------------------
// Settlement batch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementBatch {
    pub id: BatchId,
    pub scope: BatchScope,
    pub cycle_key: CycleKey,
    pub product_id: i64,
    pub status: BatchStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl SettlementBatch {
    /// Build a batch from a create response. The scope is the one that was
    /// requested; the server only contributes id, status and timestamps.
    pub(crate) fn from_response(
        body: &Value,
        scope: BatchScope,
        cycle_key: CycleKey,
        product_id: i64,
        created_by: &str,
    ) -> EngineResult<Self> {
        // Some deployments wrap the batch in `{ "data": {...} }`.
        let body = body.get("data").filter(|d| d.is_object()).unwrap_or(body);

        let id = value_str(body, &["id", "batchId", "batch_id"])
            .ok_or_else(|| EngineError::Decode("batch response has no id".into()))?;
        let status = value_str(body, &["status"])
            .and_then(|s| BatchStatus::parse_lenient(&s))
            .unwrap_or(BatchStatus::Open);
        let created_at = value_str(body, &["createdAt", "created_at"])
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let created_by = value_str(body, &["createdBy", "created_by"])
            .unwrap_or_else(|| created_by.to_string());
        let product_id = value_i64(body, &["productId", "product_id"]).unwrap_or(product_id);

        Ok(Self {
            id,
            scope,
            cycle_key,
            product_id,
            status,
            created_by,
            created_at,
        })
    }

    pub fn topology(&self) -> Topology {
        self.scope.topology()
    }

    pub fn filter(&self) -> BatchFilter {
        let root_id = match &self.scope {
            BatchScope::Direct { merchant_id } => merchant_id.clone(),
            BatchScope::Franchise { franchise_id, .. } => franchise_id.clone(),
        };
        BatchFilter {
            topology: self.topology(),
            root_id,
            cycle_key: self.cycle_key,
            product_id: self.product_id,
        }
    }

    pub fn transition(&mut self, next: BatchStatus) -> EngineResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transaction candidate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionCandidate {
    pub reference_id: ReferenceId,
    pub amount: Decimal,
    pub fee: Decimal,
    pub net_amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

impl TransactionCandidate {
    pub fn is_valid(&self) -> bool {
        self.error_reason.is_none()
    }

    pub(crate) fn from_value(v: &Value) -> EngineResult<Self> {
        let reference_id = value_str(
            v,
            &[
                "transactionReferenceId",
                "transaction_reference_id",
                "vendorTxId",
                "referenceId",
            ],
        )
        .ok_or_else(|| EngineError::Decode("candidate has no transactionReferenceId".into()))?;
        // Money fields come from the server as-is; none of them is derived here.
        let money = |keys: &[&str], label: &str| {
            value_decimal(v, keys).ok_or_else(|| {
                EngineError::Decode(format!(
                    "candidate {reference_id} has a missing or invalid {label}"
                ))
            })
        };
        let amount = money(&["amount"], "amount")?;
        let fee = money(&["fee"], "fee")?;
        let net_amount = money(&["netAmount", "net_amount"], "netAmount")?;
        let error_reason = value_str(v, &["error", "errorReason", "error_reason"]);

        Ok(Self {
            reference_id,
            amount,
            fee,
            net_amount,
            error_reason,
        })
    }

    /// Parse a candidate list response (bare array or `{ "data": [...] }`).
    /// Reference ids must be unique within one response.
    pub(crate) fn list_from_value(body: &Value) -> EngineResult<Vec<Self>> {
        let rows = match body {
            Value::Array(rows) => rows,
            Value::Null => return Ok(Vec::new()),
            other => other
                .get("data")
                .or_else(|| other.get("candidates"))
                .and_then(Value::as_array)
                .ok_or_else(|| EngineError::Decode("expected a candidate array".into()))?,
        };
        let mut seen = BTreeSet::new();
        rows.iter()
            .map(|row| {
                let candidate = Self::from_value(row)?;
                if !seen.insert(candidate.reference_id.clone()) {
                    return Err(EngineError::Decode(format!(
                        "duplicate candidate {}",
                        candidate.reference_id
                    )));
                }
                Ok(candidate)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Reference entities
// ---------------------------------------------------------------------------

/// A merchant, franchise or product as listed by the settlement API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceEntity {
    pub id: String,
    pub name: String,
    /// Remaining fields, passed through untouched.
    pub extra: serde_json::Map<String, Value>,
}

impl ReferenceEntity {
    pub(crate) fn list_from_value(body: &Value) -> EngineResult<Vec<Self>> {
        let rows = body
            .as_array()
            .or_else(|| body.get("data").and_then(Value::as_array))
            .ok_or_else(|| EngineError::Decode("expected an entity array".into()))?;

        rows.iter()
            .map(|row| {
                let id = value_str(row, &["id"])
                    .ok_or_else(|| EngineError::Decode("entity has no id".into()))?;
                let name = value_str(row, &["name", "displayName", "title"]).unwrap_or_default();
                let mut extra = row.as_object().cloned().unwrap_or_default();
                extra.remove("id");
                extra.remove("name");
                Ok(Self { id, name, extra })
            })
            .collect()
    }
}
