//! Settlement API client.
//!
//! [`SettlementApi`] is the seam between the engine and the REST backend.
//! [`HttpSettlementApi`] talks to the real service with `reqwest`; tests plug
//! in a scripted implementation instead. The trait works at the JSON level
//! and leaves decoding to the engine so that field spelling quirks are handled
//! in one place.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::{BatchId, CycleKey, EntityId, ReferenceId};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Merchants,
    Franchises,
    Products,
}

impl EntityKind {
    pub fn route(&self) -> &'static str {
        match self {
            EntityKind::Merchants => "merchants",
            EntityKind::Franchises => "franchises",
            EntityKind::Products => "products",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBatchRequest {
    pub entity_id: EntityId,
    pub cycle_key: CycleKey,
    pub created_by: String,
    pub product_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FranchiseBatchRequest {
    pub franchise_id: EntityId,
    pub cycle_key: CycleKey,
    pub created_by: String,
    pub product_id: i64,
    pub merchant_ids: Vec<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateQuery {
    Direct {
        batch_id: BatchId,
    },
    Franchise {
        batch_id: BatchId,
        merchant_id: EntityId,
        cycle_key: CycleKey,
        product_id: i64,
    },
}

impl CandidateQuery {
    pub fn route(&self) -> String {
        match self {
            CandidateQuery::Direct { batch_id } => format!("batches/{batch_id}/candidates"),
            CandidateQuery::Franchise {
                batch_id,
                merchant_id,
                ..
            } => format!("batches/{batch_id}/merchants/{merchant_id}/candidates"),
        }
    }

    pub fn query_params(&self) -> Vec<(&'static str, String)> {
        match self {
            CandidateQuery::Direct { .. } => Vec::new(),
            CandidateQuery::Franchise {
                cycle_key,
                product_id,
                ..
            } => vec![
                ("cycleKey", cycle_key.to_string()),
                ("productId", product_id.to_string()),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// API seam
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SettlementApi: Send + Sync {
    async fn list_entities(&self, kind: EntityKind) -> EngineResult<Value>;

    /// Create-or-get: the backend returns the open batch for an identical
    /// `(entity, cycle, product)` when one already exists.
    async fn create_batch(&self, req: &CreateBatchRequest) -> EngineResult<Value>;

    async fn create_franchise_batch(&self, req: &FranchiseBatchRequest) -> EngineResult<Value>;

    async fn fetch_candidates(&self, query: &CandidateQuery) -> EngineResult<Value>;

    async fn commit_direct(
        &self,
        batch_id: &str,
        vendor_tx_ids: &[ReferenceId],
    ) -> EngineResult<Value>;

    async fn commit_franchise(
        &self,
        batch_id: &str,
        selection: &BTreeMap<EntityId, Vec<ReferenceId>>,
    ) -> EngineResult<Value>;

    async fn cancel_batch(&self, batch_id: &str) -> EngineResult<()>;
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn transport_error(url: &str, err: &reqwest::Error) -> EngineError {
    let msg = if err.is_connect() {
        format!("Cannot reach settlement API at {url}")
    } else if err.is_timeout() {
        format!("Request to {url} timed out")
    } else if err.is_builder() {
        format!("Invalid settlement API URL: {url}")
    } else {
        format!("Network error communicating with {url}: {err}")
    };
    EngineError::Transport(msg)
}

fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Not authorized for settlement operations".to_string(),
        404 => "Settlement endpoint not found".to_string(),
        409 => "Batch state conflict".to_string(),
        s if s >= 500 => format!("Settlement API server error (HTTP {s})"),
        s => format!("Unexpected response from settlement API (HTTP {s})"),
    }
}

/// Map a non-success response to an error, preferring the server's own
/// `error` / `message` field.
pub(crate) fn error_from_status(status: StatusCode, body_text: &str) -> EngineError {
    let server_message = serde_json::from_str::<Value>(body_text).ok().and_then(|json| {
        json.get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    });

    if status.is_server_error() {
        let detail = server_message
            .map(|m| format!("{}: {m}", status_message(status)))
            .unwrap_or_else(|| status_message(status));
        return EngineError::Transport(detail);
    }

    let message = server_message
        .or_else(|| {
            let trimmed = body_text.trim();
            (!trimmed.is_empty() && trimmed.len() <= 200).then(|| trimmed.to_string())
        })
        .unwrap_or_else(|| status_message(status));
    EngineError::ServerRejection {
        status: status.as_u16(),
        message,
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpSettlementApi {
    client: Client,
    config: EngineConfig,
}

impl HttpSettlementApi {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| EngineError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    async fn send(
        &self,
        method: Method,
        route: &str,
        query: &[(&'static str, String)],
        body: Option<Value>,
    ) -> EngineResult<Value> {
        let url = self.config.endpoint(route);
        let request_id = Uuid::new_v4().to_string();

        let mut req = self
            .client
            .request(method.clone(), &url)
            .header("X-Request-Id", &request_id)
            .header("Content-Type", "application/json");
        if let Some(key) = self.config.api_key.as_deref() {
            req = req.bearer_auth(key);
        }
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(b) = body {
            req = req.json(&b);
        }

        let start = Instant::now();
        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(&self.config.api_base_url, &e))?;
        let status = resp.status();
        // A body cut off mid-read is a transport failure, never an empty result.
        let body_text = resp
            .text()
            .await
            .map_err(|e| transport_error(&self.config.api_base_url, &e))?;
        debug!(
            %method,
            route,
            request_id = %request_id,
            status = status.as_u16(),
            latency_ms = start.elapsed().as_millis() as u64,
            "settlement API call"
        );

        if !status.is_success() {
            let err = error_from_status(status, &body_text);
            warn!(%method, route, request_id = %request_id, error = %err, "settlement API call failed");
            return Err(err);
        }

        // Empty 204 bodies become null.
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| EngineError::Decode(e.to_string()))
    }

    fn to_body<T: Serialize>(value: &T) -> EngineResult<Value> {
        serde_json::to_value(value).map_err(|e| EngineError::Decode(e.to_string()))
    }
}

#[async_trait]
impl SettlementApi for HttpSettlementApi {
    async fn list_entities(&self, kind: EntityKind) -> EngineResult<Value> {
        self.send(Method::GET, kind.route(), &[], None).await
    }

    async fn create_batch(&self, req: &CreateBatchRequest) -> EngineResult<Value> {
        let body = Self::to_body(req)?;
        self.send(Method::POST, "batches", &[], Some(body)).await
    }

    async fn create_franchise_batch(&self, req: &FranchiseBatchRequest) -> EngineResult<Value> {
        let body = Self::to_body(req)?;
        self.send(Method::POST, "batches/selective", &[], Some(body))
            .await
    }

    async fn fetch_candidates(&self, query: &CandidateQuery) -> EngineResult<Value> {
        self.send(Method::GET, &query.route(), &query.query_params(), None)
            .await
    }

    async fn commit_direct(
        &self,
        batch_id: &str,
        vendor_tx_ids: &[ReferenceId],
    ) -> EngineResult<Value> {
        let body = serde_json::json!({ "vendorTxIds": vendor_tx_ids });
        self.send(
            Method::POST,
            &format!("batches/{batch_id}/candidates"),
            &[],
            Some(body),
        )
        .await
    }

    async fn commit_franchise(
        &self,
        batch_id: &str,
        selection: &BTreeMap<EntityId, Vec<ReferenceId>>,
    ) -> EngineResult<Value> {
        let body = Self::to_body(selection)?;
        self.send(
            Method::POST,
            &format!("batches/{batch_id}/process-with-transactions"),
            &[],
            Some(body),
        )
        .await
    }

    async fn cancel_batch(&self, batch_id: &str) -> EngineResult<()> {
        self.send(Method::DELETE, &format!("batches/{batch_id}"), &[], None)
            .await
            .map(|_| ())
    }
}
