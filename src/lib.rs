//! Settlement engine
//!
//! Client-side core of the merchant settlement dashboard: batch lifecycle,
//! per-merchant candidate caching, selection bookkeeping and totals, and the
//! all-or-nothing commit against the settlement REST API.
//!
//! ```no_run
//! # async fn demo() -> settlement_engine::EngineResult<()> {
//! use settlement_engine::{CycleKey, EngineConfig, SettlementEngine};
//!
//! let engine = SettlementEngine::connect(EngineConfig::from_env()?)?;
//! let batch = engine.create_or_get_batch("m-1", CycleKey::T0, 7).await?;
//! engine.fetch_candidates(&batch, "m-1").await?;
//! engine.select_all("m-1")?;
//! let receipt = engine.commit_current().await?;
//! println!("settled {} transactions", receipt.totals.selected_count);
//! # Ok(())
//! # }
//! ```

mod api;
mod batch;
mod candidates;
mod commit;
mod config;
mod engine;
mod error;
mod guard;
mod logging;
mod models;
mod permissions;
mod selection;
mod tristate;

#[cfg(test)]
mod testing;

pub use api::{
    CandidateQuery, CreateBatchRequest, EntityKind, FranchiseBatchRequest, HttpSettlementApi,
    SettlementApi,
};
pub use batch::{CancelOutcome, MerchantPicker};
pub use candidates::CacheEntry;
pub use commit::CommitReceipt;
pub use config::{normalize_base_url, EngineConfig, LogConfig};
pub use engine::SettlementEngine;
pub use error::{EngineError, EngineResult};
pub use guard::{ConfirmationGate, UnsavedChangesGuard, UNSAVED_CHANGES_PROMPT};
pub use logging::{init_logging, prune_old_logs, LOG_FILE_PREFIX};
pub use models::{
    BatchFilter, BatchId, BatchScope, BatchStatus, CycleKey, EntityId, ReferenceEntity,
    ReferenceId, SettlementBatch, Topology, TransactionCandidate,
};
pub use permissions::{Permission, PermissionModule, PermissionTree};
pub use selection::{SelectionTotals, ToggleBuffer};
pub use tristate::{GroupState, TriStateGroup};
