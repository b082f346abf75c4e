pub mod models;
pub mod repository;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::AppResult;
use models::{Disbursement, DisbursementStatus, NewDisbursement, Organization, UnbilledItem};

/// Durable storage seam the reconciler depends on. `LedgerRepository` is the
/// Postgres implementation; tests substitute an in-memory one.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Snapshot of all unbilled items joined with their organization
    async fn unbilled_items(&self) -> AppResult<Vec<UnbilledItem>>;

    async fn organization(&self, id: Uuid) -> AppResult<Option<Organization>>;

    /// All pending disbursements, oldest first
    async fn pending_disbursements(&self) -> AppResult<Vec<Disbursement>>;

    /// Insert a pending disbursement and flag the captured items billed in
    /// one transaction. Nothing is charged or flagged if this errors.
    async fn open_disbursement(
        &self,
        new: NewDisbursement,
        item_ids: &[Uuid],
    ) -> AppResult<Disbursement>;

    async fn record_attempt(&self, id: Uuid) -> AppResult<()>;

    /// pending -> completed; refuses rows that are not pending
    async fn complete_disbursement(&self, id: Uuid, transfer_id: &str) -> AppResult<()>;

    /// pending -> failed; refuses rows that are not pending
    async fn fail_disbursement(&self, id: Uuid, detail: &str) -> AppResult<()>;

    async fn disbursements(
        &self,
        status: Option<DisbursementStatus>,
    ) -> AppResult<Vec<Disbursement>>;

    async fn disbursement(&self, id: Uuid) -> AppResult<Option<Disbursement>>;
}
