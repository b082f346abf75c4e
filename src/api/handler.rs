use axum::{
    extract::{Path, Query, State},
    Json,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::models::{DisbursementListQuery, HealthResponse, LocateResponse};
use crate::billing::{DisbursementReconciler, RunSummary};
use crate::error::{AppError, AppResult};
use crate::gateway::PaymentGateway;
use crate::ledger::models::{Disbursement, DisbursementStatus};
use crate::ledger::repository::LedgerRepository;
use crate::ledger::LedgerStore;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<LedgerRepository>,
    pub reconciler: Arc<DisbursementReconciler>,
    pub gateway: Arc<dyn PaymentGateway>,
    /// Hex SHA-256 digest of the admin API key
    pub admin_key_digest: String,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> AppResult<Json<HealthResponse>> {
    let database = sqlx::query("SELECT 1")
        .execute(&state.ledger.pool)
        .await
        .is_ok();

    Ok(Json(HealthResponse {
        status: if database { "ok" } else { "degraded" }.to_string(),
        database,
    }))
}

/// POST /api/v1/admin/billing/run
///
/// Manually trigger one full run (recovery pass, then new billing)
pub async fn run_billing(State(state): State<AppState>) -> AppResult<Json<RunSummary>> {
    info!("Manual billing run requested");
    let summary = state.reconciler.run_once().await?;
    Ok(Json(summary))
}

/// GET /api/v1/admin/disbursements
pub async fn list_disbursements(
    State(state): State<AppState>,
    Query(query): Query<DisbursementListQuery>,
) -> AppResult<Json<Vec<Disbursement>>> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(
            DisbursementStatus::parse(raw)
                .ok_or_else(|| AppError::BadRequest(format!("unknown status: {}", raw)))?,
        ),
    };

    Ok(Json(state.ledger.disbursements(status).await?))
}

/// GET /api/v1/admin/disbursements/:id
pub async fn get_disbursement(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Disbursement>> {
    state
        .ledger
        .disbursement(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("disbursement not found: {}", id)))
}

/// GET /api/v1/admin/disbursements/:id/locate
///
/// Manual reconciliation: look the transfer up on the gateway by memo and
/// amount. Useful when a row is stuck and someone needs to know whether the
/// money actually moved.
pub async fn locate_disbursement(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<LocateResponse>> {
    let disbursement = state
        .ledger
        .disbursement(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("disbursement not found: {}", id)))?;

    let organization = state
        .ledger
        .organization(disbursement.organization_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "organization not found: {}",
                disbursement.organization_id
            ))
        })?;

    let slug = organization.billable_slug().ok_or_else(|| {
        AppError::BadRequest(format!("{} has no billing account", organization.name))
    })?;

    let transfer = state
        .gateway
        .find_transfer_by_memo(slug, &disbursement.idempotency_key, disbursement.amount_cents)
        .await?;

    Ok(Json(LocateResponse {
        matched: transfer.is_some(),
        transfer,
    }))
}
