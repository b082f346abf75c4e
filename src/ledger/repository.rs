use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::models::{Disbursement, DisbursementStatus, NewDisbursement, Organization, UnbilledItem};
use super::LedgerStore;
use crate::error::{AppError, AppResult};

const DISBURSEMENT_COLUMNS: &str = "id, organization_id, idempotency_key, amount_cents, \
     item_count, status, transfer_id, error_detail, created_at, last_attempted_at, completed_at";

/// Ledger repository - THE source of truth for billing state
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for LedgerRepository {
    // ========== BILLING SNAPSHOT ==========

    async fn unbilled_items(&self) -> AppResult<Vec<UnbilledItem>> {
        let rows = sqlx::query_as::<_, UnbilledItem>(
            r#"
            SELECT
                i.id AS item_id,
                i.cost_cents,
                o.id AS organization_id,
                o.name AS organization_name,
                o.account_slug
            FROM billable_items i
            JOIN organizations o ON o.id = i.organization_id
            WHERE i.billed = FALSE
            ORDER BY o.id, i.created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn organization(&self, id: Uuid) -> AppResult<Option<Organization>> {
        let organization = sqlx::query_as::<_, Organization>(
            r#"
            SELECT id, name, account_slug, created_at
            FROM organizations
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(organization)
    }

    // ========== DISBURSEMENT OPERATIONS ==========

    async fn pending_disbursements(&self) -> AppResult<Vec<Disbursement>> {
        let rows = sqlx::query_as::<_, Disbursement>(&format!(
            "SELECT {} FROM disbursements WHERE status = 'pending' ORDER BY created_at",
            DISBURSEMENT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn open_disbursement(
        &self,
        new: NewDisbursement,
        item_ids: &[Uuid],
    ) -> AppResult<Disbursement> {
        let mut tx = self.pool.begin().await?;

        let disbursement = sqlx::query_as::<_, Disbursement>(&format!(
            r#"
            INSERT INTO disbursements (organization_id, idempotency_key, amount_cents, item_count)
            VALUES ($1, $2, $3, $4)
            RETURNING {}
            "#,
            DISBURSEMENT_COLUMNS
        ))
        .bind(new.organization_id)
        .bind(&new.idempotency_key)
        .bind(new.amount_cents)
        .bind(new.item_count)
        .fetch_one(&mut *tx)
        .await?;

        let flagged = sqlx::query(
            "UPDATE billable_items SET billed = TRUE WHERE id = ANY($1) AND billed = FALSE",
        )
        .bind(item_ids)
        .execute(&mut *tx)
        .await?;

        // The billed flag is the guard against reprocessing; a mismatch means
        // the snapshot raced with another writer and nothing may be charged.
        if flagged.rows_affected() != item_ids.len() as u64 {
            tx.rollback().await?;
            return Err(AppError::Internal(format!(
                "billing snapshot raced: expected to flag {} items, flagged {}",
                item_ids.len(),
                flagged.rows_affected()
            )));
        }

        tx.commit().await?;

        Ok(disbursement)
    }

    async fn record_attempt(&self, id: Uuid) -> AppResult<()> {
        sqlx::query("UPDATE disbursements SET last_attempted_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn complete_disbursement(&self, id: Uuid, transfer_id: &str) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE disbursements
            SET status = 'completed',
                transfer_id = $2,
                completed_at = NOW(),
                last_attempted_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(transfer_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::Internal(format!(
                "disbursement {} is not pending",
                id
            )));
        }

        Ok(())
    }

    async fn fail_disbursement(&self, id: Uuid, detail: &str) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE disbursements
            SET status = 'failed',
                error_detail = $2,
                last_attempted_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(detail)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::Internal(format!(
                "disbursement {} is not pending",
                id
            )));
        }

        Ok(())
    }

    async fn disbursements(
        &self,
        status: Option<DisbursementStatus>,
    ) -> AppResult<Vec<Disbursement>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, Disbursement>(&format!(
                    "SELECT {} FROM disbursements WHERE status = $1 ORDER BY created_at DESC",
                    DISBURSEMENT_COLUMNS
                ))
                .bind(status)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Disbursement>(&format!(
                    "SELECT {} FROM disbursements ORDER BY created_at DESC",
                    DISBURSEMENT_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows)
    }

    async fn disbursement(&self, id: Uuid) -> AppResult<Option<Disbursement>> {
        let row = sqlx::query_as::<_, Disbursement>(&format!(
            "SELECT {} FROM disbursements WHERE id = $1",
            DISBURSEMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}
