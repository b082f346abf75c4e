use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use uuid::Uuid;

/// Disbursement lifecycle status
///
/// `Pending` is the only non-terminal state: a row left pending by a crash or
/// a gateway outage is picked up by the next recovery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "disbursement_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DisbursementStatus {
    Pending,
    Completed,
    Failed,
}

impl DisbursementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisbursementStatus::Pending => "pending",
            DisbursementStatus::Completed => "completed",
            DisbursementStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(DisbursementStatus::Pending),
            "completed" => Some(DisbursementStatus::Completed),
            "failed" => Some(DisbursementStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DisbursementStatus::Pending)
    }
}

impl fmt::Display for DisbursementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Billing entity. Immutable from the reconciler's point of view.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub account_slug: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Organization {
    /// Slug usable for billing; NULL and empty both mean "cannot be billed"
    pub fn billable_slug(&self) -> Option<&str> {
        self.account_slug.as_deref().filter(|slug| !slug.is_empty())
    }
}

/// An individually billable unit of work. Created upstream; the reconciler
/// only reads it and flips the billed flag.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillableItem {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub cost_cents: i64,
    pub billed: bool,
    pub created_at: DateTime<Utc>,
}

/// One attempted organization-to-fulfillment transfer. Audit trail; rows are
/// never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Disbursement {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub idempotency_key: String,
    pub amount_cents: i64,
    pub item_count: i64,
    pub status: DisbursementStatus,
    pub transfer_id: Option<String>,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_attempted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Disbursement {
    /// Transfer memo. Embeds the idempotency key so a duplicate submission
    /// resolves to the same logical transfer; must be byte-identical across
    /// retries of the same row.
    pub fn memo(&self) -> String {
        format!(
            "Fulfillment billing // {} items // {}",
            self.item_count, self.idempotency_key
        )
    }
}

/// Unbilled item joined with its owning organization (billing snapshot row)
#[derive(Debug, Clone, FromRow)]
pub struct UnbilledItem {
    pub item_id: Uuid,
    pub cost_cents: i64,
    pub organization_id: Uuid,
    pub organization_name: String,
    pub account_slug: Option<String>,
}

/// Parameters for opening a new disbursement
#[derive(Debug, Clone)]
pub struct NewDisbursement {
    pub organization_id: Uuid,
    pub idempotency_key: String,
    pub amount_cents: i64,
    pub item_count: i64,
}
