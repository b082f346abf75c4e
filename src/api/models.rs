use serde::{Deserialize, Serialize};

use crate::gateway::TransferRecord;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: bool,
}

#[derive(Debug, Deserialize)]
pub struct DisbursementListQuery {
    pub status: Option<String>,
}

/// Manual-reconciliation lookup result
#[derive(Debug, Serialize)]
pub struct LocateResponse {
    pub matched: bool,
    pub transfer: Option<TransferRecord>,
}
