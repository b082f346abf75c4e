// Billing disbursement reconciliation
pub mod reconciler;
pub mod scheduler;

pub use reconciler::{
    BillingReport, BillingRunError, DisbursementReconciler, RecoveryReport, RunSummary,
};
pub use scheduler::{BillingScheduleConfig, BillingScheduler};
