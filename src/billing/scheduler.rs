use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{error, info};

use super::reconciler::DisbursementReconciler;

/// Billing schedule configuration
#[derive(Debug, Clone)]
pub struct BillingScheduleConfig {
    /// Minutes between runs. Each run must finish before the next tick; the
    /// interval must stay well above the worst-case run time.
    pub interval_minutes: u64,
}

impl BillingScheduleConfig {
    pub fn from_minutes(interval_minutes: u64) -> Self {
        // sub-minute intervals would let runs overlap
        Self {
            interval_minutes: interval_minutes.max(1),
        }
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }
}

/// Invokes the reconciler on a fixed interval. Timing lives entirely here;
/// the reconciler's entry points stay independently callable.
pub struct BillingScheduler {
    config: BillingScheduleConfig,
    reconciler: Arc<DisbursementReconciler>,
}

impl BillingScheduler {
    pub fn new(config: BillingScheduleConfig, reconciler: Arc<DisbursementReconciler>) -> Self {
        Self { config, reconciler }
    }

    /// Start the billing loop (runs in background). The first tick fires
    /// immediately, so a restart runs the recovery pass right away.
    pub fn start(&self) -> JoinHandle<()> {
        let config = self.config.clone();
        let reconciler = self.reconciler.clone();

        tokio::spawn(async move {
            let mut ticker = interval(config.period());

            loop {
                ticker.tick().await;

                info!("Starting billing run");

                match reconciler.run_once().await {
                    Ok(summary) => info!(
                        "Billing run complete: recovered={}, recovery_failed={}, still_pending={}, \
                         organizations_processed={}, items_billed={}, total_amount_cents={}",
                        summary.recovery.completed,
                        summary.recovery.failed,
                        summary.recovery.still_pending,
                        summary.billing.organizations_processed,
                        summary.billing.items_billed,
                        summary.billing.total_amount_cents,
                    ),
                    Err(e) => error!("Billing run failed: {:?}", e),
                }
            }
        })
    }
}
