// Disbursement reconciler - turns unbilled work items into gateway transfers
//
// Run shape (one scheduled run):
// 1. Recovery pass: re-attempt disbursements left pending by a prior run
// 2. New-work pass: snapshot unbilled items, group by organization, open one
//    disbursement per group, then call the gateway
//
// The pending row and the billed flags are committed in one transaction
// BEFORE any gateway traffic. A crash between commit and call leaves a
// pending row for the next recovery pass; the items are never re-grouped and
// the stored idempotency key is reused verbatim, so the gateway resolves the
// retry to the same transfer.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::AppResult;
use crate::gateway::{PaymentGateway, TransferOutcome};
use crate::ledger::models::{Disbursement, NewDisbursement, UnbilledItem};
use crate::ledger::LedgerStore;
use crate::notify::{CompletedNotice, FailedNotice, NotificationSink};

/// Per-organization failure recorded in a run report
#[derive(Debug, Clone, Serialize)]
pub struct BillingRunError {
    pub organization: String,
    pub error: String,
    pub retryable: bool,
}

/// Result of the recovery pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub checked: usize,
    pub completed: usize,
    pub failed: usize,
    pub still_pending: usize,
    pub errors: Vec<BillingRunError>,
}

/// Result of the new-work pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct BillingReport {
    pub organizations_processed: usize,
    pub items_billed: usize,
    pub total_amount_cents: i64,
    pub errors: Vec<BillingRunError>,
}

/// Combined result of one run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub recovery: RecoveryReport,
    pub billing: BillingReport,
}

/// One organization's share of the unbilled snapshot
struct OrganizationGroup {
    name: String,
    account_slug: Option<String>,
    item_ids: Vec<Uuid>,
    total_cents: i64,
}

impl OrganizationGroup {
    fn billable_slug(&self) -> Option<&str> {
        self.account_slug.as_deref().filter(|slug| !slug.is_empty())
    }
}

/// Groups the snapshot by owning organization. BTreeMap keeps processing
/// order ascending by organization id.
fn group_by_organization(snapshot: &[UnbilledItem]) -> BTreeMap<Uuid, OrganizationGroup> {
    let mut groups: BTreeMap<Uuid, OrganizationGroup> = BTreeMap::new();
    for item in snapshot {
        let group = groups
            .entry(item.organization_id)
            .or_insert_with(|| OrganizationGroup {
                name: item.organization_name.clone(),
                account_slug: item.account_slug.clone(),
                item_ids: Vec::new(),
                total_cents: 0,
            });
        group.item_ids.push(item.item_id);
        group.total_cents += item.cost_cents;
    }
    groups
}

enum Recovered {
    Completed,
    Failed,
    StillPending,
}

enum GroupOutcome {
    Completed { items: usize, amount_cents: i64 },
    Failed { error: String },
    Deferred { error: String },
}

pub struct DisbursementReconciler {
    ledger: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn NotificationSink>,
}

impl DisbursementReconciler {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            ledger,
            gateway,
            notifier,
        }
    }

    /// Recovery pass, then new billing, strictly in that order
    pub async fn run_once(&self) -> AppResult<RunSummary> {
        let recovery = self.reconcile_pending().await?;
        let billing = self.process_new_billables().await?;
        Ok(RunSummary { recovery, billing })
    }

    // ========== RECOVERY PASS ==========

    /// Re-attempts every disbursement left pending by an interrupted or
    /// failed run. Only a store failure loading the pending set aborts the
    /// pass; per-row errors are recorded and the loop continues.
    pub async fn reconcile_pending(&self) -> AppResult<RecoveryReport> {
        let pending = self.ledger.pending_disbursements().await?;

        let mut report = RecoveryReport {
            checked: pending.len(),
            ..RecoveryReport::default()
        };
        if pending.is_empty() {
            return Ok(report);
        }

        info!("Recovering {} pending disbursements", pending.len());

        for disbursement in pending {
            match self.recover_one(&disbursement).await {
                Ok(Recovered::Completed) => report.completed += 1,
                Ok(Recovered::Failed) => report.failed += 1,
                Ok(Recovered::StillPending) => report.still_pending += 1,
                Err(e) => {
                    error!(
                        "Unexpected error recovering disbursement {}: {}",
                        disbursement.id, e
                    );
                    report.errors.push(BillingRunError {
                        organization: disbursement.organization_id.to_string(),
                        error: e.to_string(),
                        retryable: true,
                    });
                    report.still_pending += 1;
                }
            }
        }

        info!(
            "Recovery complete: checked={}, completed={}, failed={}, still_pending={}",
            report.checked, report.completed, report.failed, report.still_pending
        );
        Ok(report)
    }

    async fn recover_one(&self, disbursement: &Disbursement) -> AppResult<Recovered> {
        let organization = match self.ledger.organization(disbursement.organization_id).await? {
            Some(organization) => organization,
            None => {
                warn!(
                    "Disbursement {} references missing organization {}",
                    disbursement.id, disbursement.organization_id
                );
                self.ledger
                    .fail_disbursement(disbursement.id, "owning organization no longer exists")
                    .await?;
                return Ok(Recovered::Failed);
            }
        };

        let Some(slug) = organization.billable_slug() else {
            // the slug was cleared after the row was opened; nothing to
            // retry against
            let detail = "organization has no billing account";
            self.ledger
                .fail_disbursement(disbursement.id, detail)
                .await?;
            self.notify_failed(&organization.name, disbursement, detail)
                .await;
            return Ok(Recovered::Failed);
        };

        self.ledger.record_attempt(disbursement.id).await?;

        // same amount, same key, same memo as the first attempt
        let outcome = self
            .gateway
            .create_transfer(slug, disbursement.amount_cents, &disbursement.memo())
            .await;

        match outcome {
            TransferOutcome::Created { transfer_id } => {
                self.ledger
                    .complete_disbursement(disbursement.id, &transfer_id)
                    .await?;
                info!(
                    "Recovered disbursement {} for {}: transfer {}",
                    disbursement.id, organization.name, transfer_id
                );
                self.notify_completed(&organization.name, disbursement, &transfer_id)
                    .await;
                Ok(Recovered::Completed)
            }
            TransferOutcome::Rejected { status, detail } => {
                self.ledger
                    .fail_disbursement(disbursement.id, &detail)
                    .await?;
                warn!(
                    "Disbursement {} permanently rejected (status {}): {}",
                    disbursement.id, status, detail
                );
                self.notify_failed(&organization.name, disbursement, &detail)
                    .await;
                Ok(Recovered::Failed)
            }
            TransferOutcome::Unavailable { detail } => {
                // stays pending and is retried next run; routine transient
                // errors are not worth a notification
                info!(
                    "Disbursement {} still pending, gateway unavailable: {}",
                    disbursement.id, detail
                );
                Ok(Recovered::StillPending)
            }
        }
    }

    // ========== NEW BILLING PASS ==========

    /// Snapshots unbilled items, groups them by organization and opens one
    /// disbursement per group. Items appearing after the snapshot are picked
    /// up next pass.
    pub async fn process_new_billables(&self) -> AppResult<BillingReport> {
        let snapshot = self.ledger.unbilled_items().await?;

        let mut report = BillingReport::default();
        if snapshot.is_empty() {
            return Ok(report);
        }

        let groups = group_by_organization(&snapshot);
        info!("Found {} organizations with unbilled items", groups.len());

        for (organization_id, group) in groups {
            let Some(slug) = group.billable_slug() else {
                warn!("Skipping {}: no billing account configured", group.name);
                report.errors.push(BillingRunError {
                    organization: group.name.clone(),
                    error: "no billing account configured".to_string(),
                    retryable: false,
                });
                continue;
            };

            match self.bill_group(organization_id, &group, slug).await {
                Ok(GroupOutcome::Completed {
                    items,
                    amount_cents,
                }) => {
                    report.organizations_processed += 1;
                    report.items_billed += items;
                    report.total_amount_cents += amount_cents;
                }
                Ok(GroupOutcome::Failed { error }) => {
                    report.errors.push(BillingRunError {
                        organization: group.name.clone(),
                        error,
                        retryable: false,
                    });
                }
                Ok(GroupOutcome::Deferred { error }) => {
                    report.errors.push(BillingRunError {
                        organization: group.name.clone(),
                        error,
                        retryable: true,
                    });
                }
                Err(e) => {
                    error!("Unexpected error billing {}: {}", group.name, e);
                    report.errors.push(BillingRunError {
                        organization: group.name.clone(),
                        error: e.to_string(),
                        retryable: true,
                    });
                }
            }
        }

        info!(
            "Billing complete: organizations_processed={}, items_billed={}, total_amount_cents={}",
            report.organizations_processed, report.items_billed, report.total_amount_cents
        );
        Ok(report)
    }

    async fn bill_group(
        &self,
        organization_id: Uuid,
        group: &OrganizationGroup,
        slug: &str,
    ) -> AppResult<GroupOutcome> {
        let new = NewDisbursement {
            organization_id,
            // generated exactly once per row; retries reuse the stored key
            idempotency_key: Uuid::new_v4().to_string(),
            amount_cents: group.total_cents,
            item_count: group.item_ids.len() as i64,
        };

        info!(
            "Opening disbursement for {}: {} items, {} cents",
            group.name,
            group.item_ids.len(),
            group.total_cents
        );

        // Durable commit of the row and the billed flags happens before any
        // gateway traffic.
        let disbursement = self.ledger.open_disbursement(new, &group.item_ids).await?;

        let outcome = self
            .gateway
            .create_transfer(slug, disbursement.amount_cents, &disbursement.memo())
            .await;

        match outcome {
            TransferOutcome::Created { transfer_id } => {
                self.ledger
                    .complete_disbursement(disbursement.id, &transfer_id)
                    .await?;
                info!(
                    "Disbursement {} completed for {}: transfer {}",
                    disbursement.id, group.name, transfer_id
                );
                self.notify_completed(&group.name, &disbursement, &transfer_id)
                    .await;
                Ok(GroupOutcome::Completed {
                    items: group.item_ids.len(),
                    amount_cents: disbursement.amount_cents,
                })
            }
            TransferOutcome::Rejected { status, detail } => {
                // An identical retry cannot succeed; close the row out and
                // hand the idempotency key to a human. Items stay billed.
                self.ledger
                    .fail_disbursement(disbursement.id, &detail)
                    .await?;
                warn!(
                    "Disbursement {} for {} permanently rejected (status {}): {}",
                    disbursement.id, group.name, status, detail
                );
                self.notify_failed(&group.name, &disbursement, &detail).await;
                Ok(GroupOutcome::Failed { error: detail })
            }
            TransferOutcome::Unavailable { detail } => {
                // row stays pending; the next recovery pass retries with the
                // same key
                info!(
                    "Disbursement {} for {} deferred, gateway unavailable: {}",
                    disbursement.id, group.name, detail
                );
                Ok(GroupOutcome::Deferred { error: detail })
            }
        }
    }

    // ========== NOTIFICATIONS ==========

    async fn notify_completed(
        &self,
        organization: &str,
        disbursement: &Disbursement,
        transfer_id: &str,
    ) {
        let notice = CompletedNotice {
            organization: organization.to_string(),
            item_count: disbursement.item_count,
            amount_cents: disbursement.amount_cents,
            transfer_id: transfer_id.to_string(),
            idempotency_key: disbursement.idempotency_key.clone(),
        };
        if let Err(e) = self.notifier.disbursement_completed(&notice).await {
            // notification failure never touches committed billing state
            warn!(
                "Failed to send completion notice for {}: {}",
                organization, e
            );
        }
    }

    async fn notify_failed(&self, organization: &str, disbursement: &Disbursement, error: &str) {
        let notice = FailedNotice {
            organization: organization.to_string(),
            item_count: disbursement.item_count,
            amount_cents: disbursement.amount_cents,
            error: error.to_string(),
            idempotency_key: disbursement.idempotency_key.clone(),
        };
        if let Err(e) = self.notifier.disbursement_failed(&notice).await {
            warn!("Failed to send failure notice for {}: {}", organization, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::gateway::TransferRecord;
    use crate::ledger::models::{BillableItem, DisbursementStatus, Organization};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryLedger {
        organizations: Mutex<Vec<Organization>>,
        items: Mutex<Vec<BillableItem>>,
        disbursements: Mutex<Vec<Disbursement>>,
        fail_open: AtomicBool,
    }

    impl MemoryLedger {
        fn add_organization(&self, id: u128, name: &str, slug: Option<&str>) -> Uuid {
            let id = Uuid::from_u128(id);
            self.organizations.lock().unwrap().push(Organization {
                id,
                name: name.to_string(),
                account_slug: slug.map(str::to_string),
                created_at: Utc::now(),
            });
            id
        }

        fn add_item(&self, organization_id: Uuid, cost_cents: i64) -> Uuid {
            let id = Uuid::new_v4();
            self.items.lock().unwrap().push(BillableItem {
                id,
                organization_id,
                cost_cents,
                billed: false,
                created_at: Utc::now(),
            });
            id
        }

        /// Simulates a crash after the open-disbursement commit: pending row
        /// present, items already billed
        fn seed_pending(
            &self,
            organization_id: Uuid,
            key: &str,
            amount_cents: i64,
            item_count: i64,
        ) -> Uuid {
            let now = Utc::now();
            let id = Uuid::new_v4();
            self.disbursements.lock().unwrap().push(Disbursement {
                id,
                organization_id,
                idempotency_key: key.to_string(),
                amount_cents,
                item_count,
                status: DisbursementStatus::Pending,
                transfer_id: None,
                error_detail: None,
                created_at: now,
                last_attempted_at: now,
                completed_at: None,
            });
            id
        }

        fn all_disbursements(&self) -> Vec<Disbursement> {
            self.disbursements.lock().unwrap().clone()
        }

        fn unbilled_count(&self) -> usize {
            self.items.lock().unwrap().iter().filter(|i| !i.billed).count()
        }
    }

    #[async_trait]
    impl LedgerStore for MemoryLedger {
        async fn unbilled_items(&self) -> AppResult<Vec<UnbilledItem>> {
            let organizations = self.organizations.lock().unwrap();
            let items = self.items.lock().unwrap();
            let mut rows = Vec::new();
            for item in items.iter().filter(|item| !item.billed) {
                if let Some(org) = organizations.iter().find(|o| o.id == item.organization_id) {
                    rows.push(UnbilledItem {
                        item_id: item.id,
                        cost_cents: item.cost_cents,
                        organization_id: org.id,
                        organization_name: org.name.clone(),
                        account_slug: org.account_slug.clone(),
                    });
                }
            }
            Ok(rows)
        }

        async fn organization(&self, id: Uuid) -> AppResult<Option<Organization>> {
            Ok(self
                .organizations
                .lock()
                .unwrap()
                .iter()
                .find(|o| o.id == id)
                .cloned())
        }

        async fn pending_disbursements(&self) -> AppResult<Vec<Disbursement>> {
            Ok(self
                .disbursements
                .lock()
                .unwrap()
                .iter()
                .filter(|d| d.status == DisbursementStatus::Pending)
                .cloned()
                .collect())
        }

        async fn open_disbursement(
            &self,
            new: NewDisbursement,
            item_ids: &[Uuid],
        ) -> AppResult<Disbursement> {
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(AppError::Internal("simulated commit failure".to_string()));
            }
            let now = Utc::now();
            let disbursement = Disbursement {
                id: Uuid::new_v4(),
                organization_id: new.organization_id,
                idempotency_key: new.idempotency_key,
                amount_cents: new.amount_cents,
                item_count: new.item_count,
                status: DisbursementStatus::Pending,
                transfer_id: None,
                error_detail: None,
                created_at: now,
                last_attempted_at: now,
                completed_at: None,
            };
            for item in self.items.lock().unwrap().iter_mut() {
                if item_ids.contains(&item.id) {
                    item.billed = true;
                }
            }
            self.disbursements.lock().unwrap().push(disbursement.clone());
            Ok(disbursement)
        }

        async fn record_attempt(&self, id: Uuid) -> AppResult<()> {
            if let Some(d) = self
                .disbursements
                .lock()
                .unwrap()
                .iter_mut()
                .find(|d| d.id == id)
            {
                d.last_attempted_at = Utc::now();
            }
            Ok(())
        }

        async fn complete_disbursement(&self, id: Uuid, transfer_id: &str) -> AppResult<()> {
            let mut disbursements = self.disbursements.lock().unwrap();
            let row = disbursements
                .iter_mut()
                .find(|d| d.id == id && d.status == DisbursementStatus::Pending)
                .ok_or_else(|| AppError::Internal(format!("disbursement {} is not pending", id)))?;
            row.status = DisbursementStatus::Completed;
            row.transfer_id = Some(transfer_id.to_string());
            row.completed_at = Some(Utc::now());
            Ok(())
        }

        async fn fail_disbursement(&self, id: Uuid, detail: &str) -> AppResult<()> {
            let mut disbursements = self.disbursements.lock().unwrap();
            let row = disbursements
                .iter_mut()
                .find(|d| d.id == id && d.status == DisbursementStatus::Pending)
                .ok_or_else(|| AppError::Internal(format!("disbursement {} is not pending", id)))?;
            row.status = DisbursementStatus::Failed;
            row.error_detail = Some(detail.to_string());
            Ok(())
        }

        async fn disbursements(
            &self,
            status: Option<DisbursementStatus>,
        ) -> AppResult<Vec<Disbursement>> {
            Ok(self
                .disbursements
                .lock()
                .unwrap()
                .iter()
                .filter(|d| status.map_or(true, |s| d.status == s))
                .cloned()
                .collect())
        }

        async fn disbursement(&self, id: Uuid) -> AppResult<Option<Disbursement>> {
            Ok(self
                .disbursements
                .lock()
                .unwrap()
                .iter()
                .find(|d| d.id == id)
                .cloned())
        }
    }

    #[derive(Default)]
    struct ScriptedGateway {
        outcomes: Mutex<VecDeque<TransferOutcome>>,
        calls: Mutex<Vec<(String, i64, String)>>,
    }

    impl ScriptedGateway {
        fn push(&self, outcome: TransferOutcome) {
            self.outcomes.lock().unwrap().push_back(outcome);
        }

        fn calls(&self) -> Vec<(String, i64, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PaymentGateway for ScriptedGateway {
        async fn create_transfer(
            &self,
            source_slug: &str,
            amount_cents: i64,
            memo: &str,
        ) -> TransferOutcome {
            let call_number = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((source_slug.to_string(), amount_cents, memo.to_string()));
                calls.len()
            };
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(TransferOutcome::Created {
                    transfer_id: format!("tx_{}", call_number),
                })
        }

        async fn list_transfers(&self, _account_slug: &str) -> AppResult<Vec<TransferRecord>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        completed: Mutex<Vec<CompletedNotice>>,
        failed: Mutex<Vec<FailedNotice>>,
        fail_sends: AtomicBool,
    }

    #[async_trait]
    impl NotificationSink for RecordingNotifier {
        async fn disbursement_completed(&self, notice: &CompletedNotice) -> AppResult<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(AppError::ExternalError("webhook down".to_string()));
            }
            self.completed.lock().unwrap().push(notice.clone());
            Ok(())
        }

        async fn disbursement_failed(&self, notice: &FailedNotice) -> AppResult<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(AppError::ExternalError("webhook down".to_string()));
            }
            self.failed.lock().unwrap().push(notice.clone());
            Ok(())
        }
    }

    struct Harness {
        ledger: Arc<MemoryLedger>,
        gateway: Arc<ScriptedGateway>,
        notifier: Arc<RecordingNotifier>,
        reconciler: DisbursementReconciler,
    }

    fn harness() -> Harness {
        let ledger = Arc::new(MemoryLedger::default());
        let gateway = Arc::new(ScriptedGateway::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let reconciler =
            DisbursementReconciler::new(ledger.clone(), gateway.clone(), notifier.clone());
        Harness {
            ledger,
            gateway,
            notifier,
            reconciler,
        }
    }

    #[tokio::test]
    async fn bills_one_organization_end_to_end() {
        let h = harness();
        let acme = h.ledger.add_organization(1, "Acme", Some("acme"));
        h.ledger.add_item(acme, 500);
        h.ledger.add_item(acme, 700);
        h.ledger.add_item(acme, 300);
        h.gateway.push(TransferOutcome::Created {
            transfer_id: "tx_1".to_string(),
        });

        let report = h.reconciler.process_new_billables().await.unwrap();

        assert_eq!(report.organizations_processed, 1);
        assert_eq!(report.items_billed, 3);
        assert_eq!(report.total_amount_cents, 1500);
        assert!(report.errors.is_empty());

        let calls = h.gateway.calls();
        assert_eq!(calls.len(), 1);
        let (slug, amount, memo) = &calls[0];
        assert_eq!(slug, "acme");
        assert_eq!(*amount, 1500);

        let rows = h.ledger.all_disbursements();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, DisbursementStatus::Completed);
        assert_eq!(rows[0].transfer_id.as_deref(), Some("tx_1"));
        assert_eq!(rows[0].item_count, 3);
        assert!(rows[0].completed_at.is_some());
        assert!(memo.contains(&rows[0].idempotency_key));

        assert_eq!(h.ledger.unbilled_count(), 0);
        assert_eq!(h.notifier.completed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn skips_organizations_without_account_slug() {
        let h = harness();
        let no_slug = h.ledger.add_organization(1, "No Slug", None);
        let empty_slug = h.ledger.add_organization(2, "Empty Slug", Some(""));
        h.ledger.add_item(no_slug, 100);
        h.ledger.add_item(empty_slug, 200);

        let report = h.reconciler.process_new_billables().await.unwrap();

        assert_eq!(report.organizations_processed, 0);
        assert_eq!(report.items_billed, 0);
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors.iter().all(|e| !e.retryable));

        assert!(h.gateway.calls().is_empty());
        assert!(h.ledger.all_disbursements().is_empty());
        assert_eq!(h.ledger.unbilled_count(), 2);
    }

    #[tokio::test]
    async fn commit_failure_prevents_any_gateway_call() {
        let h = harness();
        let acme = h.ledger.add_organization(1, "Acme", Some("acme"));
        h.ledger.add_item(acme, 500);
        h.ledger.fail_open.store(true, Ordering::SeqCst);

        let report = h.reconciler.process_new_billables().await.unwrap();

        assert_eq!(report.organizations_processed, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].retryable);

        // no charge was attempted and nothing was flagged; the items will be
        // re-grouped next pass
        assert!(h.gateway.calls().is_empty());
        assert!(h.ledger.all_disbursements().is_empty());
        assert_eq!(h.ledger.unbilled_count(), 1);
    }

    #[tokio::test]
    async fn recovers_disbursement_left_pending_after_crash() {
        let h = harness();
        let acme = h.ledger.add_organization(1, "Acme", Some("acme"));
        // crash happened after commit: items billed, row pending, no transfer
        let item = h.ledger.add_item(acme, 1500);
        h.ledger
            .items
            .lock()
            .unwrap()
            .iter_mut()
            .find(|i| i.id == item)
            .unwrap()
            .billed = true;
        h.ledger.seed_pending(acme, "key-1", 1500, 3);
        h.gateway.push(TransferOutcome::Created {
            transfer_id: "tx_9".to_string(),
        });

        let report = h.reconciler.reconcile_pending().await.unwrap();

        assert_eq!(report.checked, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.still_pending, 0);

        let calls = h.gateway.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].2.contains("key-1"));
        assert_eq!(calls[0].1, 1500);

        let rows = h.ledger.all_disbursements();
        assert_eq!(rows[0].status, DisbursementStatus::Completed);
        assert_eq!(rows[0].transfer_id.as_deref(), Some("tx_9"));

        // items were already flagged; a follow-up billing pass finds nothing
        let billing = h.reconciler.process_new_billables().await.unwrap();
        assert_eq!(billing.organizations_processed, 0);
        assert_eq!(billing.items_billed, 0);
        assert_eq!(h.gateway.calls().len(), 1);
    }

    #[tokio::test]
    async fn retry_reuses_the_stored_idempotency_key() {
        let h = harness();
        let acme = h.ledger.add_organization(1, "Acme", Some("acme"));
        h.ledger.add_item(acme, 500);
        h.gateway.push(TransferOutcome::Unavailable {
            detail: "timeout".to_string(),
        });

        let report = h.reconciler.process_new_billables().await.unwrap();
        assert_eq!(report.organizations_processed, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].retryable);

        let rows = h.ledger.all_disbursements();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, DisbursementStatus::Pending);

        // next run recovers with the same key and memo
        h.gateway.push(TransferOutcome::Created {
            transfer_id: "tx_2".to_string(),
        });
        let recovery = h.reconciler.reconcile_pending().await.unwrap();
        assert_eq!(recovery.completed, 1);

        let calls = h.gateway.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].2, calls[1].2);

        // at most once: exactly one non-failed disbursement covers the items
        let rows = h.ledger.all_disbursements();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, DisbursementStatus::Completed);
    }

    #[tokio::test]
    async fn permanent_rejection_during_recovery_marks_failed() {
        let h = harness();
        let acme = h.ledger.add_organization(1, "Acme", Some("acme"));
        h.ledger.seed_pending(acme, "key-1", 900, 2);
        h.gateway.push(TransferOutcome::Rejected {
            status: 404,
            detail: "unknown account".to_string(),
        });

        let report = h.reconciler.reconcile_pending().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.completed, 0);
        let rows = h.ledger.all_disbursements();
        assert_eq!(rows[0].status, DisbursementStatus::Failed);
        assert_eq!(rows[0].error_detail.as_deref(), Some("unknown account"));
        assert_eq!(h.notifier.failed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transient_error_during_recovery_leaves_pending() {
        let h = harness();
        let acme = h.ledger.add_organization(1, "Acme", Some("acme"));
        h.ledger.seed_pending(acme, "key-1", 900, 2);
        h.gateway.push(TransferOutcome::Unavailable {
            detail: "status 500".to_string(),
        });

        let report = h.reconciler.reconcile_pending().await.unwrap();

        assert_eq!(report.still_pending, 1);
        assert_eq!(report.failed, 0);
        let rows = h.ledger.all_disbursements();
        assert_eq!(rows[0].status, DisbursementStatus::Pending);
        // no notification for routine transient errors
        assert!(h.notifier.failed.lock().unwrap().is_empty());
        assert!(h.notifier.completed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn permanent_rejection_during_billing_fails_and_notifies() {
        let h = harness();
        let acme = h.ledger.add_organization(1, "Acme", Some("acme"));
        h.ledger.add_item(acme, 500);
        h.gateway.push(TransferOutcome::Rejected {
            status: 403,
            detail: "not authorized".to_string(),
        });

        let report = h.reconciler.process_new_billables().await.unwrap();

        assert_eq!(report.organizations_processed, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(!report.errors[0].retryable);

        let rows = h.ledger.all_disbursements();
        assert_eq!(rows[0].status, DisbursementStatus::Failed);
        // items stay billed; resolution is manual, with the key in hand
        assert_eq!(h.ledger.unbilled_count(), 0);
        let failed = h.notifier.failed.lock().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].idempotency_key, rows[0].idempotency_key);
    }

    #[tokio::test]
    async fn one_bad_organization_does_not_block_the_rest() {
        let h = harness();
        let first = h.ledger.add_organization(1, "First", Some("first"));
        let second = h.ledger.add_organization(2, "Second", Some("second"));
        let third = h.ledger.add_organization(3, "Third", Some("third"));
        h.ledger.add_item(first, 100);
        h.ledger.add_item(second, 200);
        h.ledger.add_item(third, 300);
        h.gateway.push(TransferOutcome::Created {
            transfer_id: "tx_1".to_string(),
        });
        h.gateway.push(TransferOutcome::Rejected {
            status: 404,
            detail: "unknown account".to_string(),
        });
        h.gateway.push(TransferOutcome::Created {
            transfer_id: "tx_3".to_string(),
        });

        let report = h.reconciler.process_new_billables().await.unwrap();

        assert_eq!(report.organizations_processed, 2);
        assert_eq!(report.items_billed, 2);
        assert_eq!(report.total_amount_cents, 400);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].organization, "Second");

        // deterministic ascending organization order
        let calls = h.gateway.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].0, "first");
        assert_eq!(calls[1].0, "second");
        assert_eq!(calls[2].0, "third");
    }

    #[tokio::test]
    async fn missing_organization_fails_the_pending_row() {
        let h = harness();
        let ghost = Uuid::from_u128(42);
        h.ledger.seed_pending(ghost, "key-1", 500, 1);

        let report = h.reconciler.reconcile_pending().await.unwrap();

        assert_eq!(report.failed, 1);
        assert!(h.gateway.calls().is_empty());
        let rows = h.ledger.all_disbursements();
        assert_eq!(rows[0].status, DisbursementStatus::Failed);
        assert!(rows[0]
            .error_detail
            .as_deref()
            .unwrap()
            .contains("organization"));
    }

    #[tokio::test]
    async fn notification_failure_does_not_affect_billing_state() {
        let h = harness();
        let acme = h.ledger.add_organization(1, "Acme", Some("acme"));
        h.ledger.add_item(acme, 500);
        h.notifier.fail_sends.store(true, Ordering::SeqCst);

        let report = h.reconciler.process_new_billables().await.unwrap();

        assert_eq!(report.organizations_processed, 1);
        let rows = h.ledger.all_disbursements();
        assert_eq!(rows[0].status, DisbursementStatus::Completed);
    }

    #[tokio::test]
    async fn run_once_recovers_before_billing() {
        let h = harness();
        let acme = h.ledger.add_organization(1, "Acme", Some("acme"));
        h.ledger.seed_pending(acme, "key-old", 900, 2);
        h.ledger.add_item(acme, 500);

        let summary = h.reconciler.run_once().await.unwrap();

        assert_eq!(summary.recovery.completed, 1);
        assert_eq!(summary.billing.organizations_processed, 1);

        // recovery call first, then the new disbursement
        let calls = h.gateway.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].2.contains("key-old"));
        assert_eq!(calls[1].1, 500);
    }

    #[test]
    fn groups_snapshot_by_organization_in_ascending_order() {
        let first = Uuid::from_u128(1);
        let second = Uuid::from_u128(2);
        let snapshot = vec![
            UnbilledItem {
                item_id: Uuid::new_v4(),
                cost_cents: 200,
                organization_id: second,
                organization_name: "Second".to_string(),
                account_slug: Some("second".to_string()),
            },
            UnbilledItem {
                item_id: Uuid::new_v4(),
                cost_cents: 500,
                organization_id: first,
                organization_name: "First".to_string(),
                account_slug: Some("first".to_string()),
            },
            UnbilledItem {
                item_id: Uuid::new_v4(),
                cost_cents: 700,
                organization_id: first,
                organization_name: "First".to_string(),
                account_slug: Some("first".to_string()),
            },
        ];

        let groups = group_by_organization(&snapshot);

        let keys: Vec<Uuid> = groups.keys().copied().collect();
        assert_eq!(keys, vec![first, second]);
        assert_eq!(groups[&first].total_cents, 1200);
        assert_eq!(groups[&first].item_ids.len(), 2);
        assert_eq!(groups[&second].total_cents, 200);
    }
}
