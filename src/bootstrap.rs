use std::{sync::Arc, time::Duration};

use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::info;

use crate::{
    api::handler::AppState,
    billing::{BillingScheduleConfig, BillingScheduler, DisbursementReconciler},
    config::Config,
    error::AppResult,
    gateway::{GatewayConfig, PaymentApiClient, PaymentGateway},
    ledger::repository::LedgerRepository,
    middleware::auth::key_digest,
    notify::{NoopNotifier, NotificationSink, WebhookNotifier},
};

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    let pool = initialize_database(&config.database_url).await?;

    let ledger = Arc::new(LedgerRepository::new(pool));

    let gateway: Arc<dyn PaymentGateway> = Arc::new(PaymentApiClient::new(GatewayConfig {
        base_url: config.gateway_base_url.clone(),
        token_url: config.gateway_token_url.clone(),
        client_id: config.gateway_client_id.clone(),
        client_secret: config.gateway_client_secret.clone(),
        access_token: config.gateway_access_token.clone(),
        refresh_token: config.gateway_refresh_token.clone(),
        destination_slug: config.fulfillment_account_slug.clone(),
    }));
    info!(
        "✓ Payment gateway client initialized (destination: {})",
        config.fulfillment_account_slug
    );

    let notifier: Arc<dyn NotificationSink> = if config.notify_webhook_url.is_empty() {
        info!("No notification webhook configured - billing notices will be dropped");
        Arc::new(NoopNotifier)
    } else {
        info!("✓ Webhook notifier initialized");
        Arc::new(WebhookNotifier::new(config.notify_webhook_url.clone()))
    };

    let reconciler = Arc::new(DisbursementReconciler::new(
        ledger.clone(),
        gateway.clone(),
        notifier,
    ));

    let schedule = BillingScheduleConfig::from_minutes(config.billing_interval_minutes);
    let scheduler = BillingScheduler::new(schedule.clone(), reconciler.clone());
    let _ = scheduler.start();
    info!(
        "✓ Billing scheduler started (every {} minutes)",
        schedule.interval_minutes
    );

    Ok(AppState {
        ledger,
        reconciler,
        gateway,
        admin_key_digest: key_digest(&config.admin_api_key),
    })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await?;

    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
