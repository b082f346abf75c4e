use std::time::Duration;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use http::{HeaderName, HeaderValue};
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer, set_header::SetResponseHeaderLayer, timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;

use crate::{
    api::handler::{
        get_disbursement, health_check, list_disbursements, locate_disbursement, run_billing,
        AppState,
    },
    middleware::{create_cors_layer, require_admin},
};

pub async fn create_app(state: AppState) -> Router {
    info!("Setting up HTTP routes...");

    let admin_routes = Router::new()
        .route("/admin/billing/run", post(run_billing))
        .route("/admin/disbursements", get(list_disbursements))
        .route("/admin/disbursements/:id", get(get_disbursement))
        .route("/admin/disbursements/:id/locate", get(locate_disbursement))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    let app = Router::new()
        // Public health check endpoint
        .route("/health", get(health_check))
        // Admin endpoints behind the bearer-key check
        .nest("/api/v1", admin_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(SetResponseHeaderLayer::if_not_present(
                    HeaderName::from_static("x-content-type-options"),
                    HeaderValue::from_static("nosniff"),
                ))
                .layer(create_cors_layer())
                // a manual run can take a while when the gateway is slow
                .layer(TimeoutLayer::new(Duration::from_secs(120))),
        )
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("Server listening on: {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}
