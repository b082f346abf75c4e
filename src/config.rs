use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub gateway_base_url: String,
    pub gateway_token_url: String,
    pub gateway_client_id: String,
    pub gateway_client_secret: String,
    pub gateway_access_token: String,
    pub gateway_refresh_token: String,
    /// Destination account for every disbursement
    pub fulfillment_account_slug: String,
    /// Incoming-webhook URL for billing notices; empty disables notifications
    pub notify_webhook_url: String,
    pub admin_api_key: String,
    pub billing_interval_minutes: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Ok(Self {
            database_url: require("DATABASE_URL")?,
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            gateway_base_url: std::env::var("GATEWAY_BASE_URL")
                .unwrap_or_else(|_| "https://pay.example.com/api/v1".to_string()),
            gateway_token_url: std::env::var("GATEWAY_TOKEN_URL")
                .unwrap_or_else(|_| "https://pay.example.com/oauth/token".to_string()),
            gateway_client_id: std::env::var("GATEWAY_CLIENT_ID").unwrap_or_default(),
            gateway_client_secret: std::env::var("GATEWAY_CLIENT_SECRET").unwrap_or_default(),
            gateway_access_token: std::env::var("GATEWAY_ACCESS_TOKEN").unwrap_or_default(),
            gateway_refresh_token: std::env::var("GATEWAY_REFRESH_TOKEN").unwrap_or_default(),
            fulfillment_account_slug: std::env::var("FULFILLMENT_ACCOUNT_SLUG")
                .unwrap_or_else(|_| "fulfillment".to_string()),
            notify_webhook_url: std::env::var("NOTIFY_WEBHOOK_URL").unwrap_or_default(),
            admin_api_key: require("ADMIN_API_KEY")?,
            billing_interval_minutes: std::env::var("BILLING_INTERVAL_MINUTES")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(60),
        })
    }
}

fn require(name: &str) -> Result<String, config::ConfigError> {
    std::env::var(name).map_err(|_| config::ConfigError::Message(format!("{} must be set", name)))
}
