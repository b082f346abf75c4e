use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::error::{AppError, AppResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const LIST_TRANSFERS_LIMIT: u32 = 100;

/// Outcome of a transfer creation call. A closed set: the reconciler branches
/// on these three cases and nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The gateway accepted the transfer
    Created { transfer_id: String },
    /// Permanent rejection; an identical retry cannot succeed
    Rejected { status: u16, detail: String },
    /// Transient failure; the identical request may succeed later
    Unavailable { detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Permanent,
    Transient,
}

/// Classify a gateway HTTP status. 400/403/404 (malformed request,
/// unauthorized, unknown account) are unfixable for an identical retry;
/// everything else is worth retrying.
pub fn classify_status(status: u16) -> FailureClass {
    match status {
        400 | 403 | 404 => FailureClass::Permanent,
        _ => FailureClass::Transient,
    }
}

/// A transfer as reported by the gateway's listing endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: String,
    #[serde(default)]
    pub memo: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub amount_cents: i64,
}

impl TransferRecord {
    fn memo_text(&self) -> &str {
        self.memo
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or_default()
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a transfer from the organization's account to the fulfillment
    /// account. The memo carries the idempotency key.
    async fn create_transfer(
        &self,
        source_slug: &str,
        amount_cents: i64,
        memo: &str,
    ) -> TransferOutcome;

    /// List recent transfers on an account
    async fn list_transfers(&self, account_slug: &str) -> AppResult<Vec<TransferRecord>>;

    /// Best-effort lookup by memo substring and exact amount. Manual recovery
    /// tooling only; the automated path relies on the idempotency key.
    async fn find_transfer_by_memo(
        &self,
        account_slug: &str,
        needle: &str,
        amount_cents: i64,
    ) -> AppResult<Option<TransferRecord>> {
        let transfers = self.list_transfers(account_slug).await?;
        Ok(transfers
            .into_iter()
            .find(|transfer| {
                transfer.memo_text().contains(needle) && transfer.amount_cents == amount_cents
            }))
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Destination account for every transfer
    pub destination_slug: String,
}

struct TokenCache {
    access_token: String,
    refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateTransferResponse {
    id: String,
}

/// OAuth2 client for the payments API. The token cache is explicit state
/// owned by the client; requests retry exactly once on 401 after a refresh.
pub struct PaymentApiClient {
    http: reqwest::Client,
    base_url: String,
    token_url: String,
    client_id: String,
    client_secret: String,
    destination_slug: String,
    tokens: Mutex<TokenCache>,
}

impl PaymentApiClient {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token_url: config.token_url,
            client_id: config.client_id,
            client_secret: config.client_secret,
            destination_slug: config.destination_slug,
            tokens: Mutex::new(TokenCache {
                access_token: config.access_token,
                refresh_token: config.refresh_token,
            }),
        }
    }

    /// OAuth2 refresh_token grant; updates the cached tokens
    async fn refresh_access_token(&self) -> AppResult<String> {
        let refresh_token = { self.tokens.lock().await.refresh_token.clone() };
        if refresh_token.is_empty() {
            return Err(AppError::Config(
                "no refresh token available - re-authorization required".to_string(),
            ));
        }
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(AppError::Config(
                "gateway client credentials required for token refresh".to_string(),
            ));
        }

        info!("Refreshing gateway access token");

        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::ExternalError(format!(
                "token refresh failed: status {}",
                response.status()
            )));
        }

        let token: TokenResponse = response.json().await?;

        let mut cache = self.tokens.lock().await;
        cache.access_token = token.access_token.clone();
        if let Some(refresh) = token.refresh_token {
            cache.refresh_token = refresh;
        }

        info!("Gateway access token refreshed");
        Ok(token.access_token)
    }

    async fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&serde_json::Value>,
        token: &str,
    ) -> AppResult<reqwest::Response> {
        let mut builder = self
            .http
            .request(method, url)
            .bearer_auth(token)
            .timeout(REQUEST_TIMEOUT);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        Ok(builder.send().await?)
    }

    /// Issue a request with the cached token, refreshing and retrying once
    /// on 401
    async fn send_authorized(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> AppResult<reqwest::Response> {
        let token = { self.tokens.lock().await.access_token.clone() };
        let response = self.request(method.clone(), url, body, &token).await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            info!("Gateway returned 401, attempting token refresh");
            let refreshed = self.refresh_access_token().await?;
            return self.request(method, url, body, &refreshed).await;
        }

        Ok(response)
    }
}

#[async_trait]
impl PaymentGateway for PaymentApiClient {
    async fn create_transfer(
        &self,
        source_slug: &str,
        amount_cents: i64,
        memo: &str,
    ) -> TransferOutcome {
        let url = format!("{}/organizations/{}/transfers", self.base_url, source_slug);
        let payload = serde_json::json!({
            "to_organization_id": self.destination_slug,
            "amount_cents": amount_cents,
            "name": memo,
        });

        info!(
            "Creating gateway transfer: {} -> {}, {} cents",
            source_slug, self.destination_slug, amount_cents
        );

        let response = match self
            .send_authorized(reqwest::Method::POST, &url, Some(&payload))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!("Gateway unreachable creating transfer: {}", e);
                return TransferOutcome::Unavailable {
                    detail: e.to_string(),
                };
            }
        };

        let status = response.status();
        if status.is_success() {
            return match response.json::<CreateTransferResponse>().await {
                Ok(body) => {
                    info!("Transfer created: {}", body.id);
                    TransferOutcome::Created {
                        transfer_id: body.id,
                    }
                }
                Err(e) => TransferOutcome::Unavailable {
                    detail: format!("unreadable transfer response: {}", e),
                },
            };
        }

        let detail = response.text().await.unwrap_or_default();
        match classify_status(status.as_u16()) {
            FailureClass::Permanent => TransferOutcome::Rejected {
                status: status.as_u16(),
                detail: format!("gateway rejected transfer: status {} - {}", status, detail),
            },
            FailureClass::Transient => TransferOutcome::Unavailable {
                detail: format!("gateway error: status {} - {}", status, detail),
            },
        }
    }

    async fn list_transfers(&self, account_slug: &str) -> AppResult<Vec<TransferRecord>> {
        let url = format!(
            "{}/organizations/{}/transfers?per_page={}",
            self.base_url, account_slug, LIST_TRANSFERS_LIMIT
        );

        let response = self
            .send_authorized(reqwest::Method::GET, &url, None)
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::NotFound(format!(
                "organization not found: {}",
                account_slug
            )));
        }
        if !response.status().is_success() {
            return Err(AppError::ExternalError(format!(
                "gateway error listing transfers: status {}",
                response.status()
            )));
        }

        Ok(response.json().await?)
    }
}
