//! HTTP clients for the QR validation and streak services.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use zzik_store::{QrValidation, QrVerifier, StoreError, StreakEvent, StreakHook, StreakOutcome};

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Server { status: u16, body: String },
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<RemoteError> for StoreError {
    fn from(e: RemoteError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

fn join(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

async fn post_json<B: Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    body: &B,
) -> Result<reqwest::Response, RemoteError> {
    let resp = client.post(url).json(body).send().await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(RemoteError::Server {
            status: status.as_u16(),
            body,
        });
    }
    Ok(resp)
}

#[derive(Serialize)]
struct QrRequest<'a> {
    token: &'a str,
    user_id: &'a str,
}

/// Client for the QR service that issues and verifies single-use tokens.
pub struct QrClient {
    client: reqwest::Client,
    base_url: String,
}

impl QrClient {
    /// `base_url` like `http://localhost:4000`; a trailing slash is dropped.
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn validate_token(
        &self,
        token: &str,
        user_id: &str,
    ) -> Result<QrValidation, RemoteError> {
        let url = join(&self.base_url, "api/qr/validate");
        debug!(url = %url, user_id, "validating qr token");
        let resp = post_json(&self.client, &url, &QrRequest { token, user_id }).await?;
        let validation: QrValidation = serde_json::from_str(&resp.text().await?)?;
        Ok(validation)
    }

    pub async fn mark_token_used(&self, token: &str, user_id: &str) -> Result<(), RemoteError> {
        let url = join(&self.base_url, "api/qr/mark-used");
        post_json(&self.client, &url, &QrRequest { token, user_id }).await?;
        info!(user_id, "qr code marked as used");
        Ok(())
    }
}

#[async_trait]
impl QrVerifier for QrClient {
    async fn validate(&self, token: &str, user_id: &str) -> Result<QrValidation, StoreError> {
        Ok(self.validate_token(token, user_id).await?)
    }

    async fn mark_used(&self, token: &str, user_id: &str) -> Result<(), StoreError> {
        Ok(self.mark_token_used(token, user_id).await?)
    }
}

/// Client for the gamification service notified after each check-in.
pub struct StreakClient {
    client: reqwest::Client,
    base_url: String,
}

impl StreakClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn process_check_in(&self, event: &StreakEvent) -> Result<StreakOutcome, RemoteError> {
        let url = join(&self.base_url, "api/streaks/check-in");
        let resp = post_json(&self.client, &url, event).await?;
        let outcome: StreakOutcome = serde_json::from_str(&resp.text().await?)?;
        info!(
            user_id = %event.user_id,
            current_streak = outcome.current_streak,
            bonus_tokens = outcome.bonus_tokens,
            "streak updated"
        );
        Ok(outcome)
    }
}

#[async_trait]
impl StreakHook for StreakClient {
    async fn on_check_in(&self, event: StreakEvent) -> Result<StreakOutcome, StoreError> {
        Ok(self.process_check_in(&event).await?)
    }
}
