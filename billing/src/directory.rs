use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::error::{AppError, Res};
use log::{info, warn};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use uuid::Uuid;

/// Lookup of accounts owned by the user service.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// `None` when the user does not exist.
    async fn account_created_at(&self, user_id: &Uuid) -> Res<Option<DateTime<Utc>>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountResponse {
    created_at: DateTime<Utc>,
}

/// Calls the user service over HTTP with a service API key.
pub struct HttpUserDirectory {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpUserDirectory {
    pub fn new(base_url: String, api_key: String) -> Self {
        HttpUserDirectory {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl UserDirectory for HttpUserDirectory {
    async fn account_created_at(&self, user_id: &Uuid) -> Res<Option<DateTime<Utc>>> {
        info!("Looking up user {} in {}", user_id, self.base_url);
        let response = self
            .client
            .get(format!("{}/users/{}", self.base_url, user_id))
            .header("X-API-Key", &self.api_key)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let account = response.json::<AccountResponse>().await?;
                Ok(Some(account.created_at))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => {
                let message = response
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|body| body["message"].as_str().map(str::to_string))
                    .unwrap_or_else(|| "Failed to look up user".to_string());
                warn!("User directory returned {} for {}: {}", status, user_id, message);
                Err(AppError::Internal(format!(
                    "User directory returned {}: {}",
                    status, message
                )))
            }
        }
    }
}
