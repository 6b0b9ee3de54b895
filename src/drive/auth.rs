//! Access-token lookup and refresh for the Drive client.
//!
//! Refresh is single-flight per user: concurrent requests for the same user
//! queue on a per-user async mutex, and whoever gets the lock second finds
//! the token already refreshed.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use reqwest::Client;
use serde::Deserialize;

use crate::config::DriveConfig;
use crate::database::{lock_db, now_unix, Database, GOOGLE_PROVIDER};
use crate::error::{WritingError, WritingResult};
use crate::models::StoredToken;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Hands out valid access tokens, refreshing expired ones.
pub struct TokenRefresher {
    http: Client,
    in_flight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl TokenRefresher {
    pub fn new(config: &DriveConfig) -> WritingResult<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| WritingError::Network(e.to_string()))?;

        Ok(Self {
            http,
            in_flight: DashMap::new(),
        })
    }

    /// A usable access token for `user_id`.
    ///
    /// Fails with `Authentication` when no credentials are stored or the
    /// refresh-token exchange is rejected.
    pub async fn access_token(
        &self,
        db: &Mutex<Database>,
        config: &DriveConfig,
        user_id: &str,
    ) -> WritingResult<String> {
        let token = load_token(db, user_id)?;
        if !token.is_expired(now_unix(), config.token_expiry_skew_secs) {
            return Ok(token.access_token);
        }

        let lock = self.in_flight.entry(user_id.to_string()).or_default().clone();
        let result = self.refresh_locked(&lock, db, config, user_id).await;

        drop(lock);
        // Entries only outlive the refreshes still waiting on them
        self.in_flight
            .remove_if(user_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn refresh_locked(
        &self,
        lock: &tokio::sync::Mutex<()>,
        db: &Mutex<Database>,
        config: &DriveConfig,
        user_id: &str,
    ) -> WritingResult<String> {
        let _guard = lock.lock().await;

        // Another request may have refreshed while we waited
        let token = load_token(db, user_id)?;
        if !token.is_expired(now_unix(), config.token_expiry_skew_secs) {
            return Ok(token.access_token);
        }

        let refreshed = self.refresh(config, user_id, &token).await?;
        let expires_at = refreshed.expires_in.map(|secs| now_unix() + secs);
        lock_db(db)?.save_access_token(
            user_id,
            GOOGLE_PROVIDER,
            &refreshed.access_token,
            expires_at,
        )?;

        tracing::info!(user_id = %user_id, "Refreshed Google access token");
        Ok(refreshed.access_token)
    }

    async fn refresh(
        &self,
        config: &DriveConfig,
        user_id: &str,
        token: &StoredToken,
    ) -> WritingResult<TokenResponse> {
        if token.refresh_token.is_empty() {
            return Err(WritingError::Authentication(
                "access token expired and no refresh token is stored".to_string(),
            ));
        }

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", token.refresh_token.as_str()),
            ("client_id", token.client_id.as_str()),
            ("client_secret", token.client_secret.as_str()),
        ];

        let response = self
            .http
            .post(&config.token_uri)
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(user_id = %user_id, error = %e, "Token refresh request failed");
                WritingError::Authentication(format!("token refresh failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                user_id = %user_id,
                status = %status,
                "Token endpoint rejected refresh"
            );
            return Err(WritingError::Authentication(format!(
                "token refresh rejected with status {}: {}",
                status, body
            )));
        }

        response.json::<TokenResponse>().await.map_err(|e| {
            WritingError::Authentication(format!("invalid token response: {}", e))
        })
    }
}

fn load_token(db: &Mutex<Database>, user_id: &str) -> WritingResult<StoredToken> {
    lock_db(db)?
        .get_token(user_id, GOOGLE_PROVIDER)?
        .ok_or_else(|| {
            WritingError::Authentication(format!(
                "no Google credentials stored for user {}",
                user_id
            ))
        })
}
