//! Installation credential lifecycle.
//!
//! Two tiers: a short-lived RS256 process credential signed with the app's
//! private key (nine minutes, generated on demand, never cached), and the
//! installation token it is exchanged for at the forge (one hour, cached).
//! Cached entries are considered stale five minutes before their true
//! expiry to absorb clock skew between this service and the forge.
//!
//! Refreshes are single-flight: concurrent callers for the same
//! installation see at most one outstanding exchange.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::{ReviewError, Result};

/// Safety margin subtracted from a token's true expiry.
const EXPIRY_MARGIN_SECS: i64 = 300;

#[derive(Debug, Serialize)]
struct AppClaims {
    iss: u64,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: String,
}

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

pub struct TokenCache {
    client: reqwest::Client,
    api_base: String,
    app_id: u64,
    encoding_key: EncodingKey,
    entries: RwLock<HashMap<u64, CachedToken>>,
    /// Per-installation refresh gates for single-flight coalescing.
    inflight: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
}

impl TokenCache {
    /// Parse the signing key up front: a missing or malformed key is a
    /// fatal startup condition, not something to discover per request.
    pub fn new(
        client: reqwest::Client,
        api_base: String,
        app_id: u64,
        private_key_pem: &str,
    ) -> Result<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .map_err(|e| ReviewError::Auth(format!("invalid app private key: {e}")))?;
        Ok(TokenCache {
            client,
            api_base,
            app_id,
            encoding_key,
            entries: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// A fresh process credential. Issued sixty seconds in the past for
    /// clock drift; expires in nine minutes (the forge maximum is ten).
    fn generate_app_jwt(&self) -> Result<String> {
        let now = Utc::now().timestamp() as u64;
        let claims = AppClaims {
            iss: self.app_id,
            iat: now - 60,
            exp: now + 540,
        };
        encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(|e| ReviewError::Auth(format!("failed to sign app JWT: {e}")))
    }

    /// Return an installation token with at least the safety margin of
    /// lifetime remaining, refreshing if necessary.
    pub async fn get_token(&self, installation_id: u64) -> Result<String> {
        if let Some(token) = self.fresh_cached(installation_id).await {
            return Ok(token);
        }

        let gate = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(installation_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = gate.lock().await;

        // Whoever held the gate before us may have already refreshed.
        if let Some(token) = self.fresh_cached(installation_id).await {
            return Ok(token);
        }

        let cached = self.exchange(installation_id).await?;
        let token = cached.token.clone();
        self.entries
            .write()
            .await
            .insert(installation_id, cached);
        Ok(token)
    }

    /// Drop the cached entry; the next call refreshes.
    pub async fn invalidate(&self, installation_id: u64) {
        self.entries.write().await.remove(&installation_id);
    }

    async fn fresh_cached(&self, installation_id: u64) -> Option<String> {
        let entries = self.entries.read().await;
        let cached = entries.get(&installation_id)?;
        if cached.expires_at - Utc::now() > Duration::seconds(EXPIRY_MARGIN_SECS) {
            Some(cached.token.clone())
        } else {
            None
        }
    }

    async fn exchange(&self, installation_id: u64) -> Result<CachedToken> {
        let jwt = self.generate_app_jwt()?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base, installation_id
        );

        info!(installation_id, "requesting new installation access token");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {jwt}"))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", crate::github::API_VERSION)
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED => Err(ReviewError::Auth(
                "app JWT rejected by the forge; check app id and private key".to_string(),
            )),
            StatusCode::NOT_FOUND => Err(ReviewError::NotFound(format!(
                "installation {installation_id} not found; it may have been uninstalled"
            ))),
            status if status.is_server_error() => {
                Err(ReviewError::Transient(format!("token exchange failed: {status}")))
            }
            status if !status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                warn!(installation_id, %status, "token exchange failed");
                Err(ReviewError::Transient(format!(
                    "token exchange failed: {status} {body}"
                )))
            }
            _ => {
                let parsed: InstallationTokenResponse = response
                    .json()
                    .await
                    .map_err(|e| ReviewError::Transient(format!("bad token response: {e}")))?;
                let expires_at = DateTime::parse_from_rfc3339(&parsed.expires_at)
                    .map_err(|e| {
                        ReviewError::Transient(format!("bad token expiry timestamp: {e}"))
                    })?
                    .with_timezone(&Utc);
                info!(installation_id, "obtained installation access token");
                Ok(CachedToken {
                    token: parsed.token,
                    expires_at,
                })
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn seed_for_test(&self, installation_id: u64, token: &str, ttl_secs: i64) {
        self.entries.write().await.insert(
            installation_id,
            CachedToken {
                token: token.to_string(),
                expires_at: Utc::now() + Duration::seconds(ttl_secs),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A throwaway RSA key for signing tests. Not used anywhere real.
    const TEST_RSA_KEY: &str = include_str!("testdata/test_signing_key.pem");

    fn cache() -> TokenCache {
        TokenCache::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1".to_string(),
            1234,
            TEST_RSA_KEY,
        )
        .expect("test key parses")
    }

    #[test]
    fn malformed_private_key_fails_construction() {
        let result = TokenCache::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1".to_string(),
            1234,
            "not a pem",
        );
        assert!(matches!(result, Err(ReviewError::Auth(_))));
    }

    #[test]
    fn app_jwt_is_generated_with_valid_key() {
        let cache = cache();
        let jwt = cache.generate_app_jwt().expect("jwt signs");
        // A JWT has three dot-separated segments.
        assert_eq!(jwt.split('.').count(), 3);
    }

    #[tokio::test]
    async fn fresh_cached_token_is_returned_without_exchange() {
        let cache = cache();
        cache.seed_for_test(99, "cached-token", 3600).await;
        // The api_base points at a closed port, so any network attempt
        // would fail; a cache hit must not touch the network.
        let token = cache.get_token(99).await.expect("cache hit");
        assert_eq!(token, "cached-token");
    }

    #[tokio::test]
    async fn stale_token_inside_margin_is_not_served() {
        let cache = cache();
        // 60s remaining is inside the 5-minute safety margin.
        cache.seed_for_test(99, "stale-token", 60).await;
        let result = cache.get_token(99).await;
        // Refresh is forced and fails against the closed port.
        assert!(matches!(result, Err(ReviewError::Transient(_))));
    }

    #[tokio::test]
    async fn invalidate_forces_refresh() {
        let cache = cache();
        cache.seed_for_test(99, "cached-token", 3600).await;
        cache.invalidate(99).await;
        assert!(cache.get_token(99).await.is_err());
    }
}
