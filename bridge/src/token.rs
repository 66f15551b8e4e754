use rapt_common::{BridgeError, Credential, Result};
use reqwest::header::ACCEPT;
use serde::Deserialize;
use tracing::{debug, info};

use crate::api::network_error;
use crate::store::CredentialStore;

/// Exchanges account credentials for a bearer token.
pub trait TokenEndpoint {
    async fn request_token(&self, username: &str, secret: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Password grant against the RAPT identity server.
pub struct RaptTokenEndpoint {
    http: reqwest::Client,
    url: String,
    client_id: String,
}

impl RaptTokenEndpoint {
    pub fn new(
        http: reqwest::Client,
        url: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            http,
            url: url.into(),
            client_id: client_id.into(),
        }
    }
}

impl TokenEndpoint for RaptTokenEndpoint {
    async fn request_token(&self, username: &str, secret: &str) -> Result<String> {
        let form = [
            ("client_id", self.client_id.as_str()),
            ("grant_type", "password"),
            ("username", username),
            ("password", secret),
        ];

        let response = self
            .http
            .post(&self.url)
            .header(ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|err| network_error(&self.url, err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::Auth {
                status: status.as_u16(),
                endpoint: self.url.clone(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|err| network_error(&self.url, err))?;
        parse_access_token(&self.url, &body)
    }
}

pub fn parse_access_token(endpoint: &str, body: &str) -> Result<String> {
    let protocol = |detail: String| BridgeError::Protocol {
        endpoint: endpoint.to_string(),
        detail,
    };

    let response: TokenResponse =
        serde_json::from_str(body).map_err(|err| protocol(err.to_string()))?;
    if response.access_token.is_empty() {
        return Err(protocol("empty access_token".to_string()));
    }
    Ok(response.access_token)
}

/// Hands out a bearer token that is fresh for the given instant, refreshing
/// and persisting it through the [`CredentialStore`] when needed.
pub struct TokenManager<E> {
    endpoint: E,
    store: CredentialStore,
    username: String,
    secret: String,
    force_refresh: bool,
}

impl<E: TokenEndpoint> TokenManager<E> {
    pub fn new(
        endpoint: E,
        store: CredentialStore,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            endpoint,
            store,
            username: username.into(),
            secret: secret.into(),
            force_refresh: false,
        }
    }

    pub async fn get_valid_token(&mut self, now: i64) -> Result<String> {
        if !self.force_refresh {
            match self.store.load().await? {
                Some(credential) if credential.is_fresh(now) => {
                    debug!(age_secs = credential.age(now), "using stored token");
                    return Ok(credential.token);
                }
                Some(credential) => {
                    info!(
                        age_secs = credential.age(now),
                        "stored token expired, requesting new token"
                    );
                }
                None => info!("no stored token, requesting new token"),
            }
        }

        let token = self
            .endpoint
            .request_token(&self.username, &self.secret)
            .await?;
        self.store
            .save(&Credential {
                issued_at: now,
                token: token.clone(),
            })
            .await?;
        self.force_refresh = false;

        info!(path = %self.store.path().display(), "token renewed");
        Ok(token)
    }

    /// The API rejected the current token; ignore the stored one next time.
    pub fn invalidate(&mut self) {
        self.force_refresh = true;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;
    use rapt_common::TOKEN_FRESHNESS_SECS;

    use super::*;
    use crate::store::scratch_dir;

    const ISSUED: i64 = 1_700_000_000;

    struct CountingEndpoint {
        calls: AtomicUsize,
        status: Option<u16>,
    }

    impl CountingEndpoint {
        fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                status: None,
            }
        }

        fn failing(status: u16) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                status: Some(status),
            }
        }
    }

    impl TokenEndpoint for CountingEndpoint {
        async fn request_token(&self, username: &str, secret: &str) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            assert_eq!((username, secret), ("brewer@example.com", "s3cret"));
            match self.status {
                Some(status) => Err(BridgeError::Auth {
                    status,
                    endpoint: "https://id.rapt.io/connect/token".to_string(),
                }),
                None => Ok(format!("token-{call}")),
            }
        }
    }

    async fn manager_with_stored(
        name: &str,
        stored: Option<Credential>,
    ) -> TokenManager<CountingEndpoint> {
        let store = CredentialStore::new(scratch_dir(name).join("token.txt"));
        if let Some(credential) = stored {
            store.save(&credential).await.unwrap();
        }
        TokenManager::new(CountingEndpoint::ok(), store, "brewer@example.com", "s3cret")
    }

    fn stored(token: &str) -> Option<Credential> {
        Some(Credential {
            issued_at: ISSUED,
            token: token.to_string(),
        })
    }

    #[tokio::test]
    async fn fresh_token_is_reused_up_to_threshold() {
        let mut manager = manager_with_stored("token-fresh", stored("cached")).await;

        for age in [0, 60, TOKEN_FRESHNESS_SECS - 1, TOKEN_FRESHNESS_SECS] {
            let token = manager.get_valid_token(ISSUED + age).await.unwrap();
            assert_eq!(token, "cached", "age {age}");
        }

        assert_eq!(manager.endpoint.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stale_token_is_refreshed_and_persisted() {
        let mut manager = manager_with_stored("token-stale", stored("cached")).await;
        let now = ISSUED + TOKEN_FRESHNESS_SECS + 1;

        let token = manager.get_valid_token(now).await.unwrap();

        assert_eq!(token, "token-1");
        assert_eq!(manager.endpoint.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            manager.store.load().await.unwrap(),
            Some(Credential {
                issued_at: now,
                token: "token-1".to_string(),
            })
        );

        // The renewed record is fresh again for the next hour.
        let again = manager.get_valid_token(now + 30).await.unwrap();
        assert_eq!(again, "token-1");
        assert_eq!(manager.endpoint.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_record_triggers_one_refresh() {
        let mut manager = manager_with_stored("token-missing", None).await;

        manager.get_valid_token(ISSUED).await.unwrap();
        manager.get_valid_token(ISSUED + 1).await.unwrap();

        assert_eq!(manager.endpoint.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_refresh_once() {
        let mut manager = manager_with_stored("token-invalidate", stored("revoked")).await;

        manager.invalidate();
        let renewed = manager.get_valid_token(ISSUED + 10).await.unwrap();
        let reused = manager.get_valid_token(ISSUED + 20).await.unwrap();

        assert_eq!(renewed, "token-1");
        assert_eq!(reused, "token-1");
        assert_eq!(manager.endpoint.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auth_failure_leaves_store_untouched() {
        let store = CredentialStore::new(scratch_dir("token-auth-failure").join("token.txt"));
        let mut manager = TokenManager::new(
            CountingEndpoint::failing(401),
            store,
            "brewer@example.com",
            "s3cret",
        );

        let err = manager.get_valid_token(ISSUED).await.unwrap_err();

        assert!(matches!(err, BridgeError::Auth { status: 401, .. }));
        assert!(err.is_fatal());
        assert_eq!(manager.store.load().await.unwrap(), None);
    }

    #[test]
    fn access_token_is_extracted() {
        let body = r#"{"access_token":"eyJ.abc.def","expires_in":3600,"token_type":"Bearer"}"#;
        assert_eq!(parse_access_token("auth", body).unwrap(), "eyJ.abc.def");
    }

    #[test]
    fn missing_access_token_is_protocol_error() {
        for body in [r#"{"token_type":"Bearer"}"#, "<html>", r#"{"access_token":""}"#] {
            let err = parse_access_token("auth", body).unwrap_err();
            assert!(matches!(err, BridgeError::Protocol { .. }), "{body}");
        }
    }
}
