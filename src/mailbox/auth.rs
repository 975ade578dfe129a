//! Bearer tokens for Microsoft Graph.

use chrono::{DateTime, TimeDelta, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::GraphCredentials;
use crate::error::MailboxError;
use crate::llm::provider::retry_after;

const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";
const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";
/// Tokens are refreshed this long before they expire.
const EXPIRY_MARGIN: TimeDelta = TimeDelta::seconds(60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

struct CachedToken {
    token: SecretString,
    expires_at: DateTime<Utc>,
}

/// Hands out tokens, caching client-credential tokens until shortly before
/// they expire.
pub struct TokenSource {
    client: Client,
    credentials: GraphCredentials,
    authority: String,
    cache: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    pub fn new(client: Client, credentials: GraphCredentials) -> Self {
        Self {
            client,
            credentials,
            authority: DEFAULT_AUTHORITY.to_string(),
            cache: Mutex::new(None),
        }
    }

    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into().trim_end_matches('/').to_string();
        self
    }

    /// A token valid for at least `EXPIRY_MARGIN`.
    pub async fn token(&self) -> Result<SecretString, MailboxError> {
        let (tenant_id, client_id, client_secret) = match &self.credentials {
            GraphCredentials::Static(token) => return Ok(token.clone()),
            GraphCredentials::ClientCredentials {
                tenant_id,
                client_id,
                client_secret,
            } => (tenant_id, client_id, client_secret),
        };

        // Held across the request so concurrent runs share one refresh.
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref()
            && cached.expires_at - EXPIRY_MARGIN > Utc::now()
        {
            return Ok(cached.token.clone());
        }

        debug!(tenant_id = %tenant_id, "Requesting Graph access token");
        let response = self
            .client
            .post(format!("{}/{}/oauth2/v2.0/token", self.authority, tenant_id))
            .form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.expose_secret()),
                ("scope", GRAPH_SCOPE),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let hint = retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            // The token endpoint answers 400 for bad client credentials.
            if status.as_u16() == 400 {
                return Err(MailboxError::AuthFailed {
                    reason: body.chars().take(300).collect(),
                });
            }
            return Err(MailboxError::from_status(status.as_u16(), hint, &body));
        }

        let parsed: TokenResponse = response.json().await?;
        let token = SecretString::from(parsed.access_token);
        *cache = Some(CachedToken {
            token: token.clone(),
            expires_at: Utc::now() + TimeDelta::seconds(parsed.expires_in),
        });
        info!(expires_in = parsed.expires_in, "Acquired Graph access token");
        Ok(token)
    }

    /// Drop the cached token after the API rejected it.
    pub async fn invalidate(&self) {
        self.cache.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_credentials() -> GraphCredentials {
        GraphCredentials::ClientCredentials {
            tenant_id: "tenant-1".into(),
            client_id: "app".into(),
            client_secret: SecretString::from("s3cret"),
        }
    }

    #[tokio::test]
    async fn static_token_is_returned_as_is() {
        let source = TokenSource::new(
            Client::new(),
            GraphCredentials::Static(SecretString::from("fixed")),
        );
        assert_eq!(source.token().await.unwrap().expose_secret(), "fixed");
    }

    #[tokio::test]
    async fn client_credentials_token_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenant-1/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token_type": "Bearer",
                "expires_in": 3599,
                "access_token": "graph-token"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let source =
            TokenSource::new(Client::new(), client_credentials()).with_authority(server.uri());
        assert_eq!(source.token().await.unwrap().expose_secret(), "graph-token");
        assert_eq!(source.token().await.unwrap().expose_secret(), "graph-token");
    }

    #[tokio::test]
    async fn short_lived_token_is_refreshed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenant-1/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "expires_in": 30,
                "access_token": "short"
            })))
            .expect(2)
            .mount(&server)
            .await;

        let source =
            TokenSource::new(Client::new(), client_credentials()).with_authority(server.uri());
        source.token().await.unwrap();
        source.token().await.unwrap();
    }

    #[tokio::test]
    async fn bad_client_secret_is_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid_client"}"#),
            )
            .mount(&server)
            .await;

        let source =
            TokenSource::new(Client::new(), client_credentials()).with_authority(server.uri());
        let err = source.token().await.unwrap_err();
        assert!(matches!(err, MailboxError::AuthFailed { .. }));
        assert!(!err.is_transient());
    }
}
