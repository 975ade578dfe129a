//! Microsoft Graph mailbox.
//!
//! `GraphMailbox` implements the pipeline's `Mailbox` capability: fetch a
//! message, fetch its conversation, store a draft reply. It never sends.

mod auth;
mod graph;

pub use auth::TokenSource;
pub use graph::GraphMailbox;

use secrecy::SecretString;

use crate::config::{VarLookup, optional_var};
use crate::error::ConfigError;

/// How the mailbox obtains bearer tokens.
#[derive(Debug, Clone)]
pub enum GraphCredentials {
    /// A pre-acquired token (delegated flows, local testing).
    Static(SecretString),
    /// OAuth2 client-credentials grant against an Entra ID tenant.
    ClientCredentials {
        tenant_id: String,
        client_id: String,
        client_secret: SecretString,
    },
}

/// Graph mailbox configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub credentials: GraphCredentials,
    /// `me` or a user principal name.
    pub user: String,
}

impl GraphConfig {
    pub fn from_vars(vars: VarLookup<'_>) -> Result<Self, ConfigError> {
        let user = optional_var(vars, "GRAPH_USER").unwrap_or_else(|| "me".to_string());

        let credentials = if let Some(token) = optional_var(vars, "GRAPH_ACCESS_TOKEN") {
            GraphCredentials::Static(SecretString::from(token))
        } else {
            let tenant_id = optional_var(vars, "GRAPH_TENANT_ID");
            let client_id = optional_var(vars, "GRAPH_CLIENT_ID");
            let client_secret = optional_var(vars, "GRAPH_CLIENT_SECRET");
            if tenant_id.is_none() && client_id.is_none() && client_secret.is_none() {
                return Err(ConfigError::MissingRequired {
                    key: "GRAPH_ACCESS_TOKEN".into(),
                    hint: "Set GRAPH_ACCESS_TOKEN, or GRAPH_TENANT_ID + GRAPH_CLIENT_ID + GRAPH_CLIENT_SECRET"
                        .into(),
                });
            }
            let credentials = GraphCredentials::ClientCredentials {
                tenant_id: tenant_id.ok_or_else(|| ConfigError::MissingEnvVar("GRAPH_TENANT_ID".into()))?,
                client_id: client_id.ok_or_else(|| ConfigError::MissingEnvVar("GRAPH_CLIENT_ID".into()))?,
                client_secret: SecretString::from(
                    client_secret
                        .ok_or_else(|| ConfigError::MissingEnvVar("GRAPH_CLIENT_SECRET".into()))?,
                ),
            };
            // App-only tokens have no signed-in user.
            if user.eq_ignore_ascii_case("me") {
                return Err(ConfigError::InvalidValue {
                    key: "GRAPH_USER".into(),
                    message: "client-credentials auth needs a user principal name, not 'me'".into(),
                });
            }
            credentials
        };

        Ok(Self { credentials, user })
    }

    /// Path segment addressing the mailbox owner.
    pub fn user_path(&self) -> String {
        if self.user.eq_ignore_ascii_case("me") {
            "me".to_string()
        } else {
            format!("users/{}", self.user)
        }
    }
}
