//! Graph REST calls behind the `Mailbox` trait.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{GraphConfig, TokenSource};
use crate::error::MailboxError;
use crate::llm::provider::retry_after;
use crate::pipeline::types::{BodyFormat, Mailbox, RawMessage};

const DEFAULT_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
const MESSAGE_FIELDS: &str = "id,subject,body,conversationId,receivedDateTime,sender,from,isDraft";
const THREAD_PAGE_SIZE: &str = "50";
const MAX_THREAD_PAGES: usize = 10;
/// How long a created-but-unfilled reply draft is remembered for reuse.
const PENDING_DRAFT_TTL: Duration = Duration::from_secs(60 * 60);

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    body: Option<ItemBody>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    received_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    sender: Option<Recipient>,
    #[serde(default)]
    from: Option<Recipient>,
    #[serde(default)]
    is_draft: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemBody {
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Recipient {
    #[serde(default)]
    email_address: Option<EmailAddress>,
}

#[derive(Debug, Deserialize)]
struct EmailAddress {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagePage {
    #[serde(default)]
    value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedDraft {
    id: String,
}

fn format_sender(recipient: Option<&Recipient>) -> String {
    let Some(addr) = recipient.and_then(|r| r.email_address.as_ref()) else {
        return String::new();
    };
    let name = addr.name.as_deref().map(str::trim).unwrap_or_default();
    let address = addr.address.as_deref().map(str::trim).unwrap_or_default();
    match (name.is_empty(), address.is_empty()) {
        (false, false) if name != address => format!("{name} <{address}>"),
        (_, false) => address.to_string(),
        _ => name.to_string(),
    }
}

fn to_raw_message(message: GraphMessage) -> Result<RawMessage, MailboxError> {
    let received_at = message
        .received_date_time
        .ok_or_else(|| MailboxError::InvalidResponse {
            reason: format!("message {} has no receivedDateTime", message.id),
        })?;
    let sender = format_sender(message.sender.as_ref().or(message.from.as_ref()));
    let (body, body_format) = match message.body {
        Some(body) => {
            let format = match body.content_type.as_deref() {
                Some(t) if t.eq_ignore_ascii_case("html") => BodyFormat::Html,
                _ => BodyFormat::Text,
            };
            (body.content.unwrap_or_default(), format)
        }
        None => (String::new(), BodyFormat::Text),
    };
    Ok(RawMessage {
        id: message.id,
        sender,
        subject: message.subject.unwrap_or_default(),
        body,
        body_format,
        conversation_id: message.conversation_id.filter(|c| !c.is_empty()),
        received_at,
    })
}

/// OData string literal: single quotes are doubled.
fn odata_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

// ── Mailbox ─────────────────────────────────────────────────────────

/// Mailbox backed by Microsoft Graph.
pub struct GraphMailbox {
    client: Client,
    base_url: String,
    user_path: String,
    tokens: TokenSource,
    /// Reply drafts created but not yet filled, keyed by original message id.
    pending_drafts: Mutex<HashMap<String, PendingDraft>>,
}

struct PendingDraft {
    draft_id: String,
    created: Instant,
}

impl GraphMailbox {
    pub fn new(client: Client, config: &GraphConfig) -> Self {
        Self {
            tokens: TokenSource::new(client.clone(), config.credentials.clone()),
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            user_path: config.user_path(),
            pending_drafts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_tokens(mut self, tokens: TokenSource) -> Self {
        self.tokens = tokens;
        self
    }

    fn url(&self, tail: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.user_path, tail)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, MailboxError> {
        let token = self.tokens.token().await?;
        let response = request.bearer_auth(token.expose_secret()).send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
        }
        let hint = retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        Err(MailboxError::from_status(status.as_u16(), hint, &body))
    }

    async fn create_reply(&self, message_id: &str) -> Result<String, MailboxError> {
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("messages/{message_id}/createReply")))
                    .json(&serde_json::json!({})),
            )
            .await?;
        let created: CreatedDraft = response.json().await?;
        info!(message_id = %message_id, draft_id = %created.id, "Created reply draft");
        Ok(created.id)
    }
}

#[async_trait]
impl Mailbox for GraphMailbox {
    async fn fetch_message(&self, message_id: &str) -> Result<RawMessage, MailboxError> {
        let response = self
            .send(
                self.client
                    .get(self.url(&format!("messages/{message_id}")))
                    .query(&[("$select", MESSAGE_FIELDS)]),
            )
            .await?;
        let message: GraphMessage = response.json().await?;
        debug!(message_id = %message_id, "Fetched message");
        to_raw_message(message)
    }

    async fn fetch_thread(&self, conversation_id: &str) -> Result<Vec<RawMessage>, MailboxError> {
        let filter = format!("conversationId eq {}", odata_literal(conversation_id));
        let mut request = self.client.get(self.url("messages")).query(&[
            ("$filter", filter.as_str()),
            ("$select", MESSAGE_FIELDS),
            ("$top", THREAD_PAGE_SIZE),
        ]);

        let mut messages = Vec::new();
        for page_no in 1..=MAX_THREAD_PAGES {
            let page: MessagePage = self.send(request).await?.json().await?;
            for message in page.value {
                // Our own unsent replies are not part of the conversation.
                if message.is_draft {
                    continue;
                }
                messages.push(to_raw_message(message)?);
            }
            match page.next_link {
                Some(next) if page_no < MAX_THREAD_PAGES => request = self.client.get(next),
                Some(_) => {
                    warn!(
                        conversation_id = %conversation_id,
                        pages = MAX_THREAD_PAGES,
                        "Thread truncated at page limit"
                    );
                    break;
                }
                None => break,
            }
        }

        debug!(conversation_id = %conversation_id, count = messages.len(), "Fetched thread");
        Ok(messages)
    }

    async fn save_draft(&self, message_id: &str, body: &str) -> Result<(), MailboxError> {
        let existing = {
            let mut pending = self.pending_drafts.lock().await;
            pending.retain(|_, draft| draft.created.elapsed() < PENDING_DRAFT_TTL);
            pending.get(message_id).map(|draft| draft.draft_id.clone())
        };
        let draft_id = match existing {
            Some(id) => {
                debug!(message_id = %message_id, draft_id = %id, "Reusing reply draft");
                id
            }
            None => {
                let id = self.create_reply(message_id).await?;
                self.pending_drafts.lock().await.insert(
                    message_id.to_string(),
                    PendingDraft {
                        draft_id: id.clone(),
                        created: Instant::now(),
                    },
                );
                id
            }
        };

        let patched = self
            .send(
                self.client
                    .patch(self.url(&format!("messages/{draft_id}")))
                    .json(&serde_json::json!({
                        "body": { "contentType": "Text", "content": body }
                    })),
            )
            .await;

        match patched {
            Ok(_) => {
                self.pending_drafts.lock().await.remove(message_id);
                info!(message_id = %message_id, draft_id = %draft_id, "Saved reply draft");
                Ok(())
            }
            Err(e) => {
                if !e.is_transient() {
                    self.pending_drafts.lock().await.remove(message_id);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::GraphCredentials;
    use secrecy::SecretString;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn mailbox(server: &MockServer) -> GraphMailbox {
        let config = GraphConfig {
            credentials: GraphCredentials::Static(SecretString::from("tok")),
            user: "me".into(),
        };
        GraphMailbox::new(Client::new(), &config).with_base_url(server.uri())
    }

    fn graph_message(id: &str, received: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "subject": "Quarterly numbers",
            "body": {"contentType": "html", "content": "<p>Hi</p>"},
            "conversationId": "conv-1",
            "receivedDateTime": received,
            "sender": {"emailAddress": {"name": "Alice", "address": "alice@contoso.com"}},
            "isDraft": false
        })
    }

    #[test]
    fn converts_graph_message() {
        let message: GraphMessage =
            serde_json::from_value(graph_message("m1", "2026-03-01T09:30:00Z")).unwrap();
        let raw = to_raw_message(message).unwrap();
        assert_eq!(raw.sender, "Alice <alice@contoso.com>");
        assert_eq!(raw.body_format, BodyFormat::Html);
        assert_eq!(raw.conversation_id.as_deref(), Some("conv-1"));
        assert_eq!(raw.received_at.to_rfc3339(), "2026-03-01T09:30:00+00:00");
    }

    #[test]
    fn missing_received_time_is_invalid_response() {
        let message: GraphMessage = serde_json::from_value(serde_json::json!({"id": "m1"})).unwrap();
        assert!(matches!(
            to_raw_message(message),
            Err(MailboxError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn sender_falls_back_to_address_or_name() {
        let only_address: Recipient = serde_json::from_value(
            serde_json::json!({"emailAddress": {"address": "bob@contoso.com"}}),
        )
        .unwrap();
        assert_eq!(format_sender(Some(&only_address)), "bob@contoso.com");
        assert_eq!(format_sender(None), "");
    }

    #[test]
    fn odata_literal_escapes_quotes() {
        assert_eq!(odata_literal("it's"), "'it''s'");
    }

    #[tokio::test]
    async fn fetch_message_selects_fields_and_sends_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me/messages/m1"))
            .and(query_param("$select", MESSAGE_FIELDS))
            .and(header("authorization", "Bearer tok"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(graph_message("m1", "2026-03-01T09:30:00Z")),
            )
            .mount(&server)
            .await;

        let raw = mailbox(&server).fetch_message("m1").await.unwrap();
        assert_eq!(raw.id, "m1");
        assert_eq!(raw.subject, "Quarterly numbers");
    }

    #[tokio::test]
    async fn fetch_message_maps_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("ErrorItemNotFound"))
            .mount(&server)
            .await;
        let err = mailbox(&server).fetch_message("gone").await.unwrap_err();
        assert!(matches!(err, MailboxError::NotFound { .. }));

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "3"))
            .mount(&server)
            .await;
        let err = mailbox(&server).fetch_message("m1").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.retry_after(), Some(std::time::Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn fetch_thread_follows_next_link_and_skips_drafts() {
        let server = MockServer::start().await;
        let mut draft = graph_message("d1", "2026-03-01T11:00:00Z");
        draft["isDraft"] = serde_json::Value::Bool(true);

        Mock::given(method("GET"))
            .and(path("/me/messages"))
            .and(query_param("$filter", "conversationId eq 'conv-1'"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [graph_message("m1", "2026-03-01T09:00:00Z"), draft],
                "@odata.nextLink": format!("{}/me/messages/page2", server.uri())
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/me/messages/page2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [graph_message("m2", "2026-03-01T10:00:00Z")]
            })))
            .mount(&server)
            .await;

        let thread = mailbox(&server).fetch_thread("conv-1").await.unwrap();
        let ids: Vec<&str> = thread.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn save_draft_creates_reply_then_patches_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/me/messages/m1/createReply"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": "draft-9"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/me/messages/draft-9"))
            .and(body_partial_json(serde_json::json!({
                "body": {"contentType": "Text", "content": "Thanks, will do."}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "draft-9"})))
            .expect(1)
            .mount(&server)
            .await;

        mailbox(&server)
            .save_draft("m1", "Thanks, will do.")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn retried_save_reuses_the_created_draft() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/me/messages/m1/createReply"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": "draft-9"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/me/messages/draft-9"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/me/messages/draft-9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "draft-9"})))
            .mount(&server)
            .await;

        let mailbox = mailbox(&server);
        let first = mailbox.save_draft("m1", "body").await.unwrap_err();
        assert!(first.is_transient());
        mailbox.save_draft("m1", "body").await.unwrap();
        assert!(mailbox.pending_drafts.lock().await.is_empty());
    }

    #[tokio::test]
    async fn permanent_patch_failure_forgets_the_draft() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/me/messages/m1/createReply"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": "draft-9"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/me/messages/draft-9"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let mailbox = mailbox(&server);
        let err = mailbox.save_draft("m1", "body").await.unwrap_err();
        assert!(!err.is_transient());
        assert!(mailbox.pending_drafts.lock().await.is_empty());
    }

    #[tokio::test]
    async fn expired_pending_drafts_are_pruned() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/me/messages/m1/createReply"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": "draft-1"})))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/me/messages/draft-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "draft-1"})))
            .mount(&server)
            .await;

        let mailbox = mailbox(&server);
        let Some(long_ago) = Instant::now().checked_sub(PENDING_DRAFT_TTL + Duration::from_secs(1))
        else {
            // Monotonic clock too close to its origin to backdate an entry.
            return;
        };
        mailbox.pending_drafts.lock().await.insert(
            "abandoned".into(),
            PendingDraft {
                draft_id: "draft-old".into(),
                created: long_ago,
            },
        );

        mailbox.save_draft("m1", "body").await.unwrap();
        assert!(mailbox.pending_drafts.lock().await.is_empty());
    }
}
