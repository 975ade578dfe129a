//! `LanguageModel` implementation on top of any `LlmProvider`.
//!
//! Classification and critique ask for a small JSON object; summary and
//! draft are free text. Every prompt input is bounded.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::error::LlmError;
use crate::normalize::truncate_chars;
use crate::pipeline::types::{
    ClassificationResult, ConversationContext, LanguageModel, MessageRecord, ReviewVerdict,
    RevisionRequest, Verdict,
};

/// Max characters of a message body put into a prompt.
const MAX_BODY_CHARS: usize = 6000;
/// Max characters of each prior thread message given to the summarizer.
const MAX_THREAD_ENTRY_CHARS: usize = 1500;
/// Only the most recent thread messages are summarized.
const MAX_THREAD_ENTRIES: usize = 20;

const CLASSIFY_TEMPERATURE: f32 = 0.0;
const CLASSIFY_MAX_TOKENS: u32 = 300;
const SUMMARY_TEMPERATURE: f32 = 0.2;
const SUMMARY_MAX_TOKENS: u32 = 600;
const DRAFT_TEMPERATURE: f32 = 0.5;
const DRAFT_MAX_TOKENS: u32 = 1024;
const CRITIQUE_TEMPERATURE: f32 = 0.0;
const CRITIQUE_MAX_TOKENS: u32 = 400;

/// Prompted language model.
pub struct LlmAssistant {
    llm: Arc<dyn LlmProvider>,
}

impl LlmAssistant {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    async fn ask(&self, system: String, user: String, temperature: f32, max_tokens: u32) -> Result<String, LlmError> {
        let request = CompletionRequest::new(vec![ChatMessage::system(system), ChatMessage::user(user)])
            .with_temperature(temperature)
            .with_max_tokens(max_tokens);
        let response = self.llm.complete(request).await?;
        debug!(
            model = self.llm.model_name(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "LLM call complete"
        );
        Ok(response.content)
    }

    fn invalid(&self, reason: impl Into<String>) -> LlmError {
        LlmError::InvalidResponse {
            provider: self.llm.model_name().to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl LanguageModel for LlmAssistant {
    async fn classify(&self, message: &MessageRecord) -> Result<ClassificationResult, LlmError> {
        let raw = self
            .ask(
                build_classify_system_prompt(),
                build_message_prompt(message),
                CLASSIFY_TEMPERATURE,
                CLASSIFY_MAX_TOKENS,
            )
            .await?;
        parse_classification(&raw).inspect_err(|e| {
            warn!(raw_response = %raw, error = %e, "Failed to parse classification");
        })
    }

    async fn summarize(&self, thread: &[MessageRecord]) -> Result<String, LlmError> {
        let raw = self
            .ask(
                build_summary_system_prompt(),
                build_thread_prompt(thread),
                SUMMARY_TEMPERATURE,
                SUMMARY_MAX_TOKENS,
            )
            .await?;
        let summary = raw.trim();
        if summary.is_empty() {
            return Err(self.invalid("empty thread summary"));
        }
        Ok(summary.to_string())
    }

    async fn draft(
        &self,
        message: &MessageRecord,
        context: &ConversationContext,
        revision: Option<RevisionRequest<'_>>,
    ) -> Result<String, LlmError> {
        let raw = self
            .ask(
                build_draft_system_prompt(),
                build_draft_user_prompt(message, context, revision),
                DRAFT_TEMPERATURE,
                DRAFT_MAX_TOKENS,
            )
            .await?;
        let draft = raw.trim();
        if draft.is_empty() {
            return Err(self.invalid("empty draft"));
        }
        Ok(draft.to_string())
    }

    async fn critique(&self, message: &MessageRecord, draft: &str) -> Result<ReviewVerdict, LlmError> {
        let user = format!(
            "{}\n\n## Draft reply\n{}",
            build_message_prompt(message),
            truncate_chars(draft, MAX_BODY_CHARS)
        );
        let raw = self
            .ask(
                build_critique_system_prompt(),
                user,
                CRITIQUE_TEMPERATURE,
                CRITIQUE_MAX_TOKENS,
            )
            .await?;
        parse_critique(&raw).inspect_err(|e| {
            warn!(raw_response = %raw, error = %e, "Failed to parse critique");
        })
    }
}

// ── Prompts ─────────────────────────────────────────────────────────

fn build_classify_system_prompt() -> String {
    r#"You decide whether an incoming email needs a reply from the mailbox owner.

Answer ACTIONABLE for:
- business or personal messages addressed to the owner
- questions and requests for information or action
- follow-ups on ongoing conversations or projects
- notifications that ask for an acknowledgement

Answer SKIP for:
- promotions, marketing, sales pitches and advertisements
- newsletters and subscriptions
- spam or suspicious content
- automated notifications that need no action
- mass mail not addressed to the owner personally

Look at both the subject and the body.

Respond with ONLY a JSON object:
{"verdict": "ACTIONABLE" | "SKIP", "rationale": "<one short sentence>"}"#
        .to_string()
}

fn build_summary_system_prompt() -> String {
    "You condense an email thread for someone about to reply to its latest message. \
     Summarize the earlier messages below in a few sentences: who said what, open questions, \
     commitments and dates. Plain text, no headings, no quotes."
        .to_string()
}

fn build_draft_system_prompt() -> String {
    r#"You draft replies to emails on behalf of the mailbox owner.

Guidelines:
- professional, courteous and helpful
- address every question and request in the email
- concise, clear structure, no filler
- match the formality of the sender
- no subject line, no email headers, no signature block
- start directly with the body of the reply
- be specific; if something cannot be answered, say so and propose a follow-up

When a previous draft and reviewer feedback are given, revise that draft so it
addresses the feedback.

Output only the reply text."#
        .to_string()
}

fn build_critique_system_prompt() -> String {
    r#"You proofread a draft reply before it is stored for the mailbox owner.

APPROVE the draft only if it:
- directly addresses the content and questions of the original email
- is professional and courteous in tone
- is free of major grammar or spelling errors
- is coherent, complete and easy to follow
- makes no claims that are unsupported by the email

Otherwise REJECT it and say concretely what to change.

Respond with ONLY a JSON object:
{"verdict": "APPROVED" | "REJECTED", "feedback": "<what to fix, empty when approved>"}"#
        .to_string()
}

fn build_message_prompt(message: &MessageRecord) -> String {
    format!(
        "## Email\nFrom: {}\nSubject: {}\n\n{}",
        message.sender,
        message.subject,
        truncate_chars(&message.body, MAX_BODY_CHARS)
    )
}

fn build_thread_prompt(thread: &[MessageRecord]) -> String {
    let skip = thread.len().saturating_sub(MAX_THREAD_ENTRIES);
    let mut prompt = String::from("## Earlier messages (oldest first)\n");
    for (i, m) in thread.iter().skip(skip).enumerate() {
        prompt.push_str(&format!(
            "\n### {}. {} ({})\n{}\n",
            i + 1,
            m.sender,
            m.received_at.format("%Y-%m-%d %H:%M UTC"),
            truncate_chars(&m.body, MAX_THREAD_ENTRY_CHARS)
        ));
    }
    prompt
}

fn build_draft_user_prompt(
    message: &MessageRecord,
    context: &ConversationContext,
    revision: Option<RevisionRequest<'_>>,
) -> String {
    let mut prompt = String::new();
    if !context.summary.is_empty() {
        prompt.push_str("## Thread so far\n");
        prompt.push_str(&context.summary);
        prompt.push_str("\n\n");
    }
    prompt.push_str(&build_message_prompt(message));
    if let Some(revision) = revision {
        prompt.push_str("\n\n## Previous draft\n");
        prompt.push_str(revision.previous_draft);
        prompt.push_str("\n\n## Reviewer feedback\n");
        prompt.push_str(revision.feedback);
        prompt.push_str("\n\nRewrite the draft so that it addresses the feedback.");
    } else {
        prompt.push_str("\n\nWrite the reply.");
    }
    prompt
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawVerdict {
    verdict: String,
    #[serde(default, alias = "reason")]
    rationale: Option<String>,
    #[serde(default)]
    feedback: Option<String>,
}

fn parse_classification(response: &str) -> Result<ClassificationResult, LlmError> {
    let raw: RawVerdict = serde_json::from_str(&extract_json_object(response))?;
    let rationale = raw.rationale.filter(|r| !r.trim().is_empty());
    let verdict = match raw.verdict.trim().to_ascii_uppercase().as_str() {
        "ACTIONABLE" | "RESPOND" => Verdict::Actionable,
        "SKIP" => Verdict::Skip,
        other => {
            return Err(LlmError::InvalidResponse {
                provider: "classifier".into(),
                reason: format!("unknown verdict '{other}'"),
            });
        }
    };
    Ok(ClassificationResult { verdict, rationale })
}

fn parse_critique(response: &str) -> Result<ReviewVerdict, LlmError> {
    let raw: RawVerdict = serde_json::from_str(&extract_json_object(response))?;
    match raw.verdict.trim().to_ascii_uppercase().as_str() {
        "APPROVED" | "APPROVE" | "SENDABLE" => Ok(ReviewVerdict::Approved),
        "REJECTED" | "REJECT" | "SKIP" => Ok(ReviewVerdict::Rejected {
            feedback: raw
                .feedback
                .or(raw.rationale)
                .unwrap_or_default()
                .trim()
                .to_string(),
        }),
        other => Err(LlmError::InvalidResponse {
            provider: "reviewer".into(),
            reason: format!("unknown verdict '{other}'"),
        }),
    }
}

/// Pull a JSON object out of a model reply that may wrap it in a markdown
/// fence or surrounding prose.
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
