//! Shared types for the email processing pipeline.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LlmError, MailboxError};

// ── Notification event ──────────────────────────────────────────────

/// Kind of change a provider notification reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
    Other(String),
}

impl ChangeType {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "updated" => Self::Updated,
            "deleted" => Self::Deleted,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Updated => write!(f, "updated"),
            Self::Deleted => write!(f, "deleted"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Inbound change notification for one message. Immutable once received.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// Provider-assigned subscription id.
    pub subscription_id: String,
    /// Message id the notification refers to.
    pub message_id: String,
    /// What happened to the message.
    pub change_type: ChangeType,
    /// When the notification reached us.
    pub received_at: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn created(subscription_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            message_id: message_id.into(),
            change_type: ChangeType::Created,
            received_at: Utc::now(),
        }
    }
}

// ── Messages ────────────────────────────────────────────────────────

/// Format of a message body as delivered by the mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyFormat {
    Text,
    Html,
}

/// A message exactly as the mailbox returned it, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub body_format: BodyFormat,
    /// Thread id; `None` when the provider does not group the message.
    pub conversation_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// A normalized message. Only `normalize::normalize_message` builds these,
/// so `body` is always plain text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub sender: String,
    pub subject: String,
    /// Plain text, markup and quoted history removed.
    pub body: String,
    pub conversation_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl MessageRecord {
    /// True when there is nothing to read.
    pub fn is_blank(&self) -> bool {
        self.subject.trim().is_empty() && self.body.trim().is_empty()
    }
}

/// Prior messages of a thread plus a bounded summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    /// Oldest first.
    pub messages: Vec<MessageRecord>,
    /// Condensed summary; empty when there are no prior messages.
    pub summary: String,
}

impl ConversationContext {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

// ── Classification ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Actionable,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl ClassificationResult {
    pub fn actionable(rationale: Option<String>) -> Self {
        Self {
            verdict: Verdict::Actionable,
            rationale,
        }
    }

    pub fn skip(rationale: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Skip,
            rationale: Some(rationale.into()),
        }
    }

    pub fn is_actionable(&self) -> bool {
        self.verdict == Verdict::Actionable
    }
}

// ── Drafts and review ───────────────────────────────────────────────

/// Verdict of the most recent critique of a draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ReviewVerdict {
    Pending,
    Approved,
    Rejected { feedback: String },
}

impl ReviewVerdict {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected { .. } => "rejected",
        }
    }
}

/// A reply body awaiting review or persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftCandidate {
    pub body: String,
    /// 0 for the first draft, +1 per redraft.
    pub revision: u32,
    pub verdict: ReviewVerdict,
}

/// What the generator needs to revise a rejected draft.
#[derive(Debug, Clone, Copy)]
pub struct RevisionRequest<'a> {
    pub previous_draft: &'a str,
    pub feedback: &'a str,
}

// ── Run state machine ───────────────────────────────────────────────

/// Stage of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Admitted,
    Normalized,
    Classified,
    Skipped,
    ContextBuilt,
    Drafting,
    Reviewing,
    Saving,
    Saved,
    Failed,
}

impl Stage {
    /// Check if this stage may be followed by `target`.
    pub fn can_transition_to(&self, target: Stage) -> bool {
        use Stage::*;

        matches!(
            (self, target),
            (Received, Admitted)
                | (Admitted, Normalized)
                | (Admitted, Failed)
                | (Normalized, Classified)
                | (Normalized, Failed)
                | (Classified, Skipped)
                | (Classified, ContextBuilt)
                | (Classified, Failed)
                | (ContextBuilt, Drafting)
                | (Drafting, Reviewing)
                | (Drafting, Failed)
                | (Reviewing, Drafting)
                | (Reviewing, Saving)
                | (Reviewing, Failed)
                | (Saving, Saved)
                | (Saving, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Skipped | Self::Saved | Self::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::Admitted => "admitted",
            Self::Normalized => "normalized",
            Self::Classified => "classified",
            Self::Skipped => "skipped",
            Self::ContextBuilt => "context_built",
            Self::Drafting => "drafting",
            Self::Reviewing => "reviewing",
            Self::Saving => "saving",
            Self::Saved => "saved",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Why a run ended in `FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    MessageUnavailable,
    ClassificationUnavailable,
    ContextUnavailable,
    GenerationUnavailable,
    ReviewUnavailable,
    SaveFailed,
    ReviewExhausted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageUnavailable => "MESSAGE_UNAVAILABLE",
            Self::ClassificationUnavailable => "CLASSIFICATION_UNAVAILABLE",
            Self::ContextUnavailable => "CONTEXT_UNAVAILABLE",
            Self::GenerationUnavailable => "GENERATION_UNAVAILABLE",
            Self::ReviewUnavailable => "REVIEW_UNAVAILABLE",
            Self::SaveFailed => "SAVE_FAILED",
            Self::ReviewExhausted => "REVIEW_EXHAUSTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            Self::MessageUnavailable,
            Self::ClassificationUnavailable,
            Self::ContextUnavailable,
            Self::GenerationUnavailable,
            Self::ReviewUnavailable,
            Self::SaveFailed,
            Self::ReviewExhausted,
        ]
        .into_iter()
        .find(|k| k.as_str() == s)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    Skipped,
    DraftSaved,
    /// Review loop exhausted; the last candidate was saved anyway.
    DraftSavedUnreviewed,
    Failed(FailureKind),
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::DraftSaved => "draft_saved",
            Self::DraftSavedUnreviewed => "draft_saved_unreviewed",
            Self::Failed(_) => "failed",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(kind) => write!(f, "FAILED:{kind}"),
            other => f.write_str(&other.label().to_ascii_uppercase()),
        }
    }
}

/// A recorded stage change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTransition {
    pub from: Stage,
    pub to: Stage,
    pub timestamp: DateTime<Utc>,
}

/// Unit of work for one admitted message id.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub message_id: String,
    pub stage: Stage,
    /// Attempts spent per external-call stage.
    pub attempts: BTreeMap<Stage, u32>,
    /// Number of drafts generated.
    pub drafts_generated: u32,
    pub outcome: Option<RunOutcome>,
    pub transitions: Vec<StageTransition>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            message_id: message_id.into(),
            stage: Stage::Received,
            attempts: BTreeMap::new(),
            drafts_generated: 0,
            outcome: None,
            transitions: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Move to the next stage. Stages are entered in a fixed order; an
    /// out-of-order transition is a bug in the orchestrator.
    pub fn enter(&mut self, next: Stage) {
        debug_assert!(
            self.stage.can_transition_to(next),
            "invalid stage transition {} -> {}",
            self.stage,
            next
        );
        tracing::debug!(
            run_id = %self.run_id,
            message_id = %self.message_id,
            from = %self.stage,
            to = %next,
            "Stage transition"
        );
        self.transitions.push(StageTransition {
            from: self.stage,
            to: next,
            timestamp: Utc::now(),
        });
        self.stage = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
    }

    /// Add attempts spent on `stage`.
    pub fn record_attempts(&mut self, stage: Stage, attempts: u32) {
        *self.attempts.entry(stage).or_insert(0) += attempts;
    }

    pub fn attempts_for(&self, stage: Stage) -> u32 {
        self.attempts.get(&stage).copied().unwrap_or(0)
    }

    /// Enter the terminal stage matching `outcome`.
    pub fn finish(&mut self, outcome: RunOutcome) {
        let terminal = match outcome {
            RunOutcome::Skipped => Stage::Skipped,
            RunOutcome::DraftSaved | RunOutcome::DraftSavedUnreviewed => Stage::Saved,
            RunOutcome::Failed(_) => Stage::Failed,
        };
        self.enter(terminal);
        self.outcome = Some(outcome);
    }

    /// Whether a stage was ever entered during this run.
    pub fn visited(&self, stage: Stage) -> bool {
        self.transitions.iter().any(|t| t.to == stage)
    }
}

// ── Collaborator traits ─────────────────────────────────────────────

/// Mailbox provider: pure I/O, no business logic.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Fetch one message by id.
    async fn fetch_message(&self, message_id: &str) -> Result<RawMessage, MailboxError>;

    /// Fetch every message of a conversation, in any order.
    async fn fetch_thread(&self, conversation_id: &str) -> Result<Vec<RawMessage>, MailboxError>;

    /// Store `body` as a draft reply to `message_id`. Never sends.
    async fn save_draft(&self, message_id: &str, body: &str) -> Result<(), MailboxError>;
}

/// Language model capabilities used by the pipeline.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Decide whether a normalized message warrants a reply.
    async fn classify(&self, message: &MessageRecord) -> Result<ClassificationResult, LlmError>;

    /// Condense prior thread messages (oldest first) into a short summary.
    async fn summarize(&self, thread: &[MessageRecord]) -> Result<String, LlmError>;

    /// Write a reply body. `revision` carries the rejected draft and the
    /// reviewer's feedback when redrafting.
    async fn draft(
        &self,
        message: &MessageRecord,
        context: &ConversationContext,
        revision: Option<RevisionRequest<'_>>,
    ) -> Result<String, LlmError>;

    /// Approve a draft or reject it with actionable feedback.
    async fn critique(
        &self,
        message: &MessageRecord,
        draft: &str,
    ) -> Result<ReviewVerdict, LlmError>;
}

/// Lazy, effectively infinite sequence of notification events.
///
/// Delivery is at-least-once; `None` means the source has shut down.
#[async_trait]
pub trait NotificationSource: Send {
    async fn next(&mut self) -> Option<NotificationEvent>;
}
