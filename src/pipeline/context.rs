//! Context assembler: the prior messages of a thread plus a bounded summary.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::error::ExternalError;
use crate::normalize::{normalize_message, truncate_chars};
use crate::pipeline::types::{ConversationContext, LanguageModel, Mailbox, MessageRecord};

pub struct ContextAssembler {
    mailbox: Arc<dyn Mailbox>,
    llm: Arc<dyn LanguageModel>,
    summary_max_chars: usize,
}

impl ContextAssembler {
    pub fn new(
        mailbox: Arc<dyn Mailbox>,
        llm: Arc<dyn LanguageModel>,
        summary_max_chars: usize,
    ) -> Self {
        Self {
            mailbox,
            llm,
            summary_max_chars,
        }
    }

    /// Build the conversation context for `message`.
    ///
    /// Prior messages are the other messages of the thread received no
    /// later than `message`, oldest first. With no prior messages the
    /// context is empty and the model is not called. Any failure fails the
    /// whole call; a partial context is never returned.
    pub async fn assemble(&self, message: &MessageRecord) -> Result<ConversationContext, ExternalError> {
        let Some(conversation_id) = message.conversation_id.as_deref() else {
            return Ok(ConversationContext::empty());
        };

        let thread = self.mailbox.fetch_thread(conversation_id).await?;

        let mut seen = HashSet::new();
        let mut prior: Vec<MessageRecord> = thread
            .into_iter()
            .filter(|m| m.id != message.id && m.received_at <= message.received_at)
            .filter(|m| seen.insert(m.id.clone()))
            .map(normalize_message)
            .collect();
        prior.sort_by_key(|m| m.received_at);

        if prior.is_empty() {
            return Ok(ConversationContext::empty());
        }

        let summary = self.llm.summarize(&prior).await?;
        let summary = truncate_chars(summary.trim(), self.summary_max_chars);

        debug!(
            message_id = %message.id,
            prior_messages = prior.len(),
            summary_chars = summary.chars().count(),
            "Context assembled"
        );

        Ok(ConversationContext {
            messages: prior,
            summary,
        })
    }
}
