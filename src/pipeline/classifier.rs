//! Classifier: decides whether a normalized message warrants a reply.
//!
//! Deterministic rules run first and short-circuit obvious non-actionable
//! mail (automated senders, bulk footers, blank messages). Everything else
//! goes to the language model.

use std::sync::Arc;

use regex::Regex;
use tracing::debug;

use crate::error::LlmError;
use crate::pipeline::types::{ClassificationResult, LanguageModel, MessageRecord};

/// Which field a rule matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleField {
    Sender,
    Subject,
    Body,
}

/// A rule that marks a message as SKIP without asking the model.
#[derive(Debug, Clone)]
pub struct SkipRule {
    pub regex: Regex,
    pub field: RuleField,
    /// Rationale recorded on the classification.
    pub reason: String,
}

impl SkipRule {
    pub fn new(pattern: &str, field: RuleField, reason: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
            field,
            reason: reason.to_string(),
        })
    }

    fn matches(&self, message: &MessageRecord) -> bool {
        let value = match self.field {
            RuleField::Sender => &message.sender,
            RuleField::Subject => &message.subject,
            RuleField::Body => &message.body,
        };
        self.regex.is_match(value)
    }
}

fn default_rules() -> Result<Vec<SkipRule>, regex::Error> {
    Ok(vec![
        SkipRule::new(
            r"(?i)(^|<|\s)no[\-_.]?reply@",
            RuleField::Sender,
            "noreply sender",
        )?,
        SkipRule::new(
            r"(?i)(^|<|\s)(mailer[\-_]?daemon|postmaster)@",
            RuleField::Sender,
            "automated mail system",
        )?,
        SkipRule::new(
            r"(?i)\bunsubscribe\b",
            RuleField::Subject,
            "bulk mail (unsubscribe in subject)",
        )?,
        SkipRule::new(
            r"(?i)(\bunsubscribe\b|\bmanage your subscription\b|\b(update|manage|change) your email preferences\b|\bopt[- ]?out of (these|future|all|our) (e-?mails?|mailings?|messages|communications)\b)",
            RuleField::Body,
            "bulk mail (unsubscribe footer)",
        )?,
    ])
}

/// Rules fast path plus model classification.
pub struct Classifier {
    llm: Arc<dyn LanguageModel>,
    rules: Vec<SkipRule>,
}

impl Classifier {
    /// Classifier with the built-in skip rules.
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        // The built-in patterns are literals; failing to compile one is a
        // programming error caught by the unit tests.
        let rules = default_rules().unwrap_or_default();
        Self { llm, rules }
    }

    /// Classifier that always asks the model (except for blank messages).
    pub fn without_rules(llm: Arc<dyn LanguageModel>) -> Self {
        Self {
            llm,
            rules: Vec::new(),
        }
    }

    pub fn add_rule(&mut self, rule: SkipRule) {
        self.rules.push(rule);
    }

    /// Evaluate the deterministic rules. `None` means "ask the model".
    pub fn evaluate_rules(&self, message: &MessageRecord) -> Option<ClassificationResult> {
        if message.is_blank() {
            return Some(ClassificationResult::skip("empty subject and body"));
        }

        self.rules.iter().find(|r| r.matches(message)).map(|rule| {
            debug!(
                message_id = %message.id,
                sender = %message.sender,
                reason = %rule.reason,
                "Skip rule matched"
            );
            ClassificationResult::skip(rule.reason.clone())
        })
    }

    /// Classify a normalized message.
    pub async fn classify(&self, message: &MessageRecord) -> Result<ClassificationResult, LlmError> {
        if let Some(result) = self.evaluate_rules(message) {
            return Ok(result);
        }
        self.llm.classify(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{ConversationContext, ReviewVerdict, RevisionRequest};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingModel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LanguageModel for CountingModel {
        async fn classify(&self, _m: &MessageRecord) -> Result<ClassificationResult, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ClassificationResult::actionable(Some("question".into())))
        }
        async fn summarize(&self, _t: &[MessageRecord]) -> Result<String, LlmError> {
            unreachable!()
        }
        async fn draft(
            &self,
            _m: &MessageRecord,
            _c: &ConversationContext,
            _r: Option<RevisionRequest<'_>>,
        ) -> Result<String, LlmError> {
            unreachable!()
        }
        async fn critique(&self, _m: &MessageRecord, _d: &str) -> Result<ReviewVerdict, LlmError> {
            unreachable!()
        }
    }

    fn model() -> Arc<CountingModel> {
        Arc::new(CountingModel {
            calls: AtomicUsize::new(0),
        })
    }

    fn msg(sender: &str, subject: &str, body: &str) -> MessageRecord {
        MessageRecord {
            id: "m1".into(),
            sender: sender.into(),
            subject: subject.into(),
            body: body.into(),
            conversation_id: None,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn default_rules_compile() {
        assert!(default_rules().is_ok());
    }

    #[tokio::test]
    async fn noreply_sender_skipped_without_model_call() {
        let llm = model();
        let classifier = Classifier::new(llm.clone());
        let result = classifier
            .classify(&msg("no-reply@shop.com", "Your order", "Thanks"))
            .await
            .unwrap();
        assert!(!result.is_actionable());
        assert_eq!(result.rationale.as_deref(), Some("noreply sender"));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn bulk_footer_skipped() {
        let classifier = Classifier::new(model());
        let result = classifier
            .classify(&msg(
                "news@store.com",
                "Deals",
                "Big sale!\nManage your subscription here",
            ))
            .await
            .unwrap();
        assert!(!result.is_actionable());
    }

    #[tokio::test]
    async fn footer_phrases_need_whole_words() {
        let llm = model();
        let classifier = Classifier::new(llm.clone());
        for body in [
            "Should we adopt Outlook rules for the team? Please reply by Friday.",
            "Can you check the email preferences page in the admin console?",
            "I'd like to opt out of the offsite, is that fine?",
        ] {
            let message = msg("alice@example.com", "Question", body);
            assert_eq!(classifier.evaluate_rules(&message), None, "{body}");
        }

        let result = classifier
            .classify(&msg(
                "alice@example.com",
                "Question",
                "Should we adopt Outlook rules for the team? Please reply by Friday.",
            ))
            .await
            .unwrap();
        assert!(result.is_actionable());
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn footer_phrases_still_match_bulk_mail() {
        let classifier = Classifier::new(model());
        for body in [
            "Big sale!\nTo opt-out of future emails, click below.",
            "You received this because you signed up. Update your email preferences.",
            "Unsubscribe | Privacy",
        ] {
            let message = msg("news@store.com", "Deals", body);
            assert!(classifier.evaluate_rules(&message).is_some(), "{body}");
        }
    }

    #[tokio::test]
    async fn blank_message_skipped_even_without_rules() {
        let llm = model();
        let classifier = Classifier::without_rules(llm.clone());
        let result = classifier.classify(&msg("a@b.com", "", "  ")).await.unwrap();
        assert!(!result.is_actionable());
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ordinary_mail_goes_to_model() {
        let llm = model();
        let classifier = Classifier::new(llm.clone());
        let result = classifier
            .classify(&msg("alice@example.com", "Lunch?", "Free on Friday?"))
            .await
            .unwrap();
        assert!(result.is_actionable());
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn custom_rule_applies() {
        let llm = model();
        let mut classifier = Classifier::without_rules(llm.clone());
        classifier.add_rule(
            SkipRule::new(r"(?i)@github\.com$", RuleField::Sender, "GitHub notification").unwrap(),
        );
        let result = classifier
            .classify(&msg("notifications@github.com", "PR merged", "Merged #12"))
            .await
            .unwrap();
        assert_eq!(result.rationale.as_deref(), Some("GitHub notification"));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }
}
