//! Draft generator and reviewer.
//!
//! The generator turns a message plus context into a `DraftCandidate`,
//! revising the previous candidate when the reviewer rejected it. The
//! reviewer approves a candidate or rejects it with feedback.

use std::sync::Arc;

use crate::error::LlmError;
use crate::pipeline::types::{
    ConversationContext, DraftCandidate, LanguageModel, MessageRecord, ReviewVerdict,
    RevisionRequest,
};

/// Feedback used when the model rejects a draft without saying why.
const GENERIC_FEEDBACK: &str =
    "Answer the sender's request directly and keep the reply short and polite.";

pub struct DraftGenerator {
    llm: Arc<dyn LanguageModel>,
}

impl DraftGenerator {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self { llm }
    }

    /// Generate a candidate. With `rejected` set, the model revises that
    /// candidate using its feedback and the revision counter moves up by one.
    pub async fn generate(
        &self,
        message: &MessageRecord,
        context: &ConversationContext,
        rejected: Option<&DraftCandidate>,
    ) -> Result<DraftCandidate, LlmError> {
        let revision = rejected.map_or(0, |d| d.revision + 1);
        let request = rejected.map(|d| RevisionRequest {
            previous_draft: &d.body,
            feedback: match &d.verdict {
                ReviewVerdict::Rejected { feedback } => feedback.as_str(),
                _ => GENERIC_FEEDBACK,
            },
        });

        let body = self.llm.draft(message, context, request).await?;
        let body = body.trim();
        if body.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: "drafter".into(),
                reason: "model returned an empty draft".into(),
            });
        }

        Ok(DraftCandidate {
            body: body.to_string(),
            revision,
            verdict: ReviewVerdict::Pending,
        })
    }
}

pub struct Reviewer {
    llm: Arc<dyn LanguageModel>,
}

impl Reviewer {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self { llm }
    }

    /// Critique a candidate. Never returns `Pending`.
    pub async fn review(
        &self,
        message: &MessageRecord,
        candidate: &DraftCandidate,
    ) -> Result<ReviewVerdict, LlmError> {
        match self.llm.critique(message, &candidate.body).await? {
            ReviewVerdict::Pending => Err(LlmError::InvalidResponse {
                provider: "reviewer".into(),
                reason: "critique returned no verdict".into(),
            }),
            ReviewVerdict::Rejected { feedback } if feedback.trim().is_empty() => {
                Ok(ReviewVerdict::Rejected {
                    feedback: GENERIC_FEEDBACK.to_string(),
                })
            }
            verdict => Ok(verdict),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::ClassificationResult;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    /// Echoes the feedback it was given, and returns a scripted verdict.
    struct EchoModel {
        verdict: ReviewVerdict,
        seen_feedback: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl LanguageModel for EchoModel {
        async fn classify(&self, _m: &MessageRecord) -> Result<ClassificationResult, LlmError> {
            unreachable!()
        }
        async fn summarize(&self, _t: &[MessageRecord]) -> Result<String, LlmError> {
            unreachable!()
        }
        async fn draft(
            &self,
            _m: &MessageRecord,
            _c: &ConversationContext,
            revision: Option<RevisionRequest<'_>>,
        ) -> Result<String, LlmError> {
            let feedback = revision.map(|r| r.feedback.to_string());
            self.seen_feedback.lock().unwrap().push(feedback.clone());
            Ok(match feedback {
                Some(f) => format!("  Revised: {f}  "),
                None => "Hi Alice, Friday works.".to_string(),
            })
        }
        async fn critique(&self, _m: &MessageRecord, _d: &str) -> Result<ReviewVerdict, LlmError> {
            Ok(self.verdict.clone())
        }
    }

    fn model(verdict: ReviewVerdict) -> Arc<EchoModel> {
        Arc::new(EchoModel {
            verdict,
            seen_feedback: Mutex::new(Vec::new()),
        })
    }

    fn msg() -> MessageRecord {
        MessageRecord {
            id: "m1".into(),
            sender: "alice@example.com".into(),
            subject: "Friday".into(),
            body: "Can we meet Friday?".into(),
            conversation_id: None,
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn first_draft_is_revision_zero_and_pending() {
        let generator = DraftGenerator::new(model(ReviewVerdict::Approved));
        let draft = generator
            .generate(&msg(), &ConversationContext::empty(), None)
            .await
            .unwrap();
        assert_eq!(draft.revision, 0);
        assert_eq!(draft.verdict, ReviewVerdict::Pending);
        assert_eq!(draft.body, "Hi Alice, Friday works.");
    }

    #[tokio::test]
    async fn redraft_increments_revision_and_uses_feedback() {
        let llm = model(ReviewVerdict::Approved);
        let generator = DraftGenerator::new(llm.clone());
        let rejected = DraftCandidate {
            body: "ok".into(),
            revision: 1,
            verdict: ReviewVerdict::Rejected {
                feedback: "mention the time".into(),
            },
        };
        let draft = generator
            .generate(&msg(), &ConversationContext::empty(), Some(&rejected))
            .await
            .unwrap();
        assert_eq!(draft.revision, 2);
        assert_eq!(draft.body, "Revised: mention the time");
        assert_eq!(
            llm.seen_feedback.lock().unwrap().as_slice(),
            &[Some("mention the time".to_string())]
        );
    }

    #[tokio::test]
    async fn reviewer_fills_in_missing_feedback() {
        let reviewer = Reviewer::new(model(ReviewVerdict::Rejected {
            feedback: "  ".into(),
        }));
        let candidate = DraftCandidate {
            body: "x".into(),
            revision: 0,
            verdict: ReviewVerdict::Pending,
        };
        match reviewer.review(&msg(), &candidate).await.unwrap() {
            ReviewVerdict::Rejected { feedback } => assert_eq!(feedback, GENERIC_FEEDBACK),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn reviewer_rejects_pending_verdict() {
        let reviewer = Reviewer::new(model(ReviewVerdict::Pending));
        let candidate = DraftCandidate {
            body: "x".into(),
            revision: 0,
            verdict: ReviewVerdict::Pending,
        };
        let err = reviewer.review(&msg(), &candidate).await.unwrap_err();
        assert!(err.is_transient());
    }
}
