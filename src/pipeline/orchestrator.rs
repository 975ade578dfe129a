//! Pipeline orchestrator: one run per admitted message id.
//!
//! ```text
//! RECEIVED → ADMITTED → NORMALIZED → CLASSIFIED ─┬→ SKIPPED
//!                                                └→ CONTEXT_BUILT → DRAFTING ⇄ REVIEWING → SAVING → SAVED
//! any external-call stage ──(retries exhausted / permanent error)──→ FAILED:<kind>
//! ```
//!
//! Every external call goes through [`retry`] with the configured policy and
//! per-attempt timeout. The ledger is consulted before any side effect and
//! updated once the run is terminal. While the run is live a heartbeat
//! renews its ledger lease, so a slow run is never mistaken for an
//! abandoned one. `SAVING` is entered at most once per run.

use std::fmt;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, Span, error, info, info_span, warn};

use crate::config::{PipelineConfig, ReviewExhaustedPolicy};
use crate::error::PipelineError;
use crate::ledger::{Admission, Ledger};
use crate::normalize::normalize_message;
use crate::pipeline::classifier::Classifier;
use crate::pipeline::context::ContextAssembler;
use crate::pipeline::drafter::{DraftGenerator, Reviewer};
use crate::pipeline::retry::{Exhausted, RetryPolicy, TransientError, retry};
use crate::pipeline::types::{
    ChangeType, ConversationContext, DraftCandidate, FailureKind, LanguageModel, Mailbox,
    MessageRecord, NotificationEvent, NotificationSource, PipelineRun, ReviewVerdict, RunOutcome,
    Stage,
};

/// What `process` did with an event.
#[derive(Debug)]
pub enum ProcessResult {
    /// Not something the pipeline reacts to; the ledger was not touched.
    Ignored { reason: String },
    /// The dedup gate turned the event away.
    Duplicate(Admission),
    /// A run was admitted and reached a terminal stage.
    Finished(PipelineRun),
}

impl ProcessResult {
    pub fn outcome(&self) -> Option<RunOutcome> {
        match self {
            Self::Finished(run) => run.outcome,
            _ => None,
        }
    }

    pub fn run(&self) -> Option<&PipelineRun> {
        match self {
            Self::Finished(run) => Some(run),
            _ => None,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// Drives messages through classify → context → draft/review → save.
pub struct Orchestrator {
    ledger: Arc<dyn Ledger>,
    mailbox: Arc<dyn Mailbox>,
    classifier: Classifier,
    assembler: ContextAssembler,
    generator: DraftGenerator,
    reviewer: Reviewer,
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        mailbox: Arc<dyn Mailbox>,
        llm: Arc<dyn LanguageModel>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            ledger,
            classifier: Classifier::new(Arc::clone(&llm)),
            assembler: ContextAssembler::new(
                Arc::clone(&mailbox),
                Arc::clone(&llm),
                config.summary_max_chars,
            ),
            generator: DraftGenerator::new(Arc::clone(&llm)),
            reviewer: Reviewer::new(llm),
            mailbox,
            config,
        }
    }

    /// Replace the default classifier (custom skip rules).
    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process one notification to completion.
    ///
    /// Errors only when the ledger itself is unreachable at admission time;
    /// stage failures are reported through the run's `FAILED` outcome.
    pub async fn process(&self, event: NotificationEvent) -> Result<ProcessResult, PipelineError> {
        if event.change_type != ChangeType::Created {
            info!(
                message_id = %event.message_id,
                change_type = %event.change_type,
                "Ignoring notification"
            );
            return Ok(ProcessResult::Ignored {
                reason: format!("change type '{}'", event.change_type),
            });
        }
        if event.message_id.trim().is_empty() {
            warn!(subscription_id = %event.subscription_id, "Notification without message id");
            return Ok(ProcessResult::Ignored {
                reason: "missing message id".into(),
            });
        }

        let admission = self.ledger.admit(&event.message_id).await?;
        let Some(lease) = admission.lease() else {
            info!(message_id = %event.message_id, %admission, "Duplicate notification dropped");
            return Ok(ProcessResult::Duplicate(admission));
        };

        let mut run = PipelineRun::new(event.message_id.clone());
        run.enter(Stage::Admitted);

        let span = info_span!("pipeline_run", run_id = %run.run_id, message_id = %run.message_id, lease);
        let heartbeat = Heartbeat::start(
            Arc::clone(&self.ledger),
            run.message_id.clone(),
            lease,
            span.clone(),
        );
        let outcome = self.drive(&mut run).instrument(span.clone()).await;
        drop(heartbeat);

        self.record(&run.message_id, lease, &outcome)
            .instrument(span)
            .await;
        Ok(ProcessResult::Finished(run))
    }

    /// Process an event in the background.
    pub fn spawn(self: &Arc<Self>, event: NotificationEvent) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move { orchestrator.handle(event).await })
    }

    /// Pull events from `source` until it closes, running up to
    /// `max_concurrent_runs` of them at a time. Waits for in-flight runs
    /// before returning.
    pub async fn run<S: NotificationSource>(self: Arc<Self>, mut source: S) {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_runs));
        let mut tasks = JoinSet::new();
        info!(
            max_concurrent_runs = self.config.max_concurrent_runs,
            "Pipeline dispatcher started"
        );

        while let Some(event) = source.next().await {
            while tasks.try_join_next().is_some() {}

            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let orchestrator = Arc::clone(&self);
            tasks.spawn(async move {
                orchestrator.handle(event).await;
                drop(permit);
            });
        }

        info!(in_flight = tasks.len(), "Notification source closed, draining runs");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Pipeline task panicked");
            }
        }
    }

    async fn handle(&self, event: NotificationEvent) {
        let message_id = event.message_id.clone();
        if let Err(e) = self.process(event).await {
            error!(%message_id, error = %e, "Failed to process notification");
        }
    }

    // ── Stages ──────────────────────────────────────────────────────

    async fn drive(&self, run: &mut PipelineRun) -> RunOutcome {
        let message_id = run.message_id.clone();
        let retry_policy = &self.config.retry;

        // Fetch and normalize.
        let mailbox = self.mailbox.as_ref();
        let id = message_id.as_str();
        let raw = match self
            .call(run, Stage::Normalized, "fetch_message", retry_policy, move || {
                mailbox.fetch_message(id)
            })
            .await
        {
            Ok(raw) => raw,
            Err(e) => return fail(run, FailureKind::MessageUnavailable, &e),
        };
        let message = normalize_message(raw);
        run.enter(Stage::Normalized);

        // Classify.
        let classifier = &self.classifier;
        let msg = &message;
        let classification = match self
            .call(run, Stage::Classified, "classify", retry_policy, move || {
                classifier.classify(msg)
            })
            .await
        {
            Ok(result) => result,
            Err(e) => return fail(run, FailureKind::ClassificationUnavailable, &e),
        };
        run.enter(Stage::Classified);

        if !classification.is_actionable() {
            info!(
                rationale = classification.rationale.as_deref().unwrap_or(""),
                "Message classified SKIP"
            );
            return finish(run, RunOutcome::Skipped);
        }

        // Context.
        let assembler = &self.assembler;
        let context = match self
            .call(run, Stage::ContextBuilt, "assemble_context", retry_policy, move || {
                assembler.assemble(msg)
            })
            .await
        {
            Ok(context) => context,
            Err(e) => return fail(run, FailureKind::ContextUnavailable, &e),
        };
        run.enter(Stage::ContextBuilt);

        // Draft and review.
        let (candidate, approved) = match self.review_loop(run, &message, &context).await {
            Ok(result) => result,
            Err(outcome) => return outcome,
        };

        let outcome = if approved {
            RunOutcome::DraftSaved
        } else {
            match self.config.review_exhausted_policy {
                ReviewExhaustedPolicy::Fail => {
                    warn!(
                        drafts = run.drafts_generated,
                        "Review loop exhausted, no draft saved"
                    );
                    return finish(run, RunOutcome::Failed(FailureKind::ReviewExhausted));
                }
                ReviewExhaustedPolicy::SaveBestEffort => {
                    warn!(
                        drafts = run.drafts_generated,
                        revision = candidate.revision,
                        "Review loop exhausted, saving last draft unreviewed"
                    );
                    RunOutcome::DraftSavedUnreviewed
                }
            }
        };

        // Save. Entered once; retries stay inside this stage.
        run.enter(Stage::Saving);
        let body = candidate.body.as_str();
        match self
            .call(run, Stage::Saving, "save_draft", &self.config.save_retry, move || {
                mailbox.save_draft(id, body)
            })
            .await
        {
            Ok(()) => finish(run, outcome),
            Err(e) => fail(run, FailureKind::SaveFailed, &e),
        }
    }

    /// Generate and critique until approved or out of drafts.
    ///
    /// Returns the final candidate and whether it was approved, or the
    /// failed outcome when a call could not be completed.
    async fn review_loop(
        &self,
        run: &mut PipelineRun,
        message: &MessageRecord,
        context: &ConversationContext,
    ) -> Result<(DraftCandidate, bool), RunOutcome> {
        let max_drafts = self.config.max_redraft_attempts + 1;
        let retry_policy = &self.config.retry;
        let generator = &self.generator;
        let reviewer = &self.reviewer;
        let mut rejected: Option<DraftCandidate> = None;

        loop {
            run.enter(Stage::Drafting);
            let previous = rejected.as_ref();
            let mut candidate = match self
                .call(run, Stage::Drafting, "generate_draft", retry_policy, move || {
                    generator.generate(message, context, previous)
                })
                .await
            {
                Ok(candidate) => candidate,
                Err(e) => return Err(fail(run, FailureKind::GenerationUnavailable, &e)),
            };
            run.drafts_generated += 1;

            run.enter(Stage::Reviewing);
            let draft = &candidate;
            let verdict = match self
                .call(run, Stage::Reviewing, "review_draft", retry_policy, move || {
                    reviewer.review(message, draft)
                })
                .await
            {
                Ok(verdict) => verdict,
                Err(e) => return Err(fail(run, FailureKind::ReviewUnavailable, &e)),
            };

            info!(
                revision = candidate.revision,
                verdict = verdict.label(),
                "Draft reviewed"
            );
            let approved = verdict == ReviewVerdict::Approved;
            candidate.verdict = verdict;

            if approved {
                return Ok((candidate, true));
            }
            if run.drafts_generated >= max_drafts {
                return Ok((candidate, false));
            }
            rejected = Some(candidate);
        }
    }

    /// Run one external call under the retry policy and record its attempts
    /// against `stage`.
    async fn call<T, E, F, Fut>(
        &self,
        run: &mut PipelineRun,
        stage: Stage,
        operation: &str,
        policy: &RetryPolicy,
        op: F,
    ) -> Result<T, Exhausted<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: TransientError,
    {
        let result = retry(policy, self.config.attempt_timeout, operation, op).await;
        match result {
            Ok(done) => {
                run.record_attempts(stage, done.attempts);
                Ok(done.value)
            }
            Err(exhausted) => {
                run.record_attempts(stage, exhausted.attempts);
                Err(exhausted)
            }
        }
    }

    async fn record(&self, message_id: &str, lease: u32, outcome: &RunOutcome) {
        let result = match outcome {
            RunOutcome::Failed(kind) => self.ledger.fail(message_id, lease, *kind).await,
            done => self.ledger.complete(message_id, lease, done).await,
        };
        match result {
            Ok(true) => {}
            Ok(false) => warn!(%outcome, "Run outcome not recorded, lease was reclaimed"),
            Err(e) => error!(%outcome, error = %e, "Failed to record run outcome in ledger"),
        }
    }
}

/// Renews a run's ledger lease in the background until dropped.
struct Heartbeat(JoinHandle<()>);

impl Heartbeat {
    fn start(ledger: Arc<dyn Ledger>, message_id: String, lease: u32, span: Span) -> Self {
        let every = ledger.renew_interval();
        let task = async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; admission just stamped the entry.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match ledger.renew(&message_id, lease).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!("Ledger lease lost, stopping heartbeat");
                        break;
                    }
                    Err(e) => warn!(error = %e, "Failed to renew ledger lease"),
                }
            }
        };
        Self(tokio::spawn(task.instrument(span)))
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn finish(run: &mut PipelineRun, outcome: RunOutcome) -> RunOutcome {
    run.finish(outcome);
    match outcome {
        RunOutcome::Failed(kind) => error!(%kind, stage = %run.stage, "Run failed"),
        _ => info!(%outcome, drafts = run.drafts_generated, "Run finished"),
    }
    outcome
}

fn fail<E: fmt::Display>(run: &mut PipelineRun, kind: FailureKind, cause: &Exhausted<E>) -> RunOutcome {
    error!(
        %kind,
        from_stage = %run.stage,
        attempts = cause.attempts,
        error = %cause,
        "External call failed"
    );
    finish(run, RunOutcome::Failed(kind))
}
