//! Email processing pipeline.
//!
//! Every accepted notification flows through:
//! 1. `Ledger::admit()`: dedup gate, nothing happens before it says yes
//! 2. `Mailbox::fetch_message()` + `normalize::normalize_message()`
//! 3. `Classifier::classify()`: skip rules, then the model
//! 4. `ContextAssembler::assemble()`: prior thread messages and a summary
//! 5. `DraftGenerator` / `Reviewer`: bounded redraft loop
//! 6. `Mailbox::save_draft()`: at most once per run
//!
//! **Nothing is ever sent.** The pipeline only stores drafts for a human.

pub mod classifier;
pub mod context;
pub mod drafter;
pub mod orchestrator;
pub mod retry;
pub mod types;

pub use classifier::{Classifier, RuleField, SkipRule};
pub use context::ContextAssembler;
pub use drafter::{DraftGenerator, Reviewer};
pub use orchestrator::{Orchestrator, ProcessResult};
pub use retry::RetryPolicy;
