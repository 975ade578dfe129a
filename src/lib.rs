//! Inbox Drafter: turns new-mail notifications into reviewed draft replies.

pub mod config;
pub mod error;
pub mod ledger;
pub mod llm;
pub mod logging;
pub mod mailbox;
pub mod normalize;
pub mod pipeline;
pub mod webhook;
