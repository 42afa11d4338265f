//! mailbot: rule-driven IMAP mailbox automation.

pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod mailbox;
pub mod outbound;
pub mod proxy;
pub mod rules;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
