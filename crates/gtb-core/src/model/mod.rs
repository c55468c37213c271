//! Completion-service port and the conversation data it works on.

pub mod client;
pub mod tokens;
pub mod types;
