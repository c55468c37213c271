//! Core domain + application logic for the GPT Telegram bot.
//!
//! This crate is intentionally framework-agnostic. Telegram and OpenAI live
//! behind ports (traits) implemented in adapter crates.

pub mod budget;
pub mod config;
pub mod conversation;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod logging;
pub mod messaging;
pub mod model;
pub mod session;
pub mod usage;

pub use errors::{Error, Result};
