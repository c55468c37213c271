//! Outbound messaging port (Telegram today) and its rate-limiting decorator.

pub mod port;
pub mod throttled;
pub mod types;
