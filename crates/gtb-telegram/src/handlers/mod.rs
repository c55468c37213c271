//! Telegram update handlers.
//!
//! Each handler is a small adapter that:
//! - checks the sender against the allowed list
//! - downloads media or parses the command if needed
//! - calls into the `gtb-core` chat session and renders the answer

use std::sync::Arc;

use teloxide::{prelude::*, types::User};

use gtb_core::{domain::UserId, session};

use crate::router::AppState;

mod answer;
mod commands;
mod text;
mod voice;

/// Billing identity of a Telegram user.
fn requester(user: &User) -> session::Requester {
    let name = user
        .username
        .clone()
        .unwrap_or_else(|| user.full_name());
    session::Requester::new(UserId(user.id.0 as i64), name)
}

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let chat_id = msg.chat.id.0;
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let user_id = UserId(user.id.0 as i64);

    if !state.session.is_allowed(user_id) {
        tracing::info!(user_id = user_id.0, chat_id, "unauthorized user");
        let _ = bot
            .send_message(
                msg.chat.id,
                "Sorry, you are not allowed to use this bot. Contact the bot owner for access.",
            )
            .await;
        return Ok(());
    }

    if let Some(text) = msg.text() {
        let _guard = state.chat_locks.lock_chat(chat_id).await;
        if text.starts_with('/') {
            return commands::handle_command(msg, state).await;
        }
        return text::handle_text(msg, state).await;
    }

    if msg.voice().is_some() {
        let _guard = state.chat_locks.lock_chat(chat_id).await;
        return voice::handle_voice(bot, msg, state).await;
    }

    tracing::debug!(chat_id, "ignoring unsupported message kind");
    Ok(())
}
