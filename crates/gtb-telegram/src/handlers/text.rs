use std::sync::Arc;

use teloxide::prelude::*;

use gtb_core::domain::{ChatId, MessageId};

use crate::handlers::answer::{run_prompt, PromptContext};
use crate::handlers::requester;
use crate::router::AppState;

pub async fn handle_text(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };
    if text.trim().is_empty() {
        return Ok(());
    }

    let ctx = PromptContext {
        state,
        chat_id: ChatId(msg.chat.id.0),
        reply_to: Some(MessageId(msg.id.0)),
        in_group: msg.chat.is_group() || msg.chat.is_supergroup(),
        who: requester(user),
    };
    tracing::debug!(chat_id = ctx.chat_id.0, user_id = ctx.who.user_id.0, "text prompt");
    run_prompt(&ctx, text).await;
    Ok(())
}
