use std::sync::Arc;

use teloxide::prelude::*;

use gtb_core::{
    domain::{ChatId, MessageId},
    messaging::types::ChatAction,
    session::SessionReport,
    usage::round_to,
};

use crate::router::AppState;

use super::answer::{report_error, run_prompt, PromptContext};
use super::requester;

const HELP: &str = "🤖 GPT Telegram Bot\n\n\
📋 Commands:\n\
/help - Show this help message\n\
/reset [prompt] - Start a new conversation, optionally with a custom system prompt\n\
/image <prompt> - Generate an image\n\
/resend - Answer your last prompt again\n\
/stats - Show your usage and remaining budget\n\n\
💡 Send a text or a voice message to chat.";

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

fn format_stats(report: &SessionReport, show_budget: bool) -> String {
    let u = &report.usage;
    let mut out = format!(
        "📊 Current conversation:\n\
{} chat messages in history.\n\
{} chat tokens in history.\n\n\
📅 Usage today:\n\
{} chat tokens used.\n\
{} images generated.\n\
{} minutes and {} seconds transcribed.\n\
💰 ${:.2} spent.\n\n\
🗓 Usage this month:\n\
{} chat tokens used.\n\
{} images generated.\n\
{} minutes and {} seconds transcribed.\n\
💰 ${:.2} spent.",
        report.conversation.turns,
        report.conversation.tokens,
        u.tokens.today,
        u.images.today,
        u.transcription.today_minutes,
        u.transcription.today_seconds,
        u.cost.today,
        u.tokens.month,
        u.images.month,
        u.transcription.month_minutes,
        u.transcription.month_seconds,
        u.cost.month,
    );
    if show_budget {
        out.push_str(&format!(
            "\n\n💳 Remaining budget {}: ${:.2}",
            report.period.label(),
            round_to(report.remaining_budget, 2)
        ));
    }
    out
}

pub async fn handle_command(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };

    let ctx = PromptContext {
        state: state.clone(),
        chat_id: ChatId(msg.chat.id.0),
        reply_to: Some(MessageId(msg.id.0)),
        in_group: msg.chat.is_group() || msg.chat.is_supergroup(),
        who: requester(user),
    };
    let (cmd, arg) = parse_command(text);
    tracing::debug!(chat_id = ctx.chat_id.0, command = %cmd, "command");

    match cmd.as_str() {
        "start" | "help" => {
            let _ = state.messenger.send_text(ctx.chat_id, HELP, None).await;
        }

        "reset" => {
            let prompt = (!arg.is_empty()).then_some(arg.as_str());
            state.session.reset(ctx.chat_id, prompt).await;
            let _ = state
                .messenger
                .send_text(ctx.chat_id, "🔄 Conversation reset.", None)
                .await;
        }

        "stats" => match state.session.report(ctx.chat_id, &ctx.who).await {
            Ok(report) => {
                // Unlimited budgets have nothing useful to show.
                let show_budget = report.remaining_budget.is_finite();
                let body = format_stats(&report, show_budget);
                let _ = state.messenger.send_text(ctx.chat_id, &body, None).await;
            }
            Err(e) => report_error(&ctx, &e).await,
        },

        "image" => {
            if arg.is_empty() {
                let _ = state
                    .messenger
                    .send_text(
                        ctx.chat_id,
                        "Please provide a prompt, e.g. /image a cat wearing a hat",
                        None,
                    )
                    .await;
                return Ok(());
            }
            let _ = state
                .messenger
                .send_chat_action(ctx.chat_id, ChatAction::UploadPhoto)
                .await;
            match state.session.generate_image(&ctx.who, &arg).await {
                Ok(image) => {
                    tracing::info!(chat_id = ctx.chat_id.0, cost = image.cost, "image generated");
                    if let Err(e) = state
                        .messenger
                        .send_photo_url(ctx.chat_id, &image.url, ctx.reply_to)
                        .await
                    {
                        report_error(&ctx, &e).await;
                    }
                }
                Err(e) => report_error(&ctx, &e).await,
            }
        }

        "resend" => match state.session.last_prompt(ctx.chat_id).await {
            Some(prompt) => run_prompt(&ctx, &prompt).await,
            None => {
                let _ = state
                    .messenger
                    .send_text(ctx.chat_id, "There is nothing to resend.", None)
                    .await;
            }
        },

        _ => {
            let _ = state
                .messenger
                .send_text(ctx.chat_id, "Unknown command. See /help.", None)
                .await;
        }
    }

    Ok(())
}
