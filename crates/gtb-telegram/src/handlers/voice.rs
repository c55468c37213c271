use std::{
    path::PathBuf,
    sync::atomic::{AtomicUsize, Ordering},
    sync::Arc,
};

use teloxide::{net::Download, prelude::*};

use gtb_core::domain::{ChatId, MessageId};

use crate::handlers::answer::{report_error, run_prompt, PromptContext};
use crate::handlers::requester;
use crate::router::AppState;

static VOICE_COUNTER: AtomicUsize = AtomicUsize::new(1);

/// Transcript shown back to the user before it is answered.
const PREVIEW_CHARS: usize = 300;

async fn download_voice(
    bot: &Bot,
    state: &AppState,
    voice: &teloxide::types::Voice,
) -> anyhow::Result<PathBuf> {
    let file = bot.get_file(voice.file.id.clone()).await?;

    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let n = VOICE_COUNTER.fetch_add(1, Ordering::SeqCst);
    tokio::fs::create_dir_all(&state.cfg.temp_dir).await?;
    let path = state.cfg.temp_dir.join(format!("voice_{ts}_{n}.ogg"));

    let mut dst = tokio::fs::File::create(&path).await?;
    bot.download_file(&file.path, &mut dst).await?;
    Ok(path)
}

fn preview(transcript: &str) -> String {
    if transcript.chars().count() > PREVIEW_CHARS {
        format!(
            "{}...",
            transcript.chars().take(PREVIEW_CHARS).collect::<String>()
        )
    } else {
        transcript.to_string()
    }
}

pub async fn handle_voice(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(voice) = msg.voice() else {
        return Ok(());
    };

    let ctx = PromptContext {
        state: state.clone(),
        chat_id: ChatId(msg.chat.id.0),
        reply_to: Some(MessageId(msg.id.0)),
        in_group: msg.chat.is_group() || msg.chat.is_supergroup(),
        who: requester(user),
    };

    // Reject before downloading anything.
    if let Err(e) = state.session.check_budget(&ctx.who).await {
        report_error(&ctx, &e).await;
        return Ok(());
    }

    let voice_path = match download_voice(&bot, &state, voice).await {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(chat_id = ctx.chat_id.0, error = %e, "voice download failed");
            let _ = state
                .messenger
                .send_text(
                    ctx.chat_id,
                    &format!(
                        "❌ Failed to download voice: {}",
                        e.to_string().chars().take(200).collect::<String>()
                    ),
                    None,
                )
                .await;
            return Ok(());
        }
    };

    let transcript = state
        .session
        .transcribe(&ctx.who, &voice_path, u64::from(voice.duration))
        .await;
    let _ = tokio::fs::remove_file(&voice_path).await;

    let transcript = match transcript {
        Ok(t) => t,
        Err(e) => {
            report_error(&ctx, &e).await;
            return Ok(());
        }
    };
    tracing::info!(
        chat_id = ctx.chat_id.0,
        seconds = voice.duration,
        cost = transcript.cost,
        "voice transcribed"
    );

    let _ = state
        .messenger
        .send_text(
            ctx.chat_id,
            &format!("🎤 \"{}\"", preview(&transcript.text)),
            ctx.reply_to,
        )
        .await;

    run_prompt(&ctx, &transcript.text).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_transcripts_are_shortened() {
        assert_eq!(preview("hi"), "hi");
        let long = "é".repeat(PREVIEW_CHARS + 5);
        let p = preview(&long);
        assert!(p.ends_with("..."));
        assert_eq!(p.chars().count(), PREVIEW_CHARS + 3);
    }
}
