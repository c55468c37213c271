use std::sync::Arc;

use tokio::time::{timeout, Instant};

use gtb_core::{
    domain::{ChatId, MessageId, MessageRef},
    errors::Error,
    formatting::split_text,
    messaging::{port::MessagingPort, types::ChatAction},
    session::{Requester, StreamEvent},
    Result,
};

use crate::router::AppState;

pub(crate) struct PromptContext {
    pub state: Arc<AppState>,
    pub chat_id: ChatId,
    /// Message to quote in the first reply chunk.
    pub reply_to: Option<MessageId>,
    /// Group and supergroup answers always quote the prompt.
    pub in_group: bool,
    pub who: Requester,
}

fn quote_target(
    enable_quoting: bool,
    in_group: bool,
    reply_to: Option<MessageId>,
) -> Option<MessageId> {
    if enable_quoting || in_group {
        reply_to
    } else {
        None
    }
}

impl PromptContext {
    fn quote(&self) -> Option<MessageId> {
        quote_target(self.state.cfg.enable_quoting, self.in_group, self.reply_to)
    }

    fn chunk_limit(&self) -> usize {
        self.state
            .cfg
            .telegram_safe_limit
            .min(self.state.messenger.capabilities().max_message_len)
    }
}

/// Answer `prompt` in the chat, streaming when enabled. Failures are reported to the user.
pub(crate) async fn run_prompt(ctx: &PromptContext, prompt: &str) {
    if prompt.trim().is_empty() {
        return;
    }
    let _ = ctx
        .state
        .messenger
        .send_chat_action(ctx.chat_id, ChatAction::Typing)
        .await;

    let result = if ctx.state.cfg.stream {
        stream_answer(ctx, prompt).await
    } else {
        single_answer(ctx, prompt).await
    };
    if let Err(e) = result {
        report_error(ctx, &e).await;
    }
}

async fn single_answer(ctx: &PromptContext, prompt: &str) -> Result<()> {
    let answer = ctx
        .state
        .session
        .ask(ctx.chat_id, &ctx.who, prompt)
        .await?;
    tracing::info!(
        chat_id = ctx.chat_id.0,
        tokens = answer.total_tokens,
        cost = answer.cost,
        "answered"
    );

    let mut reply = ChunkedReply::new(
        ctx.state.messenger.as_ref(),
        ctx.chat_id,
        ctx.quote(),
        ctx.chunk_limit(),
    );
    reply.render(&answer.text).await
}

async fn stream_answer(ctx: &PromptContext, prompt: &str) -> Result<()> {
    let cfg = &ctx.state.cfg;
    let mut stream = ctx
        .state
        .session
        .ask_stream(ctx.chat_id, &ctx.who, prompt)
        .await?;

    let mut reply = ChunkedReply::new(
        ctx.state.messenger.as_ref(),
        ctx.chat_id,
        ctx.quote(),
        ctx.chunk_limit(),
    );
    let mut last_render: Option<Instant> = None;

    loop {
        let event = match timeout(cfg.stream_idle_timeout, stream.next()).await {
            Ok(Some(ev)) => ev,
            Ok(None) => {
                return Err(Error::RemoteCallFailed(
                    "answer stream ended without a result".to_string(),
                ))
            }
            Err(_) => {
                stream.cancel();
                return Err(Error::RemoteCallFailed(format!(
                    "no output for {}s",
                    cfg.stream_idle_timeout.as_secs()
                )));
            }
        };

        match event {
            StreamEvent::Snapshot(text) => {
                let due = last_render.map_or(true, |t| t.elapsed() >= cfg.streaming_throttle);
                if !due {
                    continue;
                }
                last_render = Some(Instant::now());
                if let Err(e) = reply.render(&text).await {
                    tracing::warn!(chat_id = ctx.chat_id.0, error = %e, "streaming update failed");
                }
            }
            StreamEvent::Finished(answer) => {
                tracing::info!(
                    chat_id = ctx.chat_id.0,
                    tokens = answer.total_tokens,
                    cost = answer.cost,
                    "answered (stream)"
                );
                return reply.render(&answer.text).await;
            }
            StreamEvent::Failed(e) => return Err(e),
        }
    }
}

pub(crate) async fn report_error(ctx: &PromptContext, err: &Error) {
    let text = user_message(ctx, err);
    if let Err(e) = ctx
        .state
        .messenger
        .send_text(ctx.chat_id, &text, ctx.quote())
        .await
    {
        tracing::warn!(chat_id = ctx.chat_id.0, error = %e, "failed to report error");
    }
}

fn user_message(ctx: &PromptContext, err: &Error) -> String {
    match err {
        Error::BudgetExceeded { .. } => format!(
            "⛔ You have reached your usage limit for {}. Please contact the bot owner.",
            ctx.state.cfg.budget.period.label()
        ),
        Error::Cancelled => "⏹ Request cancelled.".to_string(),
        other => {
            tracing::warn!(chat_id = ctx.chat_id.0, error = %other, "request failed");
            let detail: String = other.to_string().chars().take(200).collect();
            format!("❌ Failed to get an answer: {detail}")
        }
    }
}

/// An answer spread over as many messages as the length limit requires.
///
/// Rendering a longer version of the text edits the chunks that changed and sends new
/// messages for the overflow.
pub(crate) struct ChunkedReply<'a> {
    messenger: &'a dyn MessagingPort,
    chat_id: ChatId,
    reply_to: Option<MessageId>,
    limit: usize,
    sent: Vec<(MessageRef, String)>,
}

impl<'a> ChunkedReply<'a> {
    pub fn new(
        messenger: &'a dyn MessagingPort,
        chat_id: ChatId,
        reply_to: Option<MessageId>,
        limit: usize,
    ) -> Self {
        Self {
            messenger,
            chat_id,
            reply_to,
            limit,
            sent: Vec::new(),
        }
    }

    pub async fn render(&mut self, text: &str) -> Result<()> {
        // Telegram rejects empty messages.
        let text = text.trim_end();
        if text.is_empty() {
            return Ok(());
        }
        let chunks = split_text(text, self.limit);

        for (i, chunk) in chunks.iter().enumerate() {
            match self.sent.get_mut(i) {
                Some((msg, shown)) => {
                    if shown != chunk {
                        self.messenger.edit_text(*msg, chunk).await?;
                        *shown = chunk.clone();
                    }
                }
                None => {
                    let reply_to = if i == 0 { self.reply_to } else { None };
                    let msg = self
                        .messenger
                        .send_text(self.chat_id, chunk, reply_to)
                        .await?;
                    self.sent.push((msg, chunk.clone()));
                }
            }
        }

        while self.sent.len() > chunks.len() {
            if let Some((msg, _)) = self.sent.pop() {
                self.messenger.delete_message(msg).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use gtb_core::messaging::types::MessagingCapabilities;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: StdMutex<Vec<String>>,
        next_id: StdMutex<i32>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessagingPort for Recorder {
        fn capabilities(&self) -> MessagingCapabilities {
            MessagingCapabilities {
                supports_edit: true,
                max_message_len: 4096,
            }
        }

        async fn send_text(
            &self,
            chat_id: ChatId,
            text: &str,
            reply_to: Option<MessageId>,
        ) -> Result<MessageRef> {
            let mut id = self.next_id.lock().unwrap();
            *id += 1;
            let quoted = reply_to.map(|m| format!("@{}", m.0)).unwrap_or_default();
            self.calls
                .lock()
                .unwrap()
                .push(format!("send#{}{quoted}:{text}", *id));
            Ok(MessageRef {
                chat_id,
                message_id: MessageId(*id),
            })
        }

        async fn edit_text(&self, msg: MessageRef, text: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("edit#{}:{text}", msg.message_id.0));
            Ok(())
        }

        async fn delete_message(&self, msg: MessageRef) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("delete#{}", msg.message_id.0));
            Ok(())
        }

        async fn send_chat_action(&self, _chat_id: ChatId, _action: ChatAction) -> Result<()> {
            Ok(())
        }

        async fn send_photo_url(
            &self,
            chat_id: ChatId,
            _url: &str,
            _reply_to: Option<MessageId>,
        ) -> Result<MessageRef> {
            Ok(MessageRef {
                chat_id,
                message_id: MessageId(0),
            })
        }
    }

    #[test]
    fn groups_quote_even_when_quoting_is_off() {
        let msg = Some(MessageId(9));
        assert_eq!(quote_target(false, false, msg), None);
        assert_eq!(quote_target(false, true, msg), msg);
        assert_eq!(quote_target(true, false, msg), msg);
        assert_eq!(quote_target(true, true, None), None);
    }

    #[tokio::test]
    async fn growing_text_edits_then_overflows_into_new_message() {
        let rec = Recorder::default();
        let mut reply = ChunkedReply::new(&rec, ChatId(1), Some(MessageId(50)), 5);

        reply.render("ab").await.unwrap();
        reply.render("abcd").await.unwrap();
        // Unchanged text is not re-sent.
        reply.render("abcd").await.unwrap();
        reply.render("abcdefg").await.unwrap();

        assert_eq!(
            rec.calls(),
            vec!["send#1@50:ab", "edit#1:abcd", "edit#1:abcde", "send#2:fg"]
        );
    }

    #[tokio::test]
    async fn shrinking_text_deletes_surplus_chunks() {
        let rec = Recorder::default();
        let mut reply = ChunkedReply::new(&rec, ChatId(1), None, 4);

        reply.render("abcdefg").await.unwrap();
        reply.render("abcd").await.unwrap();

        assert_eq!(
            rec.calls(),
            vec!["send#1:abcd", "send#2:efg", "delete#2"]
        );
    }

    #[tokio::test]
    async fn blank_text_sends_nothing() {
        let rec = Recorder::default();
        let mut reply = ChunkedReply::new(&rec, ChatId(1), None, 10);
        reply.render("   ").await.unwrap();
        assert!(rec.calls().is_empty());
    }
}
