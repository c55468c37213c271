//! Per-chat conversation histories with age and size limits.
//!
//! Callers serialize requests for one chat (see the Telegram router's chat locks), so the
//! store only guards its map and never holds the lock across a remote call.

use std::{collections::HashMap, time::Duration};

use tokio::{sync::Mutex, time::Instant};

use crate::{
    domain::ChatId,
    errors::Error,
    model::{
        client::CompletionClient,
        tokens::TokenCounter,
        types::{ModelFamily, Turn},
    },
    Result,
};

#[derive(Clone, Debug)]
struct Conversation {
    turns: Vec<Turn>,
    last_updated: Instant,
}

impl Conversation {
    fn seeded(prompt: &str, now: Instant) -> Self {
        Self {
            turns: vec![Turn::system(prompt)],
            last_updated: now,
        }
    }
}

/// What `enforce_limits` did to the history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Overflow {
    Untouched,
    Summarized,
    Truncated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConversationStats {
    pub turns: usize,
    pub tokens: usize,
}

pub struct ConversationStore {
    assistant_prompt: String,
    max_age: Duration,
    max_history_size: usize,
    chats: Mutex<HashMap<ChatId, Conversation>>,
}

impl ConversationStore {
    pub fn new(
        assistant_prompt: impl Into<String>,
        max_age: Duration,
        max_history_size: usize,
    ) -> Self {
        Self {
            assistant_prompt: assistant_prompt.into(),
            max_age,
            max_history_size: max_history_size.max(1),
            chats: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_history_size(&self) -> usize {
        self.max_history_size
    }

    pub async fn ensure_active(&self, chat: ChatId) -> bool {
        self.ensure_active_at(chat, Instant::now()).await
    }

    /// Seed the chat if it is absent or stale. Returns `true` when a fresh history was created.
    pub async fn ensure_active_at(&self, chat: ChatId, now: Instant) -> bool {
        let mut map = self.chats.lock().await;
        let stale = match map.get(&chat) {
            None => true,
            Some(c) => now.saturating_duration_since(c.last_updated) > self.max_age,
        };
        if stale {
            map.insert(chat, Conversation::seeded(&self.assistant_prompt, now));
        }
        stale
    }

    /// Replace the history with a single system turn (`prompt` or the default instructions).
    pub async fn reset(&self, chat: ChatId, prompt: Option<&str>) {
        let prompt = prompt
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(&self.assistant_prompt);
        let mut map = self.chats.lock().await;
        map.insert(chat, Conversation::seeded(prompt, Instant::now()));
    }

    pub async fn append_turn(&self, chat: ChatId, turn: Turn) {
        self.append_turn_at(chat, turn, Instant::now()).await
    }

    pub async fn append_turn_at(&self, chat: ChatId, turn: Turn, now: Instant) {
        let mut map = self.chats.lock().await;
        let conv = map
            .entry(chat)
            .or_insert_with(|| Conversation::seeded(&self.assistant_prompt, now));
        conv.turns.push(turn);
        conv.last_updated = now;
    }

    /// Current history, seeding it on first access.
    pub async fn history(&self, chat: ChatId) -> Vec<Turn> {
        let mut map = self.chats.lock().await;
        map.entry(chat)
            .or_insert_with(|| Conversation::seeded(&self.assistant_prompt, Instant::now()))
            .turns
            .clone()
    }

    pub async fn stats(
        &self,
        chat: ChatId,
        counter: &dyn TokenCounter,
        model: &str,
    ) -> Result<ConversationStats> {
        let turns = self.history(chat).await;
        Ok(ConversationStats {
            turns: turns.len(),
            tokens: counter.count_turns(model, &turns)?,
        })
    }

    /// Shrink the history when it no longer leaves room for a `max_response_tokens` reply
    /// or holds more than `max_history_size` turns.
    ///
    /// Everything but the latest turn is summarized into one system turn. If that fails the
    /// error is logged and the `max_history_size` most recent turns are kept instead.
    pub async fn enforce_limits(
        &self,
        chat: ChatId,
        client: &dyn CompletionClient,
        counter: &dyn TokenCounter,
        model: &str,
        max_response_tokens: usize,
    ) -> Result<Overflow> {
        let context = ModelFamily::of(model)?.context_size();
        let turns = self.history(chat).await;
        let tokens = counter.count_turns(model, &turns)?;

        let over_tokens = tokens + max_response_tokens > context;
        let over_size = turns.len() > self.max_history_size;
        if !(over_tokens || over_size) {
            return Ok(Overflow::Untouched);
        }
        if turns.len() < 2 {
            tracing::warn!(chat_id = chat.0, tokens, "history cannot be shrunk any further");
            return Ok(Overflow::Untouched);
        }

        tracing::info!(
            chat_id = chat.0,
            turns = turns.len(),
            tokens,
            "chat history too long, summarising"
        );

        let (head, latest) = turns.split_at(turns.len() - 1);
        let (next, outcome) = match client.summarize(model, head).await {
            Ok(summary) if !summary.trim().is_empty() => {
                let mut next = vec![Turn::system(summary)];
                next.extend_from_slice(latest);
                (next, Overflow::Summarized)
            }
            Ok(_) => {
                let err = Error::SummarizationFailed("empty summary".to_string());
                tracing::warn!(chat_id = chat.0, error = %err, "truncating history instead");
                let kept = self.truncate(turns, counter, model, max_response_tokens, context)?;
                (kept, Overflow::Truncated)
            }
            Err(e) => {
                let err = Error::SummarizationFailed(e.to_string());
                tracing::warn!(chat_id = chat.0, error = %err, "truncating history instead");
                let kept = self.truncate(turns, counter, model, max_response_tokens, context)?;
                (kept, Overflow::Truncated)
            }
        };

        let mut map = self.chats.lock().await;
        let conv = map
            .entry(chat)
            .or_insert_with(|| Conversation::seeded(&self.assistant_prompt, Instant::now()));
        conv.turns = next;
        Ok(outcome)
    }

    /// Keep the most recent `max_history_size` turns, then keep dropping the oldest while the
    /// token limit is still exceeded and more than one turn is left.
    fn truncate(
        &self,
        turns: Vec<Turn>,
        counter: &dyn TokenCounter,
        model: &str,
        max_response_tokens: usize,
        context: usize,
    ) -> Result<Vec<Turn>> {
        let skip = turns.len().saturating_sub(self.max_history_size);
        let mut kept: Vec<Turn> = turns.into_iter().skip(skip).collect();
        while kept.len() > 1 && counter.count_turns(model, &kept)? + max_response_tokens > context {
            kept.remove(0);
        }
        Ok(kept)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::Path,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        model::{
            tokens::count_with,
            types::{Completion, CompletionRequest},
        },
        usage::ImageSize,
    };

    /// One token per character; family overhead is irrelevant here.
    struct CharCounter;

    impl TokenCounter for CharCounter {
        fn count_turns(&self, model: &str, turns: &[Turn]) -> Result<usize> {
            ModelFamily::of(model)?;
            Ok(count_with(turns, 0, 0, |s| s.chars().count() as i64) - 3)
        }
    }

    struct FakeSummarizer {
        calls: AtomicUsize,
        fail: bool,
    }

    impl FakeSummarizer {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl CompletionClient for FakeSummarizer {
        async fn complete(&self, _req: CompletionRequest) -> Result<Completion> {
            unreachable!()
        }

        async fn complete_stream(
            &self,
            _req: CompletionRequest,
            _on_delta: &mut (dyn for<'a> FnMut(&'a str) -> Result<()> + Send),
        ) -> Result<String> {
            unreachable!()
        }

        async fn summarize(&self, _model: &str, turns: &[Turn]) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::RemoteCallFailed("boom".into()));
            }
            Ok(format!("summary of {}", turns.len()))
        }

        async fn generate_image(&self, _prompt: &str, _size: ImageSize) -> Result<String> {
            unreachable!()
        }

        async fn transcribe(&self, _audio: &Path) -> Result<String> {
            unreachable!()
        }
    }

    const MODEL: &str = "gpt-3.5-turbo";

    fn store(max_history: usize) -> ConversationStore {
        ConversationStore::new("be nice", Duration::from_secs(60), max_history)
    }

    #[tokio::test]
    async fn unseen_chat_initializes_once() {
        let s = store(10);
        let chat = ChatId(1);
        let now = Instant::now();
        assert!(s.ensure_active_at(chat, now).await);
        assert!(!s.ensure_active_at(chat, now).await);
        assert_eq!(s.history(chat).await, vec![Turn::system("be nice")]);

        // Reading an unseen chat also seeds it, exactly like ensure_active.
        assert_eq!(s.history(ChatId(2)).await, vec![Turn::system("be nice")]);
    }

    #[tokio::test]
    async fn stale_chat_is_reseeded() {
        let s = store(10);
        let chat = ChatId(1);
        let t0 = Instant::now();
        s.ensure_active_at(chat, t0).await;
        s.append_turn_at(chat, Turn::user("hi"), t0).await;

        assert!(!s.ensure_active_at(chat, t0 + Duration::from_secs(60)).await);
        assert_eq!(s.history(chat).await.len(), 2);

        assert!(s.ensure_active_at(chat, t0 + Duration::from_secs(61)).await);
        assert_eq!(s.history(chat).await, vec![Turn::system("be nice")]);
    }

    #[tokio::test]
    async fn reset_uses_custom_prompt_when_given() {
        let s = store(10);
        let chat = ChatId(1);
        s.append_turn(chat, Turn::user("hi")).await;
        s.reset(chat, Some("talk like a pirate")).await;
        assert_eq!(s.history(chat).await, vec![Turn::system("talk like a pirate")]);
        s.reset(chat, Some("  ")).await;
        assert_eq!(s.history(chat).await, vec![Turn::system("be nice")]);
    }

    #[tokio::test]
    async fn stats_count_turns_and_tokens() {
        let s = store(10);
        let chat = ChatId(1);
        s.append_turn(chat, Turn::user("abc")).await;
        let stats = s.stats(chat, &CharCounter, MODEL).await.unwrap();
        // "system" + "be nice" + "user" + "abc"
        assert_eq!(stats, ConversationStats { turns: 2, tokens: 20 });

        let err = s.stats(chat, &CharCounter, "nope").await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedModel(_)));
    }

    #[tokio::test]
    async fn within_limits_is_untouched() {
        let s = store(10);
        let chat = ChatId(1);
        s.append_turn(chat, Turn::user("hi")).await;
        let client = FakeSummarizer::new(false);
        let out = s
            .enforce_limits(chat, &client, &CharCounter, MODEL, 100)
            .await
            .unwrap();
        assert_eq!(out, Overflow::Untouched);
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn too_many_turns_summarizes_once() {
        let s = store(3);
        let chat = ChatId(1);
        for t in ["q1", "a1", "q2"] {
            s.append_turn(chat, Turn::user(t)).await;
        }
        let client = FakeSummarizer::new(false);
        let out = s
            .enforce_limits(chat, &client, &CharCounter, MODEL, 100)
            .await
            .unwrap();

        assert_eq!(out, Overflow::Summarized);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            s.history(chat).await,
            vec![Turn::system("summary of 3"), Turn::user("q2")]
        );
    }

    #[tokio::test]
    async fn token_overflow_triggers_summary() {
        let s = store(100);
        let chat = ChatId(1);
        s.append_turn(chat, Turn::user("x".repeat(3000))).await;
        s.append_turn(chat, Turn::user("latest")).await;
        let client = FakeSummarizer::new(false);
        let out = s
            .enforce_limits(chat, &client, &CharCounter, MODEL, 1200)
            .await
            .unwrap();
        assert_eq!(out, Overflow::Summarized);
        assert_eq!(s.history(chat).await.last(), Some(&Turn::user("latest")));
    }

    #[tokio::test]
    async fn failed_summary_keeps_most_recent_turns() {
        let s = store(3);
        let chat = ChatId(1);
        for t in ["q1", "a1", "q2", "a2", "q3"] {
            s.append_turn(chat, Turn::user(t)).await;
        }
        let client = FakeSummarizer::new(true);
        let out = s
            .enforce_limits(chat, &client, &CharCounter, MODEL, 100)
            .await
            .unwrap();

        assert_eq!(out, Overflow::Truncated);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            s.history(chat).await,
            vec![Turn::user("q2"), Turn::user("a2"), Turn::user("q3")]
        );
    }
}
