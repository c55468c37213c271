use std::{collections::HashMap, path::Path, sync::Arc};

use tokio::sync::{
    mpsc::{self, error::TrySendError},
    Mutex,
};
use tokio_util::sync::CancellationToken;

use crate::{
    budget::BudgetPeriod,
    config::Config,
    conversation::{ConversationStats, ConversationStore},
    domain::{ChatId, UserId},
    errors::Error,
    formatting::{number_choices, usage_footer},
    model::{
        client::CompletionClient,
        tokens::TokenCounter,
        types::{CompletionParams, CompletionRequest, ModelFamily, Turn},
    },
    usage::{UsageLedger, UsageReport},
    Result,
};

/// Display name of the pooled guest ledger.
pub const GUESTS_NAME: &str = "Guests";

/// Snapshots buffered between the producer and a slow consumer; older ones are skipped.
const STREAM_BUFFER: usize = 32;

/// The user a request is billed to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Requester {
    pub user_id: UserId,
    pub user_name: String,
}

impl Requester {
    pub fn new(user_id: UserId, user_name: impl Into<String>) -> Self {
        Self {
            user_id,
            user_name: user_name.into(),
        }
    }
}

/// Final answer of a chat request.
#[derive(Clone, Debug, PartialEq)]
pub struct Answer {
    /// Text to show, footer included when usage display is on.
    pub text: String,
    pub total_tokens: u64,
    pub cost: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImageAnswer {
    pub url: String,
    pub cost: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub cost: f64,
}

/// Everything `/stats` shows for one user in one chat.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SessionReport {
    pub conversation: ConversationStats,
    pub usage: UsageReport,
    pub remaining_budget: f64,
    pub period: BudgetPeriod,
}

#[derive(Debug)]
pub enum StreamEvent {
    /// Whole answer so far.
    Snapshot(String),
    Finished(Answer),
    Failed(Error),
}

/// Consumer half of a streamed answer.
///
/// Dropping it (or calling `cancel`) stops the producer and the remote call behind it.
pub struct AnswerStream {
    rx: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
}

impl AnswerStream {
    /// Next event; `None` once the producer is gone.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for AnswerStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Coordinates conversation history, the completion service and the usage ledger for one request.
///
/// Requests for one chat must be serialized by the caller.
pub struct ChatSession {
    cfg: Arc<Config>,
    client: Arc<dyn CompletionClient>,
    counter: Arc<dyn TokenCounter>,
    conversations: ConversationStore,
    ledger: Arc<UsageLedger>,
    last_prompts: Mutex<HashMap<ChatId, String>>,
}

impl ChatSession {
    pub fn new(
        cfg: Arc<Config>,
        client: Arc<dyn CompletionClient>,
        counter: Arc<dyn TokenCounter>,
        ledger: Arc<UsageLedger>,
    ) -> Self {
        let conversations = ConversationStore::new(
            cfg.assistant_prompt.clone(),
            cfg.max_conversation_age,
            cfg.max_history_size,
        );
        Self {
            cfg,
            client,
            counter,
            conversations,
            ledger,
            last_prompts: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn is_allowed(&self, user: UserId) -> bool {
        self.cfg.budget.is_allowed(user)
    }

    /// Remaining budget, or `BudgetExceeded` when nothing is left.
    pub async fn check_budget(&self, who: &Requester) -> Result<f64> {
        let cost = self.ledger.current_cost(who.user_id, &who.user_name).await?;
        let remaining = self.cfg.budget.check(who.user_id, &cost);
        if let Err(e) = &remaining {
            tracing::info!(user_id = who.user_id.0, error = %e, "request rejected");
        }
        remaining
    }

    pub async fn reset(&self, chat: ChatId, prompt: Option<&str>) {
        self.conversations.reset(chat, prompt).await;
    }

    pub async fn last_prompt(&self, chat: ChatId) -> Option<String> {
        self.last_prompts.lock().await.get(&chat).cloned()
    }

    /// Single-shot answer. With several choices each is numbered; only the first enters history.
    pub async fn ask(&self, chat: ChatId, who: &Requester, prompt: &str) -> Result<Answer> {
        let req = self.prepare(chat, who, prompt, self.cfg.n_choices).await?;
        let completion = self.client.complete(req).await?;

        let first = completion
            .choices
            .first()
            .map(|c| c.trim().to_string())
            .ok_or_else(|| Error::RemoteCallFailed("completion returned no choices".to_string()))?;
        self.conversations
            .append_turn(chat, Turn::assistant(first))
            .await;

        let total_tokens = match &completion.usage {
            Some(u) => u.total_tokens,
            None => self.count_history(chat).await? as u64,
        };
        let cost = self.record_chat_tokens(who, total_tokens).await?;

        let mut text = number_choices(&completion.choices);
        if self.cfg.show_usage {
            text.push_str(&usage_footer(total_tokens, completion.usage.as_ref()));
        }
        Ok(Answer {
            text,
            total_tokens,
            cost,
        })
    }

    /// Streamed answer. Budget and history preparation happen before this returns, so a
    /// rejection surfaces as an `Err` here rather than as a stream event.
    pub async fn ask_stream(
        self: &Arc<Self>,
        chat: ChatId,
        who: &Requester,
        prompt: &str,
    ) -> Result<AnswerStream> {
        let req = self.prepare(chat, who, prompt, 1).await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let cancel = CancellationToken::new();

        let this = self.clone();
        let token = cancel.clone();
        let who = who.clone();
        tokio::spawn(async move {
            let result = this.produce(chat, &who, req, &tx, &token).await;
            let event = match result {
                Ok(answer) => StreamEvent::Finished(answer),
                Err(e) => {
                    tracing::warn!(chat_id = chat.0, error = %e, "streamed answer failed");
                    StreamEvent::Failed(e)
                }
            };
            // Receiver may already be gone.
            let _ = tx.send(event).await;
        });

        Ok(AnswerStream { rx, cancel })
    }

    async fn produce(
        &self,
        chat: ChatId,
        who: &Requester,
        req: CompletionRequest,
        tx: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<Answer> {
        let mut so_far = String::new();
        let mut on_delta = |delta: &str| -> Result<()> {
            so_far.push_str(delta);
            match tx.try_send(StreamEvent::Snapshot(so_far.clone())) {
                Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
                Err(TrySendError::Closed(_)) => Err(Error::Cancelled),
            }
        };
        // Only the remote call is cancellable; once an answer exists it is kept and billed.
        let full = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = self.client.complete_stream(req, &mut on_delta) => r?,
        };

        let answer = full.trim().to_string();
        if answer.is_empty() {
            return Err(Error::RemoteCallFailed("empty streamed answer".to_string()));
        }
        self.conversations
            .append_turn(chat, Turn::assistant(answer.clone()))
            .await;

        let total_tokens = self.count_history(chat).await? as u64;
        let cost = self.record_chat_tokens(who, total_tokens).await?;

        let mut text = answer;
        if self.cfg.show_usage {
            text.push_str(&usage_footer(total_tokens, None));
        }
        Ok(Answer {
            text,
            total_tokens,
            cost,
        })
    }

    pub async fn generate_image(&self, who: &Requester, prompt: &str) -> Result<ImageAnswer> {
        self.check_budget(who).await?;
        let size = self.cfg.image_size;
        let url = self.client.generate_image(prompt, size).await?;

        let cost = self
            .ledger
            .record_image_request(who.user_id, &who.user_name, size.as_str())
            .await?;
        if self.cfg.budget.is_guest(who.user_id) {
            self.ledger
                .record_image_request(UserId::GUESTS, GUESTS_NAME, size.as_str())
                .await?;
        }
        Ok(ImageAnswer { url, cost })
    }

    /// Transcribe an audio file of `seconds` length and bill it.
    pub async fn transcribe(
        &self,
        who: &Requester,
        audio: &Path,
        seconds: u64,
    ) -> Result<Transcript> {
        self.check_budget(who).await?;
        let text = self.client.transcribe(audio).await?;
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(Error::RemoteCallFailed("empty transcript".to_string()));
        }

        let cost = self
            .ledger
            .record_transcription_seconds(who.user_id, &who.user_name, seconds)
            .await?;
        if self.cfg.budget.is_guest(who.user_id) {
            self.ledger
                .record_transcription_seconds(UserId::GUESTS, GUESTS_NAME, seconds)
                .await?;
        }
        Ok(Transcript { text, cost })
    }

    pub async fn report(&self, chat: ChatId, who: &Requester) -> Result<SessionReport> {
        let conversation = self
            .conversations
            .stats(chat, self.counter.as_ref(), &self.cfg.model)
            .await?;
        let usage = self.ledger.report(who.user_id, &who.user_name).await?;
        let remaining_budget = self
            .cfg
            .budget
            .remaining_budget(who.user_id, &usage.cost);
        Ok(SessionReport {
            conversation,
            usage,
            remaining_budget,
            period: self.cfg.budget.period,
        })
    }

    /// Gate, seed, append the user turn, shrink the history, build the request.
    async fn prepare(
        &self,
        chat: ChatId,
        who: &Requester,
        prompt: &str,
        n: u32,
    ) -> Result<CompletionRequest> {
        ModelFamily::of(&self.cfg.model)?;
        self.check_budget(who).await?;

        self.conversations.ensure_active(chat).await;
        self.last_prompts
            .lock()
            .await
            .insert(chat, prompt.to_string());
        self.conversations
            .append_turn(chat, Turn::user(prompt))
            .await;
        self.conversations
            .enforce_limits(
                chat,
                self.client.as_ref(),
                self.counter.as_ref(),
                &self.cfg.model,
                self.cfg.max_tokens as usize,
            )
            .await?;

        Ok(CompletionRequest {
            params: CompletionParams {
                model: self.cfg.model.clone(),
                max_tokens: self.cfg.max_tokens,
                n: n.max(1),
                temperature: self.cfg.temperature,
                presence_penalty: self.cfg.presence_penalty,
                frequency_penalty: self.cfg.frequency_penalty,
            },
            messages: self.conversations.history(chat).await,
        })
    }

    async fn count_history(&self, chat: ChatId) -> Result<usize> {
        let turns = self.conversations.history(chat).await;
        self.counter.count_turns(&self.cfg.model, &turns)
    }

    /// Bill `tokens` to the requester and, for guests, to the shared guest ledger.
    async fn record_chat_tokens(&self, who: &Requester, tokens: u64) -> Result<f64> {
        let cost = self
            .ledger
            .record_chat_tokens(who.user_id, &who.user_name, tokens)
            .await?;
        if self.cfg.budget.is_guest(who.user_id) {
            self.ledger
                .record_chat_tokens(UserId::GUESTS, GUESTS_NAME, tokens)
                .await?;
        }
        tracing::debug!(user_id = who.user_id.0, tokens, cost, "usage recorded");
        Ok(cost)
    }
}
