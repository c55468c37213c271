use std::{collections::HashMap, sync::Arc};

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};

use tokio::sync::{Mutex, OwnedMutexGuard};

use gtb_core::messaging::throttled::{ThrottleConfig, ThrottledMessenger};
use gtb_core::{config::Config, messaging::port::MessagingPort, session::ChatSession};

use crate::handlers;
use crate::TelegramMessenger;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub session: Arc<ChatSession>,
    pub messenger: Arc<dyn MessagingPort>,
    pub chat_locks: Arc<ChatLocks>,
}

/// One async mutex per chat; requests of a chat run one at a time.
#[derive(Default)]
pub struct ChatLocks {
    inner: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl ChatLocks {
    pub async fn lock_chat(&self, chat_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(chat_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

pub async fn run_polling(cfg: Arc<Config>, session: Arc<ChatSession>) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.telegram_bot_token.clone());

    match bot.get_me().await {
        Ok(me) => tracing::info!(username = %me.username(), "bot started"),
        Err(e) => tracing::warn!(error = %e, "get_me failed"),
    }
    tracing::info!(
        model = %cfg.model,
        stream = cfg.stream,
        budget_period = %cfg.budget.period,
        "serving"
    );

    // Throttle outbound calls; streaming edits are the main source of 429s. The adapter
    // still retries once on RetryAfter.
    let raw_messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        ThrottleConfig::with_chat_interval(cfg.streaming_throttle),
    ));

    let state = Arc::new(AppState {
        cfg,
        session,
        messenger,
        chat_locks: Arc::new(ChatLocks::default()),
    });

    let handler =
        dptree::entry().branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build()
        .dispatch()
        .await;

    tracing::info!("dispatcher stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn chat_lock_serializes_one_chat_only() {
        let locks = ChatLocks::default();
        let held = locks.lock_chat(1).await;

        // Another chat is not blocked.
        let other = tokio::time::timeout(Duration::from_millis(100), locks.lock_chat(2)).await;
        assert!(other.is_ok());

        // The same chat waits until the first guard is gone.
        let same = tokio::time::timeout(Duration::from_millis(50), locks.lock_chat(1)).await;
        assert!(same.is_err());
        drop(held);
        let same = tokio::time::timeout(Duration::from_millis(100), locks.lock_chat(1)).await;
        assert!(same.is_ok());
    }
}
