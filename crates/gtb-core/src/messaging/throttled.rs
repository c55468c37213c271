use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{ChatId, MessageId, MessageRef},
    messaging::{
        port::MessagingPort,
        types::{ChatAction, MessagingCapabilities},
    },
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between any two outbound calls.
    pub global_min_interval: Duration,
    /// Minimum spacing between calls into one chat; bounds the streaming edit rate.
    pub per_chat_min_interval: Duration,
}

impl ThrottleConfig {
    pub fn with_chat_interval(per_chat_min_interval: Duration) -> Self {
        Self {
            per_chat_min_interval,
            ..Self::default()
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40),
            per_chat_min_interval: Duration::from_millis(800),
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return how long to wait before using it.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = self.next.max(now);
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// `MessagingPort` decorator that spaces out outbound calls, globally and per chat.
pub struct ThrottledMessenger {
    inner: Arc<dyn MessagingPort>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_chat: Mutex<HashMap<ChatId, Arc<Mutex<IntervalLimiter>>>>,
}

impl ThrottledMessenger {
    pub fn new(inner: Arc<dyn MessagingPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_chat: Mutex::new(HashMap::new()),
        }
    }

    async fn limiter_for_chat(&self, chat_id: ChatId) -> Arc<Mutex<IntervalLimiter>> {
        let mut map = self.per_chat.lock().await;
        map.entry(chat_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(IntervalLimiter::new(
                    self.cfg.per_chat_min_interval,
                )))
            })
            .clone()
    }

    async fn throttle(&self, chat_id: ChatId) {
        let global_wait = { self.global.lock().await.reserve() };
        let chat_wait = {
            let lim = self.limiter_for_chat(chat_id).await;
            let mut guard = lim.lock().await;
            guard.reserve()
        };

        let wait = global_wait.max(chat_wait);
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[async_trait]
impl MessagingPort for ThrottledMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        self.inner.capabilities()
    }

    async fn send_text(
        &self,
        chat_id: ChatId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageRef> {
        self.throttle(chat_id).await;
        self.inner.send_text(chat_id, text, reply_to).await
    }

    async fn edit_text(&self, msg: MessageRef, text: &str) -> Result<()> {
        self.throttle(msg.chat_id).await;
        self.inner.edit_text(msg, text).await
    }

    async fn delete_message(&self, msg: MessageRef) -> Result<()> {
        self.throttle(msg.chat_id).await;
        self.inner.delete_message(msg).await
    }

    async fn send_chat_action(&self, chat_id: ChatId, action: ChatAction) -> Result<()> {
        // Typing indicators are cheap and should not delay the answer.
        self.inner.send_chat_action(chat_id, action).await
    }

    async fn send_photo_url(
        &self,
        chat_id: ChatId,
        url: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageRef> {
        self.throttle(chat_id).await;
        self.inner.send_photo_url(chat_id, url, reply_to).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: StdMutex<Vec<String>>,
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
            _reply_to: Option<MessageId>,
        ) -> Result<MessageRef> {
            self.calls.lock().unwrap().push(format!("send:{text}"));
            Ok(MessageRef {
                chat_id,
                message_id: MessageId(1),
            })
        }

        async fn edit_text(&self, _msg: MessageRef, text: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("edit:{text}"));
            Ok(())
        }

        async fn delete_message(&self, _msg: MessageRef) -> Result<()> {
            self.calls.lock().unwrap().push("delete".to_string());
            Ok(())
        }

        async fn send_chat_action(&self, _chat_id: ChatId, _action: ChatAction) -> Result<()> {
            self.calls.lock().unwrap().push("action".to_string());
            Ok(())
        }

        async fn send_photo_url(
            &self,
            chat_id: ChatId,
            url: &str,
            _reply_to: Option<MessageId>,
        ) -> Result<MessageRef> {
            self.calls.lock().unwrap().push(format!("photo:{url}"));
            Ok(MessageRef {
                chat_id,
                message_id: MessageId(2),
            })
        }
    }

    #[test]
    fn limiter_spaces_reservations() {
        let mut lim = IntervalLimiter::new(Duration::from_secs(10));
        assert!(lim.reserve().is_zero());
        let second = lim.reserve();
        assert!(second > Duration::from_secs(9));
    }

    #[tokio::test]
    async fn calls_pass_through_in_order() {
        let inner = Arc::new(Recorder::default());
        let cfg = ThrottleConfig {
            global_min_interval: Duration::from_millis(1),
            per_chat_min_interval: Duration::from_millis(5),
        };
        let t = ThrottledMessenger::new(inner.clone(), cfg);

        let msg = t.send_text(ChatId(1), "a", None).await.unwrap();
        t.edit_text(msg, "ab").await.unwrap();
        t.send_chat_action(ChatId(1), ChatAction::Typing).await.unwrap();
        t.delete_message(msg).await.unwrap();

        assert_eq!(
            *inner.calls.lock().unwrap(),
            vec!["send:a", "edit:ab", "action", "delete"]
        );
    }
}
