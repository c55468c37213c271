//! Token counting for conversation histories.

use std::sync::Arc;

use tiktoken_rs::{cl100k_base, CoreBPE};

use crate::{errors::Error, Result};

use super::types::{ModelFamily, Turn};

/// Every reply is primed with `<|start|>assistant<|message|>`.
const REPLY_PRIMING: i64 = 3;

pub trait TokenCounter: Send + Sync {
    /// Tokens `turns` occupy in a request to `model`, framing overhead included.
    fn count_turns(&self, model: &str, turns: &[Turn]) -> Result<usize>;
}

/// Counts with the `cl100k_base` encoding shared by the gpt-3.5 and gpt-4 families.
#[derive(Clone)]
pub struct TiktokenCounter {
    bpe: Arc<CoreBPE>,
}

impl TiktokenCounter {
    pub fn new() -> Result<Self> {
        let bpe = cl100k_base().map_err(|e| Error::Config(format!("tokenizer: {e}")))?;
        Ok(Self { bpe: Arc::new(bpe) })
    }

    fn len(&self, text: &str) -> i64 {
        self.bpe.encode_with_special_tokens(text).len() as i64
    }
}

impl TokenCounter for TiktokenCounter {
    fn count_turns(&self, model: &str, turns: &[Turn]) -> Result<usize> {
        let (per_message, per_name) = ModelFamily::of(model)?.message_overhead();
        let total = count_with(turns, per_message, per_name, |s| self.len(s));
        Ok(total)
    }
}

/// Shared framing arithmetic so fakes and the real counter agree.
pub fn count_with(
    turns: &[Turn],
    per_message: i64,
    per_name: i64,
    len: impl Fn(&str) -> i64,
) -> usize {
    let mut n = REPLY_PRIMING;
    for t in turns {
        n += per_message;
        n += len(t.role.as_str());
        n += len(&t.content);
        if let Some(name) = &t.name {
            n += len(name) + per_name;
        }
    }
    n.max(0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_overhead_per_family() {
        // One "token" per whitespace-separated word.
        let words = |s: &str| s.split_whitespace().count() as i64;
        let turns = vec![Turn::system("be brief"), Turn::user("hello there you")];

        // 3 + (4 + 1 + 2) + (4 + 1 + 3)
        assert_eq!(count_with(&turns, 4, -1, words), 18);
        // 3 + (3 + 1 + 2) + (3 + 1 + 3)
        assert_eq!(count_with(&turns, 3, 1, words), 16);

        let mut named = Turn::user("hi");
        named.name = Some("bob".into());
        // 3 + 4 + 1 + 1 + (1 - 1)
        assert_eq!(count_with(&[named], 4, -1, words), 9);
    }

    #[test]
    fn tiktoken_counts_real_text() {
        let counter = TiktokenCounter::new().unwrap();
        let turns = vec![Turn::system("You are a helpful assistant."), Turn::user("Hello!")];
        let n = counter.count_turns("gpt-3.5-turbo", &turns).unwrap();
        assert!(n > 10 && n < 40, "got {n}");

        let err = counter.count_turns("text-davinci-003", &turns).unwrap_err();
        assert!(matches!(err, Error::UnsupportedModel(_)));
    }
}
