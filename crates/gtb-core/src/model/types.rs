use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{errors::Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message of a conversation history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Model families with distinct context sizes and message framing overhead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelFamily {
    Gpt35,
    Gpt35Ctx16k,
    Gpt4,
    Gpt4Ctx32k,
    Gpt4Turbo,
}

const GPT_35: &[&str] = &["gpt-3.5-turbo", "gpt-3.5-turbo-0301", "gpt-3.5-turbo-0613"];
const GPT_35_16K: &[&str] = &[
    "gpt-3.5-turbo-16k",
    "gpt-3.5-turbo-16k-0613",
    "gpt-3.5-turbo-1106",
    "gpt-3.5-turbo-0125",
];
const GPT_4: &[&str] = &["gpt-4", "gpt-4-0314", "gpt-4-0613"];
const GPT_4_32K: &[&str] = &["gpt-4-32k", "gpt-4-32k-0314", "gpt-4-32k-0613"];
const GPT_4_TURBO: &[&str] = &[
    "gpt-4-turbo",
    "gpt-4-turbo-preview",
    "gpt-4-1106-preview",
    "gpt-4-0125-preview",
    "gpt-4o",
    "gpt-4o-mini",
];

impl ModelFamily {
    pub fn of(model: &str) -> Result<Self> {
        let m = model.trim();
        let family = if GPT_35.contains(&m) {
            ModelFamily::Gpt35
        } else if GPT_35_16K.contains(&m) {
            ModelFamily::Gpt35Ctx16k
        } else if GPT_4.contains(&m) {
            ModelFamily::Gpt4
        } else if GPT_4_32K.contains(&m) {
            ModelFamily::Gpt4Ctx32k
        } else if GPT_4_TURBO.contains(&m) {
            ModelFamily::Gpt4Turbo
        } else {
            return Err(Error::UnsupportedModel(model.to_string()));
        };
        Ok(family)
    }

    /// Context window in tokens (prompt + response).
    pub fn context_size(self) -> usize {
        match self {
            ModelFamily::Gpt35 => 4096,
            ModelFamily::Gpt35Ctx16k => 16384,
            ModelFamily::Gpt4 => 8192,
            ModelFamily::Gpt4Ctx32k => 32768,
            ModelFamily::Gpt4Turbo => 128_000,
        }
    }

    /// `(tokens_per_message, tokens_per_name)` framing overhead.
    pub fn message_overhead(self) -> (i64, i64) {
        match self {
            ModelFamily::Gpt35 | ModelFamily::Gpt35Ctx16k => (4, -1),
            ModelFamily::Gpt4 | ModelFamily::Gpt4Ctx32k | ModelFamily::Gpt4Turbo => (3, 1),
        }
    }
}

/// Sampling parameters shared by every completion call.
#[derive(Clone, Debug, PartialEq)]
pub struct CompletionParams {
    pub model: String,
    pub max_tokens: u32,
    pub n: u32,
    pub temperature: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
}

#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub params: CompletionParams,
    pub messages: Vec<Turn>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Clone, Debug, Default)]
pub struct Completion {
    pub choices: Vec<String>,
    /// Reported by the API for single-shot calls; absent when streaming.
    pub usage: Option<TokenUsage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families_resolve() {
        assert_eq!(ModelFamily::of("gpt-3.5-turbo").unwrap(), ModelFamily::Gpt35);
        assert_eq!(ModelFamily::of("gpt-4-32k").unwrap().context_size(), 32768);
        assert_eq!(ModelFamily::of("gpt-4o").unwrap().message_overhead(), (3, 1));
        assert!(matches!(
            ModelFamily::of("davinci"),
            Err(Error::UnsupportedModel(_))
        ));
    }

    #[test]
    fn turns_serialize_like_the_api() {
        let v = serde_json::to_value(Turn::user("hi")).unwrap();
        assert_eq!(v, serde_json::json!({"role": "user", "content": "hi"}));
    }
}
