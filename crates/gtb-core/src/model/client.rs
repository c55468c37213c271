use std::path::Path;

use async_trait::async_trait;

use crate::{usage::ImageSize, Result};

use super::types::*;

/// Remote completion service used by the session orchestrator.
///
/// Streaming is callback-based: the implementation drives its own read loop and hands
/// every content delta to `on_delta`. An error returned from the callback aborts the call.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, req: CompletionRequest) -> Result<Completion>;

    /// Stream the first choice. Returns the full concatenated text.
    async fn complete_stream(
        &self,
        req: CompletionRequest,
        on_delta: &mut (dyn for<'a> FnMut(&'a str) -> Result<()> + Send),
    ) -> Result<String>;

    /// Compress `turns` into a short text.
    async fn summarize(&self, model: &str, turns: &[Turn]) -> Result<String>;

    /// Returns the URL of the generated image.
    async fn generate_image(&self, prompt: &str, size: ImageSize) -> Result<String>;

    async fn transcribe(&self, audio: &Path) -> Result<String>;
}

/// Messages sent to the model to compress a conversation.
pub fn summary_messages(turns: &[Turn]) -> Result<Vec<Turn>> {
    let transcript = serde_json::to_string(turns)?;
    Ok(vec![
        Turn::assistant(SUMMARY_INSTRUCTION),
        Turn::user(transcript),
    ])
}

pub const SUMMARY_INSTRUCTION: &str = "Summarize this conversation in 700 characters or less";
pub const SUMMARY_TEMPERATURE: f32 = 0.4;
