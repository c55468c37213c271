/// Core error type for the bot.
///
/// Adapter crates map their specific errors into this type so the bot core can
/// tell user-facing rejections apart from failures of the remote API or storage.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("budget exceeded for user {user_id}: remaining {remaining:.4}")]
    BudgetExceeded { user_id: i64, remaining: f64 },

    #[error("summarization failed: {0}")]
    SummarizationFailed(String),

    #[error("remote call failed: {0}")]
    RemoteCallFailed(String),

    #[error("persistence failed: {0}")]
    PersistenceFailed(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the failure should be shown to the user as a rejection rather than an error.
    pub fn is_user_rejection(&self) -> bool {
        matches!(self, Error::BudgetExceeded { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
