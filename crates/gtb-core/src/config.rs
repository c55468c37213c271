use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    budget::{BudgetPeriod, BudgetPolicy, IdList},
    errors::Error,
    usage::{ImageSize, Pricing},
    Result,
};

/// Typed configuration for the bot.
///
/// Every field has an environment variable; only the two tokens are required.
#[derive(Clone, Debug)]
pub struct Config {
    // Core
    pub telegram_bot_token: String,
    pub openai_api_key: String,

    // Completion
    pub model: String,
    pub max_tokens: u32,
    pub n_choices: u32,
    pub temperature: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub assistant_prompt: String,
    pub stream: bool,
    pub show_usage: bool,
    pub image_size: ImageSize,

    // Conversation policy
    pub max_history_size: usize,
    pub max_conversation_age: Duration,

    // Pricing / budgets
    pub pricing: Pricing,
    pub budget: BudgetPolicy,
    pub usage_logs_dir: PathBuf,

    // Runtime constants
    pub temp_dir: PathBuf,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,

    // Telegram
    pub telegram_safe_limit: usize,
    pub streaming_throttle: Duration,
    pub enable_quoting: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        // Required env vars
        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }
        let openai_api_key = env_str("OPENAI_API_KEY").unwrap_or_default();
        if openai_api_key.trim().is_empty() {
            return Err(Error::Config(
                "OPENAI_API_KEY environment variable is required".to_string(),
            ));
        }

        // Completion parameters
        let model = env_str("OPENAI_MODEL")
            .and_then(non_empty)
            .unwrap_or_else(|| "gpt-3.5-turbo".to_string());
        let max_tokens = env_u32("MAX_TOKENS").unwrap_or(1200);
        let n_choices = env_u32("N_CHOICES").unwrap_or(1).max(1);
        let temperature = env_f32("TEMPERATURE").unwrap_or(1.0);
        let presence_penalty = env_f32("PRESENCE_PENALTY").unwrap_or(0.0);
        let frequency_penalty = env_f32("FREQUENCY_PENALTY").unwrap_or(0.0);
        let assistant_prompt = env_str("ASSISTANT_PROMPT")
            .and_then(non_empty)
            .unwrap_or_else(|| "You are a helpful assistant.".to_string());
        let stream = env_bool("STREAM").unwrap_or(true);
        let show_usage = env_bool("SHOW_USAGE").unwrap_or(false);
        let image_size = env_str("IMAGE_SIZE")
            .unwrap_or_else(|| "512x512".to_string())
            .parse::<ImageSize>()
            .map_err(|e| Error::Config(format!("IMAGE_SIZE: {e}")))?;

        // Conversation policy
        let max_history_size = env_usize("MAX_HISTORY_SIZE").unwrap_or(15).max(1);
        let max_conversation_age =
            Duration::from_secs(env_u64("MAX_CONVERSATION_AGE_MINUTES").unwrap_or(180) * 60);

        // Pricing
        let image_prices = parse_csv_f64(env_str("IMAGE_PRICES"))
            .map_err(|e| Error::Config(format!("IMAGE_PRICES: {e}")))?
            .unwrap_or_else(|| vec![0.016, 0.018, 0.02]);
        let image_prices: [f64; 3] = image_prices.try_into().map_err(|v: Vec<f64>| {
            Error::Config(format!(
                "IMAGE_PRICES must list exactly 3 prices (256x256,512x512,1024x1024), got {}",
                v.len()
            ))
        })?;
        let pricing = Pricing {
            token_price: env_f64("TOKEN_PRICE").unwrap_or(0.002),
            image_prices,
            transcription_price: env_f64("TRANSCRIPTION_PRICE").unwrap_or(0.006),
        };

        // Budgets
        let period = env_str("BUDGET_PERIOD")
            .unwrap_or_else(|| "monthly".to_string())
            .parse::<BudgetPeriod>()
            .map_err(|e| Error::Config(format!("BUDGET_PERIOD: {e}")))?;
        let budget = BudgetPolicy {
            admin_user_ids: IdList::parse_admins(&env_str("ADMIN_USER_IDS").unwrap_or_default()),
            allowed_user_ids: IdList::parse(
                &env_str("ALLOWED_TELEGRAM_USER_IDS").unwrap_or_else(|| "*".to_string()),
            ),
            user_budgets: IdList::parse(&env_str("USER_BUDGETS").unwrap_or_else(|| "*".to_string())),
            guest_budget: env_f64("GUEST_BUDGET").unwrap_or(100.0),
            period,
        };
        let usage_logs_dir =
            PathBuf::from(env_str("USAGE_LOGS_DIR").unwrap_or("usage_logs".to_string()));

        // Timeouts and constants
        let temp_dir = PathBuf::from(env_str("TEMP_DIR").unwrap_or("/tmp/gtb".to_string()));
        fs::create_dir_all(&temp_dir)?;
        let request_timeout = Duration::from_secs(env_u64("REQUEST_TIMEOUT_SECS").unwrap_or(120));
        let stream_idle_timeout =
            Duration::from_secs(env_u64("STREAM_IDLE_TIMEOUT_SECS").unwrap_or(60));

        // Telegram limits
        let telegram_safe_limit = env_usize("TELEGRAM_SAFE_LIMIT").unwrap_or(4000);
        let streaming_throttle =
            Duration::from_millis(env_u64("STREAMING_THROTTLE_MS").unwrap_or(800));
        let enable_quoting = env_bool("ENABLE_QUOTING").unwrap_or(true);

        Ok(Self {
            telegram_bot_token,
            openai_api_key,
            model,
            max_tokens,
            n_choices,
            temperature,
            presence_penalty,
            frequency_penalty,
            assistant_prompt,
            stream,
            show_usage,
            image_size,
            max_history_size,
            max_conversation_age,
            pricing,
            budget,
            usage_logs_dir,
            temp_dir,
            request_timeout,
            stream_idle_timeout,
            telegram_safe_limit,
            streaming_throttle,
            enable_quoting,
        })
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_f64(key: &str) -> Option<f64> {
    env_str(key).and_then(|s| s.trim().parse::<f64>().ok())
}

fn env_f32(key: &str) -> Option<f32> {
    env_str(key).and_then(|s| s.trim().parse::<f32>().ok())
}

fn parse_csv_f64(v: Option<String>) -> std::result::Result<Option<Vec<f64>>, String> {
    let Some(v) = v.and_then(non_empty) else {
        return Ok(None);
    };
    v.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<f64>().map_err(|e| format!("{s:?}: {e}")))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map(Some)
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
