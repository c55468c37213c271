use std::sync::Arc;

use gtb_openai::OpenAiClient;

use gtb_core::{
    config::Config, model::tokens::TiktokenCounter, session::ChatSession, usage::UsageLedger,
};

#[tokio::main]
async fn main() -> Result<(), gtb_core::Error> {
    gtb_core::logging::init("gtb")?;

    let cfg = Arc::new(Config::load()?);

    let client = Arc::new(OpenAiClient::new(
        cfg.openai_api_key.clone(),
        cfg.request_timeout,
    )?);
    let counter = Arc::new(TiktokenCounter::new()?);
    let ledger = Arc::new(UsageLedger::new(
        cfg.usage_logs_dir.clone(),
        cfg.pricing.clone(),
    ));
    tracing::info!(usage_logs_dir = %cfg.usage_logs_dir.display(), "usage ledger ready");

    let session = Arc::new(ChatSession::new(cfg.clone(), client, counter, ledger));

    gtb_telegram::router::run_polling(cfg, session)
        .await
        .map_err(|e| gtb_core::Error::RemoteCallFailed(format!("telegram bot failed: {e}")))?;

    Ok(())
}
