//! File-backed usage ledger: one JSON file per user, rewritten on every mutation.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{Local, NaiveDate};
use tokio::sync::Mutex;

use crate::{domain::UserId, errors::Error, Result};

use super::record::{
    CurrentCost, PeriodCount, Pricing, TranscriptionDuration, UsageRecord,
};

fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// One user's record plus the file it lives in.
///
/// Mutations are applied to a copy that only replaces the in-memory record once the
/// write succeeded, so a failed write never leaves unpersisted cost behind.
#[derive(Debug)]
pub struct UsageTracker {
    user_id: UserId,
    path: PathBuf,
    record: UsageRecord,
}

impl UsageTracker {
    /// Load `<dir>/<user_id>.json`, or start an empty record if the file does not exist yet.
    pub fn open(
        dir: &Path,
        user_id: UserId,
        user_name: &str,
        pricing: &Pricing,
        today: NaiveDate,
    ) -> Result<Self> {
        let path = dir.join(format!("{}.json", user_id.0));
        let record = if path.exists() {
            let txt = fs::read_to_string(&path).map_err(|e| {
                Error::PersistenceFailed(format!("read {}: {e}", path.display()))
            })?;
            UsageRecord::from_json(&txt, pricing, today).map_err(|e| {
                Error::PersistenceFailed(format!("invalid usage record {}: {e}", path.display()))
            })?
        } else {
            fs::create_dir_all(dir).map_err(|e| {
                Error::PersistenceFailed(format!("create {}: {e}", dir.display()))
            })?;
            UsageRecord::new(user_name, today)
        };

        Ok(Self {
            user_id,
            path,
            record,
        })
    }

    pub fn record(&self) -> &UsageRecord {
        &self.record
    }

    pub fn record_chat_tokens(&mut self, tokens: u64, price_per_1k: f64) -> Result<f64> {
        self.record_chat_tokens_on(tokens, price_per_1k, today())
    }

    pub fn record_chat_tokens_on(
        &mut self,
        tokens: u64,
        price_per_1k: f64,
        today: NaiveDate,
    ) -> Result<f64> {
        self.commit(|r| Ok(r.add_chat_tokens(tokens, price_per_1k, today)))
    }

    pub fn record_transcription_seconds(
        &mut self,
        seconds: u64,
        price_per_minute: f64,
    ) -> Result<f64> {
        self.record_transcription_seconds_on(seconds, price_per_minute, today())
    }

    pub fn record_transcription_seconds_on(
        &mut self,
        seconds: u64,
        price_per_minute: f64,
        today: NaiveDate,
    ) -> Result<f64> {
        self.commit(|r| Ok(r.add_transcription_seconds(seconds, price_per_minute, today)))
    }

    pub fn record_image_request(&mut self, image_size: &str, prices: &[f64; 3]) -> Result<f64> {
        self.record_image_request_on(image_size, prices, today())
    }

    pub fn record_image_request_on(
        &mut self,
        image_size: &str,
        prices: &[f64; 3],
        today: NaiveDate,
    ) -> Result<f64> {
        self.commit(|r| r.add_image_request(image_size, prices, today))
    }

    pub fn current_cost(&self) -> CurrentCost {
        self.record.current_cost(today())
    }

    pub fn token_usage(&self) -> PeriodCount {
        self.record.token_usage(today())
    }

    pub fn image_usage(&self) -> PeriodCount {
        self.record.image_usage(today())
    }

    pub fn transcription_duration(&self) -> TranscriptionDuration {
        self.record.transcription_duration(today())
    }

    pub fn all_time_cost(&self, pricing: &Pricing) -> f64 {
        self.record.all_time_cost(pricing)
    }

    fn commit<T>(&mut self, apply: impl FnOnce(&mut UsageRecord) -> Result<T>) -> Result<T> {
        let mut next = self.record.clone();
        let out = apply(&mut next)?;
        write_record(&self.path, &next)?;
        tracing::debug!(
            user_id = self.user_id.0,
            all_time = next.current_cost.all_time,
            "usage record written"
        );
        self.record = next;
        Ok(out)
    }
}

/// Whole-record rewrite via a sibling temp file so readers never observe a torn record.
fn write_record(path: &Path, record: &UsageRecord) -> Result<()> {
    let txt = serde_json::to_string_pretty(record)
        .map_err(|e| Error::PersistenceFailed(format!("encode {}: {e}", path.display())))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, txt)
        .map_err(|e| Error::PersistenceFailed(format!("write {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path)
        .map_err(|e| Error::PersistenceFailed(format!("replace {}: {e}", path.display())))?;
    Ok(())
}

/// Keyed store of per-user trackers.
///
/// Each tracker sits behind its own lock so the read-modify-write of the
/// accumulation rule is serialized per user while different users proceed in parallel.
pub struct UsageLedger {
    dir: PathBuf,
    pricing: Pricing,
    trackers: Mutex<HashMap<UserId, Arc<Mutex<UsageTracker>>>>,
}

impl UsageLedger {
    pub fn new(dir: impl Into<PathBuf>, pricing: Pricing) -> Self {
        Self {
            dir: dir.into(),
            pricing,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    pub fn pricing(&self) -> &Pricing {
        &self.pricing
    }

    /// Tracker for `user_id`, loaded from disk on first use.
    pub async fn tracker(
        &self,
        user_id: UserId,
        user_name: &str,
    ) -> Result<Arc<Mutex<UsageTracker>>> {
        let mut map = self.trackers.lock().await;
        if let Some(t) = map.get(&user_id) {
            return Ok(t.clone());
        }
        let tracker = UsageTracker::open(&self.dir, user_id, user_name, &self.pricing, today())?;
        let tracker = Arc::new(Mutex::new(tracker));
        map.insert(user_id, tracker.clone());
        Ok(tracker)
    }

    pub async fn record_chat_tokens(
        &self,
        user_id: UserId,
        user_name: &str,
        tokens: u64,
    ) -> Result<f64> {
        let tracker = self.tracker(user_id, user_name).await?;
        let mut t = tracker.lock().await;
        t.record_chat_tokens(tokens, self.pricing.token_price)
    }

    pub async fn record_transcription_seconds(
        &self,
        user_id: UserId,
        user_name: &str,
        seconds: u64,
    ) -> Result<f64> {
        let tracker = self.tracker(user_id, user_name).await?;
        let mut t = tracker.lock().await;
        t.record_transcription_seconds(seconds, self.pricing.transcription_price)
    }

    pub async fn record_image_request(
        &self,
        user_id: UserId,
        user_name: &str,
        image_size: &str,
    ) -> Result<f64> {
        let tracker = self.tracker(user_id, user_name).await?;
        let mut t = tracker.lock().await;
        t.record_image_request(image_size, &self.pricing.image_prices)
    }

    pub async fn current_cost(&self, user_id: UserId, user_name: &str) -> Result<CurrentCost> {
        let tracker = self.tracker(user_id, user_name).await?;
        let t = tracker.lock().await;
        Ok(t.current_cost())
    }

    /// Aggregated view used by `/stats`.
    pub async fn report(&self, user_id: UserId, user_name: &str) -> Result<UsageReport> {
        let tracker = self.tracker(user_id, user_name).await?;
        let t = tracker.lock().await;
        Ok(UsageReport {
            cost: t.current_cost(),
            tokens: t.token_usage(),
            images: t.image_usage(),
            transcription: t.transcription_duration(),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UsageReport {
    pub cost: CurrentCost,
    pub tokens: PeriodCount,
    pub images: PeriodCount,
    pub transcription: TranscriptionDuration,
}
