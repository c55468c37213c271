//! Per-user usage record and the cost accumulation rules.
//!
//! Every operation takes `today` explicitly so date rollover is deterministic in tests;
//! the file-backed tracker in `ledger.rs` supplies the local calendar date.

use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::{errors::Error, Result};

/// Image sizes in price-table order.
pub const IMAGE_SIZES: [&str; 3] = ["256x256", "512x512", "1024x1024"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageSize {
    Small,
    Medium,
    Large,
}

impl ImageSize {
    /// Position of this size in price tables and per-day count vectors.
    pub fn index(self) -> usize {
        match self {
            ImageSize::Small => 0,
            ImageSize::Medium => 1,
            ImageSize::Large => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        IMAGE_SIZES[self.index()]
    }
}

impl FromStr for ImageSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "256x256" => Ok(ImageSize::Small),
            "512x512" => Ok(ImageSize::Medium),
            "1024x1024" => Ok(ImageSize::Large),
            other => Err(Error::InvalidArgument(format!(
                "unsupported image size {other:?}, expected one of {}",
                IMAGE_SIZES.join(", ")
            ))),
        }
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static price list used to turn usage into cost.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    /// Price per 1000 chat tokens.
    pub token_price: f64,
    /// Price per image, indexed like [`IMAGE_SIZES`].
    pub image_prices: [f64; 3],
    /// Price per minute of transcribed audio.
    pub transcription_price: f64,
}

/// Cost snapshot as persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CostSnapshot {
    pub day: f64,
    pub month: f64,
    pub all_time: f64,
    pub last_update: NaiveDate,
}

/// Date-indexed usage histories.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsageHistory {
    #[serde(default)]
    pub chat_tokens: BTreeMap<NaiveDate, u64>,
    #[serde(default)]
    pub transcription_seconds: BTreeMap<NaiveDate, u64>,
    #[serde(default)]
    pub number_images: BTreeMap<NaiveDate, [u32; 3]>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsageRecord {
    pub user_name: String,
    pub current_cost: CostSnapshot,
    pub usage_history: UsageHistory,
}

/// Cost per accounting window, as seen on a given day.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CurrentCost {
    pub today: f64,
    pub month: f64,
    pub all_time: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeriodCount {
    pub today: u64,
    pub month: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TranscriptionDuration {
    pub today_minutes: u64,
    pub today_seconds: u64,
    pub month_minutes: u64,
    pub month_seconds: u64,
}

impl UsageRecord {
    pub fn new(user_name: impl Into<String>, today: NaiveDate) -> Self {
        Self {
            user_name: user_name.into(),
            current_cost: CostSnapshot {
                day: 0.0,
                month: 0.0,
                all_time: 0.0,
                last_update: today,
            },
            usage_history: UsageHistory::default(),
        }
    }

    /// Parse a persisted record, migrating records written before cost tracking existed.
    ///
    /// A missing `current_cost` (or a missing `all_time` inside it) is rebuilt from the
    /// usage history with `pricing`. Anything else that does not match the schema is rejected.
    pub fn from_json(text: &str, pricing: &Pricing, today: NaiveDate) -> Result<Self> {
        let stored: StoredRecord = serde_json::from_str(text)?;
        let mut record = UsageRecord {
            user_name: stored.user_name,
            current_cost: CostSnapshot {
                day: 0.0,
                month: 0.0,
                all_time: 0.0,
                last_update: today,
            },
            usage_history: stored.usage_history,
        };
        match stored.current_cost {
            Some(StoredCost {
                day,
                month,
                all_time: Some(all_time),
                last_update,
            }) => {
                record.current_cost = CostSnapshot {
                    day,
                    month,
                    all_time,
                    last_update,
                };
            }
            Some(StoredCost {
                day,
                month,
                all_time: None,
                last_update,
            }) => {
                record.current_cost = CostSnapshot {
                    day,
                    month,
                    all_time: 0.0,
                    last_update,
                };
                record.current_cost.all_time = record.all_time_cost(pricing);
            }
            None => {
                record.current_cost.all_time = record.all_time_cost(pricing);
            }
        }
        Ok(record)
    }

    pub fn add_chat_tokens(&mut self, tokens: u64, price_per_1k: f64, today: NaiveDate) -> f64 {
        let cost = round_to(tokens as f64 * price_per_1k / 1000.0, 6);
        self.add_current_costs(cost, today);
        *self.usage_history.chat_tokens.entry(today).or_insert(0) += tokens;
        cost
    }

    pub fn add_transcription_seconds(
        &mut self,
        seconds: u64,
        price_per_minute: f64,
        today: NaiveDate,
    ) -> f64 {
        let cost = round_to(seconds as f64 * price_per_minute / 60.0, 2);
        self.add_current_costs(cost, today);
        *self
            .usage_history
            .transcription_seconds
            .entry(today)
            .or_insert(0) += seconds;
        cost
    }

    /// Count one generated image. Unknown sizes fail before anything is touched.
    pub fn add_image_request(
        &mut self,
        image_size: &str,
        prices: &[f64; 3],
        today: NaiveDate,
    ) -> Result<f64> {
        let idx = image_size.parse::<ImageSize>()?.index();
        let cost = prices[idx];
        self.add_current_costs(cost, today);
        self.usage_history
            .number_images
            .entry(today)
            .or_insert([0, 0, 0])[idx] += 1;
        Ok(cost)
    }

    /// Apply `request_cost` to every accounting window, rolling day/month over on a date change.
    pub fn add_current_costs(&mut self, request_cost: f64, today: NaiveDate) {
        let cc = &mut self.current_cost;
        cc.all_time += request_cost;
        if cc.last_update == today {
            cc.day += request_cost;
            cc.month += request_cost;
            return;
        }

        if same_month(cc.last_update, today) {
            cc.month += request_cost;
        } else {
            cc.month = request_cost;
        }
        cc.day = request_cost;
        cc.last_update = today;
    }

    /// Cost per window as of `today`. Pure projection: stale windows read as zero
    /// but the stored snapshot is left alone until the next cost is added.
    pub fn current_cost(&self, today: NaiveDate) -> CurrentCost {
        let cc = &self.current_cost;
        if cc.last_update == today {
            return CurrentCost {
                today: cc.day,
                month: cc.month,
                all_time: cc.all_time,
            };
        }

        CurrentCost {
            today: 0.0,
            month: if same_month(cc.last_update, today) {
                cc.month
            } else {
                0.0
            },
            all_time: cc.all_time,
        }
    }

    pub fn token_usage(&self, today: NaiveDate) -> PeriodCount {
        aggregate(&self.usage_history.chat_tokens, today, |v| *v)
    }

    pub fn image_usage(&self, today: NaiveDate) -> PeriodCount {
        aggregate(&self.usage_history.number_images, today, |v| {
            v.iter().map(|n| u64::from(*n)).sum()
        })
    }

    pub fn transcription_duration(&self, today: NaiveDate) -> TranscriptionDuration {
        let secs = aggregate(&self.usage_history.transcription_seconds, today, |v| *v);
        TranscriptionDuration {
            today_minutes: secs.today / 60,
            today_seconds: secs.today % 60,
            month_minutes: secs.month / 60,
            month_seconds: secs.month % 60,
        }
    }

    /// Total cost recomputed from the whole history.
    pub fn all_time_cost(&self, pricing: &Pricing) -> f64 {
        let h = &self.usage_history;

        let total_tokens: u64 = h.chat_tokens.values().sum();
        let token_cost = round_to(total_tokens as f64 * pricing.token_price / 1000.0, 6);

        let mut total_images = [0u64; 3];
        for counts in h.number_images.values() {
            for (i, n) in counts.iter().enumerate() {
                total_images[i] += u64::from(*n);
            }
        }
        let image_cost: f64 = total_images
            .iter()
            .zip(pricing.image_prices.iter())
            .map(|(n, price)| *n as f64 * price)
            .sum();

        let total_seconds: u64 = h.transcription_seconds.values().sum();
        let transcription_cost =
            round_to(total_seconds as f64 * pricing.transcription_price / 60.0, 2);

        token_cost + image_cost + transcription_cost
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct StoredRecord {
    user_name: String,
    #[serde(default)]
    current_cost: Option<StoredCost>,
    #[serde(default)]
    usage_history: UsageHistory,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct StoredCost {
    day: f64,
    month: f64,
    #[serde(default)]
    all_time: Option<f64>,
    last_update: NaiveDate,
}

fn aggregate<V>(
    map: &BTreeMap<NaiveDate, V>,
    today: NaiveDate,
    amount: impl Fn(&V) -> u64,
) -> PeriodCount {
    let day = map.get(&today).map(&amount).unwrap_or(0);
    let month = map
        .iter()
        .filter(|(date, _)| same_month(**date, today))
        .map(|(_, v)| amount(v))
        .sum();
    PeriodCount { today: day, month }
}

fn same_month(a: NaiveDate, b: NaiveDate) -> bool {
    a.year() == b.year() && a.month() == b.month()
}

/// Round half away from zero to `decimals` places.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let ratio = 10f64.powi(decimals);
    (value * ratio).round() / ratio
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn pricing() -> Pricing {
        Pricing {
            token_price: 0.002,
            image_prices: [0.016, 0.018, 0.02],
            transcription_price: 0.006,
        }
    }

    #[test]
    fn same_day_costs_sum_into_all_windows() {
        let today = d(2024, 3, 10);
        let mut r = UsageRecord::new("alice", today);
        let mut expected = 0.0;
        for tokens in [1000u64, 250, 4096, 1] {
            expected += r.add_chat_tokens(tokens, 0.002, today);
        }

        let cost = r.current_cost(today);
        assert!((cost.all_time - expected).abs() < 1e-12);
        assert!((cost.today - expected).abs() < 1e-12);
        assert!((cost.month - expected).abs() < 1e-12);
        assert_eq!(r.token_usage(today).today, 5347);
    }

    #[test]
    fn chat_token_cost_is_rounded_to_six_places() {
        let today = d(2024, 3, 10);
        let mut r = UsageRecord::new("alice", today);
        let cost = r.add_chat_tokens(7, 0.0013, today);
        assert_eq!(cost, 0.000009);
    }

    #[test]
    fn read_on_next_day_in_same_month_keeps_month() {
        let mut r = UsageRecord::new("alice", d(2024, 3, 10));
        r.add_chat_tokens(1000, 1.0, d(2024, 3, 10));

        let cost = r.current_cost(d(2024, 3, 11));
        assert_eq!(cost.today, 0.0);
        assert_eq!(cost.month, 1.0);
        assert_eq!(cost.all_time, 1.0);
        // Reads never commit the rollover.
        assert_eq!(r.current_cost.last_update, d(2024, 3, 10));
        assert_eq!(r.current_cost.day, 1.0);
    }

    #[test]
    fn read_across_month_boundary_zeroes_month() {
        let mut r = UsageRecord::new("alice", d(2024, 3, 31));
        r.add_chat_tokens(1000, 1.0, d(2024, 3, 31));

        let cost = r.current_cost(d(2024, 4, 1));
        assert_eq!(cost.today, 0.0);
        assert_eq!(cost.month, 0.0);
        assert_eq!(cost.all_time, 1.0);
    }

    #[test]
    fn write_after_rollover_resets_day_and_month() {
        let mut r = UsageRecord::new("alice", d(2024, 3, 30));
        r.add_current_costs(2.0, d(2024, 3, 30));

        r.add_current_costs(0.5, d(2024, 3, 31));
        assert_eq!(r.current_cost.day, 0.5);
        assert_eq!(r.current_cost.month, 2.5);
        assert_eq!(r.current_cost.last_update, d(2024, 3, 31));

        r.add_current_costs(0.25, d(2024, 4, 1));
        assert_eq!(r.current_cost.day, 0.25);
        assert_eq!(r.current_cost.month, 0.25);
        assert_eq!(r.current_cost.all_time, 2.75);
    }

    #[test]
    fn same_month_number_in_another_year_is_not_same_month() {
        let mut r = UsageRecord::new("alice", d(2023, 4, 2));
        r.add_current_costs(1.0, d(2023, 4, 2));
        assert_eq!(r.current_cost(d(2024, 4, 2)).month, 0.0);
    }

    #[test]
    fn image_request_adds_price_and_counts_size() {
        let today = d(2024, 3, 10);
        let mut r = UsageRecord::new("alice", today);
        let cost = r
            .add_image_request("512x512", &[0.01, 0.02, 0.03], today)
            .unwrap();

        assert_eq!(cost, 0.02);
        let cc = r.current_cost(today);
        assert_eq!((cc.today, cc.month, cc.all_time), (0.02, 0.02, 0.02));
        assert_eq!(r.usage_history.number_images[&today], [0, 1, 0]);
        assert_eq!(r.image_usage(today), PeriodCount { today: 1, month: 1 });
    }

    #[test]
    fn unknown_image_size_is_rejected_without_side_effects() {
        let today = d(2024, 3, 10);
        let mut r = UsageRecord::new("alice", today);
        let err = r
            .add_image_request("640x480", &[0.01, 0.02, 0.03], today)
            .unwrap_err();

        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(r, UsageRecord::new("alice", today));
    }

    #[test]
    fn transcription_is_split_into_minutes_and_seconds() {
        let mut r = UsageRecord::new("alice", d(2024, 3, 1));
        r.add_transcription_seconds(75, 0.006, d(2024, 3, 1));
        r.add_transcription_seconds(50, 0.006, d(2024, 3, 10));
        r.add_transcription_seconds(20, 0.006, d(2024, 3, 10));
        r.add_transcription_seconds(600, 0.006, d(2024, 2, 28));

        let t = r.transcription_duration(d(2024, 3, 10));
        assert_eq!(
            t,
            TranscriptionDuration {
                today_minutes: 1,
                today_seconds: 10,
                month_minutes: 2,
                month_seconds: 25,
            }
        );
    }

    #[test]
    fn transcription_cost_is_rounded_to_cents() {
        let today = d(2024, 3, 1);
        let mut r = UsageRecord::new("alice", today);
        assert_eq!(r.add_transcription_seconds(90, 0.006, today), 0.01);
    }

    #[test]
    fn all_time_cost_recomputes_from_history() {
        let today = d(2024, 3, 10);
        let mut r = UsageRecord::new("alice", today);
        r.usage_history.chat_tokens.insert(d(2024, 1, 1), 1500);
        r.usage_history.chat_tokens.insert(d(2024, 2, 1), 500);
        r.usage_history.number_images.insert(d(2024, 2, 1), [1, 0, 2]);
        r.usage_history
            .transcription_seconds
            .insert(d(2024, 2, 2), 600);

        let total = r.all_time_cost(&pricing());
        let expected = 0.004 + 0.016 + 2.0 * 0.02 + 0.06;
        assert!((total - expected).abs() < 1e-9, "got {total}");
    }

    #[test]
    fn legacy_record_without_all_time_is_backfilled() {
        let txt = r#"{
          "user_name": "bob",
          "current_cost": {"day": 0.1, "month": 0.2, "last_update": "2024-03-09"},
          "usage_history": {"chat_tokens": {"2024-03-09": 1000}}
        }"#;
        let r = UsageRecord::from_json(txt, &pricing(), d(2024, 3, 10)).unwrap();
        assert_eq!(r.current_cost.day, 0.1);
        assert_eq!(r.current_cost.all_time, 0.002);
    }

    #[test]
    fn legacy_record_without_cost_snapshot_is_migrated() {
        let txt = r#"{"user_name": "bob", "usage_history": {"number_images": {"2024-03-01": [0, 0, 1]}}}"#;
        let r = UsageRecord::from_json(txt, &pricing(), d(2024, 3, 10)).unwrap();
        assert_eq!(r.current_cost.last_update, d(2024, 3, 10));
        assert_eq!(r.current_cost.all_time, 0.02);
    }

    #[test]
    fn malformed_record_is_rejected() {
        let txt = r#"{"user_name": "bob", "usage_history": {"chat_tokens": {"2024-03-01": "lots"}}}"#;
        assert!(UsageRecord::from_json(txt, &pricing(), d(2024, 3, 10)).is_err());
    }
}
