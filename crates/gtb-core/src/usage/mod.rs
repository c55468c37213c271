mod ledger;
mod record;

pub use ledger::{UsageLedger, UsageReport, UsageTracker};
pub use record::{
    round_to, CostSnapshot, CurrentCost, ImageSize, PeriodCount, Pricing, TranscriptionDuration,
    UsageHistory, UsageRecord, IMAGE_SIZES,
};
