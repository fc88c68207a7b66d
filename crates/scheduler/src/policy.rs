//! Historical vs incremental, derived fresh every tick.
//!
//! | Condition                                     | Mode                   |
//! |-----------------------------------------------|------------------------|
//! | never parsed                                  | historical             |
//! | parsed within `staleness_threshold`, has HWM  | incremental            |
//! | last success older than `staleness_threshold` | historical (forced)    |
//! | parsed recently but no watermark (reset)      | historical (forced)    |
//!
//! The incremental lower bound is always the durable watermark minus the
//! overlap margin. `last_parsed_at` only feeds the staleness check.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use chatsync_core::{ParseMode, SchedulerConfig, Source, StorageTimestamp};
use chatsync_fetch::FetchPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoricalReason {
    /// `last_parsed_at` is null.
    NeverParsed,
    /// Last successful attempt is older than the staleness threshold.
    Stale,
    /// Parsed before, but the watermark was administratively reset.
    WatermarkMissing,
}

impl HistoricalReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NeverParsed => "never_parsed",
            Self::Stale => "stale",
            Self::WatermarkMissing => "watermark_missing",
        }
    }

    /// Whether the policy overrode what the parse history alone would pick.
    pub fn is_forced(self) -> bool {
        !matches!(self, Self::NeverParsed)
    }
}

impl fmt::Display for HistoricalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeDecision {
    Historical {
        reason: HistoricalReason,
        /// Oldest instant worth paging back to.
        floor: DateTime<Utc>,
    },
    Incremental {
        since: DateTime<Utc>,
    },
}

impl ModeDecision {
    pub fn mode(&self) -> ParseMode {
        match self {
            Self::Historical { .. } => ParseMode::Historical,
            Self::Incremental { .. } => ParseMode::Incremental,
        }
    }

    pub fn forced_reason(&self) -> Option<HistoricalReason> {
        match self {
            Self::Historical { reason, .. } if reason.is_forced() => Some(*reason),
            _ => None,
        }
    }

    pub fn plan(&self) -> FetchPlan {
        match *self {
            Self::Historical { floor, .. } => FetchPlan::Historical { floor: Some(floor) },
            Self::Incremental { since } => FetchPlan::Incremental { since: Some(since) },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModeDecisionPolicy {
    staleness_threshold: Duration,
    overlap_margin: Duration,
    historical_window: Duration,
}

impl ModeDecisionPolicy {
    pub fn new(staleness_threshold: Duration, overlap_margin: Duration, historical_window: Duration) -> Self {
        Self {
            staleness_threshold,
            overlap_margin,
            historical_window,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(
            to_chrono(config.staleness_threshold),
            to_chrono(config.overlap_margin),
            config.historical_window(),
        )
    }

    pub fn decide(&self, source: &Source, watermark: Option<StorageTimestamp>, now: DateTime<Utc>) -> ModeDecision {
        let watermark = watermark.map(|w| w.to_utc());
        let window_start = now - self.historical_window;

        let Some(last_parsed_at) = source.last_parsed_at else {
            return ModeDecision::Historical {
                reason: HistoricalReason::NeverParsed,
                floor: window_start,
            };
        };

        let Some(watermark) = watermark else {
            return ModeDecision::Historical {
                reason: HistoricalReason::WatermarkMissing,
                floor: window_start,
            };
        };

        let since = watermark - self.overlap_margin;
        if now - last_parsed_at > self.staleness_threshold {
            // Fill the gap, but never page back further than the window.
            return ModeDecision::Historical {
                reason: HistoricalReason::Stale,
                floor: since.max(window_start),
            };
        }

        ModeDecision::Incremental { since }
    }
}

fn to_chrono(d: std::time::Duration) -> Duration {
    Duration::from_std(d).unwrap_or_else(|_| Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap()
    }

    fn policy() -> ModeDecisionPolicy {
        ModeDecisionPolicy::new(Duration::hours(24), Duration::minutes(30), Duration::days(7))
    }

    fn wm(at: DateTime<Utc>) -> Option<StorageTimestamp> {
        Some(StorageTimestamp::normalize(&at))
    }

    #[test]
    fn never_parsed_is_historical_over_the_window() {
        let source = Source::new(Uuid::new_v4(), "chan");
        let decision = policy().decide(&source, None, now());

        assert_eq!(
            decision,
            ModeDecision::Historical {
                reason: HistoricalReason::NeverParsed,
                floor: now() - Duration::days(7),
            }
        );
        assert_eq!(decision.forced_reason(), None);
    }

    #[test]
    fn recent_success_is_incremental_from_watermark_minus_overlap() {
        let source = Source::new(Uuid::new_v4(), "chan").with_last_parsed_at(now() - Duration::hours(1));
        let hwm = now() - Duration::hours(3);

        let decision = policy().decide(&source, wm(hwm), now());

        assert_eq!(decision, ModeDecision::Incremental { since: hwm - Duration::minutes(30) });
        assert_eq!(decision.mode(), ParseMode::Incremental);
    }

    #[test]
    fn since_ignores_when_the_last_attempt_ran() {
        // A zero-result tick moves last_parsed_at but not the watermark.
        let hwm = now() - Duration::hours(5);
        let early = Source::new(Uuid::new_v4(), "chan").with_last_parsed_at(now() - Duration::hours(4));
        let late = early.clone().with_last_parsed_at(now() - Duration::minutes(1));

        assert_eq!(policy().decide(&early, wm(hwm), now()), policy().decide(&late, wm(hwm), now()));
    }

    #[test]
    fn stale_source_is_forced_historical() {
        let source = Source::new(Uuid::new_v4(), "chan").with_last_parsed_at(now() - Duration::hours(48));
        let hwm = now() - Duration::hours(50);

        let decision = policy().decide(&source, wm(hwm), now());

        assert_eq!(
            decision,
            ModeDecision::Historical {
                reason: HistoricalReason::Stale,
                floor: hwm - Duration::minutes(30),
            }
        );
        assert_eq!(decision.forced_reason(), Some(HistoricalReason::Stale));
    }

    #[test]
    fn forced_gap_fill_is_bounded_by_the_window() {
        let source = Source::new(Uuid::new_v4(), "chan").with_last_parsed_at(now() - Duration::days(30));

        let decision = policy().decide(&source, wm(now() - Duration::days(31)), now());

        assert_eq!(decision.plan(), FetchPlan::Historical { floor: Some(now() - Duration::days(7)) });
    }

    #[test]
    fn threshold_boundary_is_still_incremental() {
        let source = Source::new(Uuid::new_v4(), "chan").with_last_parsed_at(now() - Duration::hours(24));
        let decision = policy().decide(&source, wm(now() - Duration::hours(25)), now());
        assert_eq!(decision.mode(), ParseMode::Incremental);
    }

    #[test]
    fn reset_watermark_forces_historical() {
        let source = Source::new(Uuid::new_v4(), "chan").with_last_parsed_at(now() - Duration::minutes(5));

        let decision = policy().decide(&source, None, now());

        assert_eq!(decision.forced_reason(), Some(HistoricalReason::WatermarkMissing));
        assert_eq!(decision.mode(), ParseMode::Historical);
    }

    #[test]
    fn policy_reads_config() {
        let config = SchedulerConfig {
            staleness_threshold: std::time::Duration::from_secs(60),
            ..SchedulerConfig::default()
        };
        let source = Source::new(Uuid::new_v4(), "chan").with_last_parsed_at(now() - Duration::minutes(2));
        let decision = ModeDecisionPolicy::from_config(&config).decide(&source, wm(now()), now());
        assert_eq!(decision.forced_reason(), Some(HistoricalReason::Stale));
    }
}
