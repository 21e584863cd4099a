use std::time::Duration;

use serde::Deserialize;

/// Lower bound for the housekeeping cadence, mostly to keep a zero
/// `refresh_interval` from producing a zero-length tick.
const MIN_TICK: Duration = Duration::from_millis(10);

/// Fine-tuning for a [`BackgroundCache`](crate::BackgroundCache).
///
/// Durations deserialize in humantime format (`5s`, `1m`, …). The defaults
/// match a cache fronting filesystem-backed lookups: refresh recently used
/// entries every few seconds, drop anything untouched for a minute.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Age at which an entry becomes eligible for a background refresh.
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,

    /// Age at which an entry is evicted outright, even while a refresh for
    /// it is in flight. Must be greater than `refresh_interval`.
    #[serde(with = "humantime_serde")]
    pub expiration_age: Duration,

    /// Cadence of the scheduler's expiration sweep.
    ///
    /// Defaults to a fifth of the smaller of `refresh_interval` and
    /// `expiration_age`.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Option<Duration>,

    /// Maximum number of background refreshes in flight at once.
    ///
    /// A refresh that does not fit the budget is skipped; the entry stays
    /// eligible and a later access re-requests it.
    pub max_concurrent_refreshes: isize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(5),
            expiration_age: Duration::from_secs(60),
            tick_interval: None,
            max_concurrent_refreshes: 20,
        }
    }
}

impl CacheConfig {
    pub(crate) fn tick(&self) -> Duration {
        self.tick_interval
            .unwrap_or_else(|| self.refresh_interval.min(self.expiration_age) / 5)
            .max(MIN_TICK)
    }

    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.expiration_age > self.refresh_interval,
            "expiration_age ({:?}) must be greater than refresh_interval ({:?})",
            self.expiration_age,
            self.refresh_interval,
        );
        anyhow::ensure!(
            self.max_concurrent_refreshes > 0,
            "max_concurrent_refreshes must be positive",
        );
        Ok(())
    }
}
