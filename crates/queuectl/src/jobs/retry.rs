use crate::jobs::outcome::Transition;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

/// Largest delay that still fits a chrono `Duration`. Only reached when
/// `base^attempts` itself overflows; there is no policy cap.
const MAX_REPRESENTABLE_DELAY_SECS: i64 = i64::MAX / 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub backoff_base: i64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { backoff_base: 2 }
    }
}

/// `backoff_base ^ attempts` seconds, where `attempts` already counts the
/// failure being scheduled (first retry waits `base^1`).
///
/// Saturates instead of overflowing; the second value reports saturation.
pub fn next_delay_seconds(attempts: i64, cfg: &RetryConfig) -> (i64, bool) {
    let base = cfg.backoff_base.max(1);
    let exp = u32::try_from(attempts.max(0)).unwrap_or(u32::MAX);

    match base.checked_pow(exp) {
        Some(delay) if delay <= MAX_REPRESENTABLE_DELAY_SECS => (delay, false),
        _ => (MAX_REPRESENTABLE_DELAY_SECS, true),
    }
}

/// Decide what a failed attempt does to a job that had `attempts_before`
/// failures and a budget of `max_retries`.
pub fn on_failure(
    attempts_before: i64,
    max_retries: i64,
    cfg: &RetryConfig,
    now: DateTime<Utc>,
) -> Transition {
    let attempts = attempts_before + 1;

    if attempts >= max_retries {
        return Transition::Dead { attempts };
    }

    let (delay_secs, saturated) = next_delay_seconds(attempts, cfg);
    if saturated {
        tracing::warn!(
            attempts,
            backoff_base = cfg.backoff_base,
            "backoff delay overflowed; retry scheduled at the latest representable time"
        );
    }

    let ceiling = latest_schedulable();
    let next_retry_at = Duration::try_seconds(delay_secs)
        .and_then(|d| now.checked_add_signed(d))
        .filter(|at| *at <= ceiling)
        .unwrap_or(ceiling);

    Transition::Retry {
        attempts,
        next_retry_at,
    }
}

/// Timestamps are stored as RFC 3339 text and compared as strings, which
/// only orders correctly for four-digit years.
fn latest_schedulable() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .and_then(|d| d.and_hms_opt(23, 59, 59))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
