//! Limit evaluation
//!
//! Pure functions over a [`QuotaRecord`]; the gate wraps them in a
//! compare-and-swap loop against the store.

use chrono::{DateTime, Duration, Utc};
use slipway_core::{AdmissionKind, QuotaBreach, QuotaRecord};

/// A tripped limit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breach {
    /// Which limit
    pub kind: QuotaBreach,
    /// Human-readable reason, stored as the sticky reason
    pub message: String,
}

/// Reset every window whose period has elapsed.
///
/// Hourly and daily windows are rolling from their start; the monthly
/// window follows the UTC calendar month. A sticky flag set by a breach of
/// a rolled window is cleared with it. Returns whether anything changed.
pub fn roll_windows(record: &mut QuotaRecord, now: DateTime<Utc>) -> bool {
    let mut rolled = Vec::new();

    if now - record.hour_window_start >= Duration::hours(1) {
        record.requests_this_hour = 0;
        record.hour_window_start = now;
        rolled.push(QuotaBreach::HourlyRate);
    }

    if now - record.day_window_start >= Duration::days(1) {
        record.builds_today = 0;
        record.day_window_start = now;
        rolled.push(QuotaBreach::DailyBuilds);
    }

    if record.month_elapsed(now) {
        record.tokens_used_this_month = 0;
        record.cost_this_month = rust_decimal::Decimal::ZERO;
        record.month_window_start = now;
        rolled.push(QuotaBreach::MonthlyTokens);
        rolled.push(QuotaBreach::MonthlyCost);
    }

    if let Some(breach) = record.exceeded_breach {
        if rolled.contains(&breach) {
            tracing::info!(user_id = %record.user_id, %breach, "quota window rolled over");
            record.clear_exceeded();
        }
    }

    !rolled.is_empty()
}

/// Check limits in order: sticky flag, monthly tokens, monthly cost,
/// concurrent instances (deploys), daily builds (builds), hourly rate.
#[must_use]
pub fn evaluate(record: &QuotaRecord, kind: AdmissionKind) -> Option<Breach> {
    let limits = &record.limits;

    if record.exceeded {
        let message = record
            .exceeded_reason
            .clone()
            .unwrap_or_else(|| "quota exceeded".to_string());
        return Some(Breach {
            kind: record.exceeded_breach.unwrap_or(QuotaBreach::Sticky),
            message,
        });
    }

    if record.tokens_used_this_month >= limits.monthly_token_limit {
        return Some(Breach {
            kind: QuotaBreach::MonthlyTokens,
            message: format!(
                "monthly token limit reached ({} of {})",
                record.tokens_used_this_month, limits.monthly_token_limit
            ),
        });
    }

    if record.cost_this_month >= limits.monthly_cost_limit {
        return Some(Breach {
            kind: QuotaBreach::MonthlyCost,
            message: format!(
                "monthly cost limit reached (${} of ${})",
                record.cost_this_month.round_dp(2),
                limits.monthly_cost_limit.round_dp(2)
            ),
        });
    }

    if kind == AdmissionKind::DeployInstance
        && record.active_instances >= limits.concurrent_instance_limit
    {
        return Some(Breach {
            kind: QuotaBreach::ConcurrentInstances,
            message: format!(
                "concurrent instance limit reached ({} of {})",
                record.active_instances, limits.concurrent_instance_limit
            ),
        });
    }

    if kind == AdmissionKind::Build && record.builds_today >= limits.builds_per_day {
        return Some(Breach {
            kind: QuotaBreach::DailyBuilds,
            message: format!(
                "daily build limit reached ({} of {})",
                record.builds_today, limits.builds_per_day
            ),
        });
    }

    if record.requests_this_hour >= limits.requests_per_hour {
        return Some(Breach {
            kind: QuotaBreach::HourlyRate,
            message: format!(
                "hourly request limit reached ({} of {})",
                record.requests_this_hour, limits.requests_per_hour
            ),
        });
    }

    None
}

/// `record` as seen by a deploy that replaces one of the user's live
/// instances: that instance's slot is handed over, and a sticky
/// concurrency breach does not apply.
#[must_use]
pub fn handed_over(record: &QuotaRecord) -> QuotaRecord {
    let mut view = record.clone();
    view.active_instances = view.active_instances.saturating_sub(1);
    if view.exceeded_breach == Some(QuotaBreach::ConcurrentInstances) {
        view.clear_exceeded();
    }
    view
}

/// Count an admitted replacement; the slot count stays as it is
pub fn apply_replacement(record: &mut QuotaRecord) {
    record.requests_this_hour = record.requests_this_hour.saturating_add(1);
}

/// Count an admitted operation against its windows
pub fn apply_admission(record: &mut QuotaRecord, kind: AdmissionKind) {
    record.requests_this_hour = record.requests_this_hour.saturating_add(1);
    match kind {
        AdmissionKind::Build => record.builds_today = record.builds_today.saturating_add(1),
        AdmissionKind::DeployInstance => {
            record.active_instances = record.active_instances.saturating_add(1);
        }
        AdmissionKind::AiRequest => {}
    }
}
