// libs/scheduling-cell/src/services/policy.rs
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};

use crate::models::{
    BusinessWindow, Hospital, SessionError, SessionWindow, TherapyTypeConfig,
};

/// Pure queries over a tenant's configuration. No I/O; callers fetch the
/// `Hospital` read model once per operation and pass it in.
pub struct PolicyResolver;

/// Canonical form of a therapy type: lowercase, trimmed, inner whitespace
/// collapsed to underscores. All comparisons and storage use this key.
pub fn normalize_therapy_key(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

pub fn weekday_key(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

impl PolicyResolver {
    /// The single place the effective window `[start, start + duration +
    /// buffer)` is computed; creation, modification, reschedule validation
    /// and the worker all go through here.
    pub fn effective_window(
        scheduled_at: DateTime<Utc>,
        duration_minutes: i32,
        buffer_minutes: i32,
    ) -> SessionWindow {
        SessionWindow {
            start: scheduled_at,
            end: scheduled_at
                + Duration::minutes(duration_minutes as i64)
                + Duration::minutes(buffer_minutes as i64),
        }
    }

    pub fn business_window(hospital: &Hospital, weekday: Weekday) -> Option<BusinessWindow> {
        hospital.business_hours.get(weekday_key(weekday)).copied()
    }

    pub fn is_blackout(hospital: &Hospital, date: NaiveDate) -> bool {
        hospital.blackout_dates.contains(&date)
    }

    /// Whether the hospital is open for business at the given instant.
    pub fn is_open(hospital: &Hospital, at: DateTime<Utc>) -> bool {
        if Self::is_blackout(hospital, at.date_naive()) {
            return false;
        }
        match Self::business_window(hospital, at.weekday()) {
            Some(window) => {
                let time = at.time();
                time >= window.open && time < window.close
            }
            None => false,
        }
    }

    /// Tenant configuration for a therapy type; absent types default to
    /// zero buffer and no hour restriction.
    pub fn therapy_config(hospital: &Hospital, therapy_key: &str) -> TherapyTypeConfig {
        hospital
            .therapy_config
            .get(therapy_key)
            .cloned()
            .unwrap_or_default()
    }

    /// Composite business-day check: the whole effective window must sit
    /// inside the weekday's business hours, must not touch a blackout date,
    /// and must respect the therapy type's allowed hours when configured.
    pub fn validate_business_day(
        hospital: &Hospital,
        therapy_key: &str,
        window: SessionWindow,
    ) -> Result<(), SessionError> {
        let start_date = window.start.date_naive();
        let end_date = window.end.date_naive();

        for date in [start_date, end_date] {
            if Self::is_blackout(hospital, date) {
                return Err(SessionError::BlackoutDate(date));
            }
        }

        // A window spilling past midnight can never fit a same-day
        // business window
        if start_date != end_date {
            return Err(SessionError::OutsideBusinessHours);
        }

        let business = Self::business_window(hospital, window.start.weekday())
            .ok_or(SessionError::OutsideBusinessHours)?;

        let start_time = window.start.time();
        let end_time = window.end.time();
        if start_time < business.open || end_time > business.close {
            return Err(SessionError::OutsideBusinessHours);
        }

        let config = Self::therapy_config(hospital, therapy_key);
        if let Some(allowed) = config.allowed_hours {
            if start_time < allowed.start || end_time > allowed.end {
                return Err(SessionError::TherapyHoursRestricted(therapy_key.to_string()));
            }
        }

        Ok(())
    }
}
