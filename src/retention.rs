//! Retention evaluator (C2): pure expiry check over a parsed snapshot name.
//!
//! Unlike the rule-table checker this module's ancestor used, a snapshot
//! here carries its own lifetime, so there is no external policy to look
//! up — `expired` is a single calendar computation plus a `holds` override.

use chrono::{DateTime, Datelike, Months, Utc};

use crate::name::{Lifetime, LifetimeUnit, SnapshotName};

/// `creation + lifetime`, per the calendar arithmetic table:
/// h -> hours, d -> days, w -> 7*days, m -> +1 calendar month (carry into
/// January of the next year past December), y -> +1 calendar year.
pub fn expiry_instant(creation: DateTime<Utc>, lifetime: Lifetime) -> DateTime<Utc> {
    match lifetime.unit {
        LifetimeUnit::Hour => creation + chrono::Duration::hours(lifetime.amount as i64),
        LifetimeUnit::Day => creation + chrono::Duration::days(lifetime.amount as i64),
        LifetimeUnit::Week => creation + chrono::Duration::days(7 * lifetime.amount as i64),
        LifetimeUnit::Month => creation
            .checked_add_months(Months::new(lifetime.amount))
            .unwrap_or(creation),
        LifetimeUnit::Year => {
            let year = creation.year() + lifetime.amount as i32;
            creation
                .with_year(year)
                .unwrap_or_else(|| creation.checked_add_months(Months::new(12 * lifetime.amount)).unwrap_or(creation))
        }
    }
}

/// `expired(s, T) = creation + lifetime <= T`, unless `holds` overrides it.
pub fn expired(name: &SnapshotName, holds: bool, observed_at: DateTime<Utc>) -> bool {
    if holds {
        return false;
    }
    expiry_instant(name.creation, name.lifetime) <= observed_at
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn snap(creation: DateTime<Utc>, amount: u32, unit: LifetimeUnit) -> SnapshotName {
        SnapshotName::new("auto", creation, Lifetime { amount, unit })
    }

    #[test]
    fn expiry_math_seven_days() {
        let creation = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let name = snap(creation, 7, LifetimeUnit::Day);

        let at_expiry = Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap();
        assert!(expired(&name, false, at_expiry));

        let just_before = Utc.with_ymd_and_hms(2024, 1, 7, 23, 59, 0).unwrap();
        assert!(!expired(&name, false, just_before));

        assert!(!expired(&name, true, at_expiry));
    }

    #[test]
    fn expiry_is_monotone_in_time() {
        let creation = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let name = snap(creation, 1, LifetimeUnit::Hour);
        let t1 = creation + chrono::Duration::hours(2);
        let t2 = t1 + chrono::Duration::days(365);
        assert!(expired(&name, false, t1));
        assert!(expired(&name, false, t2));
    }

    #[test]
    fn month_carries_into_next_year() {
        let creation = Utc.with_ymd_and_hms(2023, 12, 15, 0, 0, 0).unwrap();
        let name = snap(creation, 1, LifetimeUnit::Month);
        let expiry = expiry_instant(name.creation, name.lifetime);
        assert_eq!(expiry.year(), 2024);
        assert_eq!(expiry.month(), 1);
        assert_eq!(expiry.day(), 15);
    }

    #[test]
    fn year_arithmetic_is_calendar_based() {
        let creation = Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap();
        let name = snap(creation, 1, LifetimeUnit::Year);
        let expiry = expiry_instant(name.creation, name.lifetime);
        assert_eq!(expiry.year(), 2025);
        assert_eq!(expiry.month(), 2);
    }

    #[test]
    fn hold_overrides_expiry_unconditionally() {
        let creation = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        let name = snap(creation, 1, LifetimeUnit::Hour);
        assert!(!expired(&name, true, Utc::now()));
    }
}
