//! Billing anchor engine
//!
//! Computes the next expiration date of a subscription from its anchor day.
//! The day-of-month of `from` never matters; only the anchor does. A member
//! anchored on the 31st therefore goes March 31 → April 30 → May 31 instead of
//! drifting to the 30th forever.

use time::{util::days_in_year_month, Date};

use crate::models::Cadence;

/// Next billing expiration: `from` plus one cadence, with the day-of-month set
/// to `anchor_day`, or to the last day of the target month when the anchor does
/// not exist there.
pub fn next_expiration(anchor_day: u8, cadence: Cadence, from: Date) -> Date {
    let anchor_day = anchor_day.clamp(1, 31);

    let month_index = u32::from(u8::from(from.month())) - 1 + u32::from(cadence.months());
    let year = from.year() + (month_index / 12) as i32;
    let month = from.month().nth_next(cadence.months());

    let day = anchor_day.min(days_in_year_month(year, month));

    // Only unrepresentable years (beyond ±9999) can fail here
    Date::from_calendar_date(year, month, day).unwrap_or(Date::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn test_snap_back_and_recover() {
        let april = next_expiration(31, Cadence::Monthly, date!(2024 - 03 - 31));
        assert_eq!(april, date!(2024 - 04 - 30));

        let may = next_expiration(31, Cadence::Monthly, april);
        assert_eq!(may, date!(2024 - 05 - 31));
    }

    #[test]
    fn test_february_clamps_in_leap_and_common_years() {
        assert_eq!(
            next_expiration(30, Cadence::Monthly, date!(2024 - 01 - 30)),
            date!(2024 - 02 - 29)
        );
        assert_eq!(
            next_expiration(30, Cadence::Monthly, date!(2023 - 01 - 30)),
            date!(2023 - 02 - 28)
        );
        assert_eq!(
            next_expiration(30, Cadence::Monthly, date!(2024 - 02 - 29)),
            date!(2024 - 03 - 30)
        );
    }

    #[test]
    fn test_year_rollover() {
        assert_eq!(
            next_expiration(15, Cadence::Monthly, date!(2024 - 12 - 15)),
            date!(2025 - 01 - 15)
        );
        assert_eq!(
            next_expiration(31, Cadence::Quarterly, date!(2024 - 11 - 30)),
            date!(2025 - 02 - 28)
        );
        assert_eq!(
            next_expiration(29, Cadence::Annual, date!(2024 - 02 - 29)),
            date!(2025 - 02 - 28)
        );
    }

    #[test]
    fn test_from_day_is_irrelevant() {
        // Anchor drives the day even when `from` sits on another day
        assert_eq!(
            next_expiration(15, Cadence::Monthly, date!(2024 - 06 - 03)),
            date!(2024 - 07 - 15)
        );
    }

    #[test]
    fn test_anchor_out_of_range_is_clamped() {
        assert_eq!(
            next_expiration(0, Cadence::Monthly, date!(2024 - 06 - 10)),
            date!(2024 - 07 - 01)
        );
        assert_eq!(
            next_expiration(45, Cadence::Monthly, date!(2024 - 06 - 10)),
            date!(2024 - 07 - 31)
        );
    }

    #[test]
    fn test_every_anchor_over_sequential_rollovers() {
        for anchor in 1..=31u8 {
            for cadence in [Cadence::Monthly, Cadence::Quarterly, Cadence::Annual] {
                let mut current = date!(2023 - 01 - 01);
                for _ in 0..48 {
                    let next = next_expiration(anchor, cadence, current);

                    let expected_months = i32::from(cadence.months());
                    let elapsed = (next.year() - current.year()) * 12
                        + i32::from(u8::from(next.month()))
                        - i32::from(u8::from(current.month()));
                    assert_eq!(elapsed, expected_months, "anchor {anchor} from {current}");

                    let last_day = days_in_year_month(next.year(), next.month());
                    assert_eq!(next.day(), anchor.min(last_day), "anchor {anchor} from {current}");

                    current = next;
                }
            }
        }
    }
}
