use chrono::NaiveDate;

/// Longest run of consecutive calendar days in `days`.
///
/// Duplicates and ordering of the input do not matter. The run never wraps
/// around: the earliest and latest dates are hard boundaries.
pub fn longest_streak<I>(days: I) -> u32
where
    I: IntoIterator<Item = NaiveDate>,
{
    let mut days: Vec<NaiveDate> = days.into_iter().collect();
    days.sort_unstable();
    days.dedup();

    let mut longest = 0;
    let mut current = 0;
    let mut previous: Option<NaiveDate> = None;
    for day in days {
        current = match previous {
            Some(prev) if prev.succ_opt() == Some(day) => current + 1,
            _ => 1,
        };
        longest = longest.max(current);
        previous = Some(day);
    }
    longest
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jan(days: &[u32]) -> Vec<NaiveDate> {
        days.iter()
            .map(|d| NaiveDate::from_ymd_opt(2025, 1, *d).unwrap())
            .collect()
    }

    #[test]
    fn gap_breaks_the_streak() {
        assert_eq!(longest_streak(jan(&[1, 2, 3, 5, 6])), 3);
        assert_eq!(longest_streak(jan(&[1, 2, 4])), 2);
    }

    #[test]
    fn empty_and_single_day() {
        assert_eq!(longest_streak(Vec::new()), 0);
        assert_eq!(longest_streak(jan(&[17])), 1);
    }

    #[test]
    fn unordered_input_with_duplicates() {
        assert_eq!(longest_streak(jan(&[6, 5, 5, 1, 3, 2, 2])), 3);
    }

    #[test]
    fn does_not_wrap_around_year_end() {
        let mut days = jan(&[1, 2]);
        days.push(NaiveDate::from_ymd_opt(2025, 12, 30).unwrap());
        days.push(NaiveDate::from_ymd_opt(2025, 12, 31).unwrap());
        assert_eq!(longest_streak(days), 2);
    }

    #[test]
    fn crosses_month_boundaries() {
        let days = vec![
            NaiveDate::from_ymd_opt(2024, 2, 28).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        ];
        assert_eq!(longest_streak(days), 3);
    }
}
