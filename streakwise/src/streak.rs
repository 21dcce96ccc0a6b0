//! Streak metrics over a goal's progress history.
//!
//! Nothing here is stored. A summary is recomputed from progress records
//! whenever it is asked for, so it can never drift from the history.
use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::projection::goal::ProgressRecord;

/// Consecutive-day activity of one goal, evaluated on a given day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakSummary {
    /// Length of the run ending at the latest activity, or 0 if it lapsed.
    pub current_streak_days: u32,
    /// Length of the longest run in the whole history.
    pub longest_streak_days: u32,
    /// Most recent day with activity.
    pub last_activity_date: Option<NaiveDate>,
    /// Whether the latest activity was today or yesterday.
    pub is_active: bool,
}

impl StreakSummary {
    /// Summarizes progress records, bucketing them by UTC calendar day.
    pub fn from_progress<'a, I>(records: I, today: NaiveDate) -> Self
    where
        I: IntoIterator<Item = &'a ProgressRecord>,
    {
        let dates: Vec<NaiveDate> = records
            .into_iter()
            .map(|record| record.recorded_at.date_naive())
            .collect();
        calculate_streak(&dates, today)
    }
}

/// Computes streak metrics for activity `dates` as seen on `today`.
///
/// Order and duplicates in `dates` do not matter. Two days belong to the same
/// run only when they are exactly one calendar day apart. Activity dated
/// after `today` does not count as active.
pub fn calculate_streak(dates: &[NaiveDate], today: NaiveDate) -> StreakSummary {
    let days: BTreeSet<NaiveDate> = dates.iter().copied().collect();
    let Some(&last) = days.last() else {
        return StreakSummary::default();
    };

    let mut longest = 0;
    let mut latest_run = 0;
    let mut run = 0;
    let mut previous: Option<NaiveDate> = None;
    for &day in days.iter().rev() {
        run = match previous {
            Some(later) if (later - day).num_days() == 1 => run + 1,
            _ => {
                if previous.is_some() && latest_run == 0 {
                    latest_run = run;
                }
                1
            }
        };
        longest = longest.max(run);
        previous = Some(day);
    }
    if latest_run == 0 {
        latest_run = run;
    }

    let is_active = (0..=1).contains(&(today - last).num_days());
    StreakSummary {
        current_streak_days: if is_active { latest_run } else { 0 },
        longest_streak_days: longest,
        last_activity_date: Some(last),
        is_active,
    }
}
