//! Relative-date parsing shared by the query filters.

use chrono::{Datelike, Duration, Local, NaiveDate};
use regex::Regex;
use std::sync::OnceLock;

fn days_ago_re() -> &'static Regex {
   static RE: OnceLock<Regex> = OnceLock::new();
   RE.get_or_init(|| Regex::new(r"^(\d+)\s*days?\s*ago$").unwrap())
}

fn weeks_ago_re() -> &'static Regex {
   static RE: OnceLock<Regex> = OnceLock::new();
   RE.get_or_init(|| Regex::new(r"^(\d+)\s*weeks?\s*ago$").unwrap())
}

/// Parse an ISO date or a natural relative expression against today's date.
pub fn parse_relative_date(input: &str) -> Option<NaiveDate> {
   parse_relative_date_at(input, Local::now().date_naive())
}

/// Parse against an explicit reference date. Malformed input returns `None`.
///
/// Accepted forms: `YYYY-MM-DD`, `N days ago`, `N weeks ago`, `yesterday`,
/// `last week`, `this week`, `last month`, `this month`, `last quarter`,
/// `last sprint`, `this sprint` (sprint = 2 weeks), `since monday`,
/// `since <month>`.
pub fn parse_relative_date_at(input: &str, today: NaiveDate) -> Option<NaiveDate> {
   let text = input.trim().to_lowercase();
   if text.is_empty() {
      return None;
   }

   if let Ok(date) = NaiveDate::parse_from_str(&text, "%Y-%m-%d") {
      return Some(date);
   }

   if let Some(caps) = days_ago_re().captures(&text) {
      let days: i64 = caps[1].parse().ok()?;
      return today.checked_sub_signed(Duration::days(days));
   }

   if let Some(caps) = weeks_ago_re().captures(&text) {
      let weeks: i64 = caps[1].parse().ok()?;
      return today.checked_sub_signed(Duration::weeks(weeks));
   }

   let days_since_monday = i64::from(today.weekday().num_days_from_monday());

   match text.as_str() {
      "yesterday" => today.checked_sub_signed(Duration::days(1)),
      "today" => Some(today),
      "this week" => today.checked_sub_signed(Duration::days(days_since_monday)),
      "last week" => today.checked_sub_signed(Duration::days(days_since_monday + 7)),
      "this month" => today.with_day(1),
      "last month" => {
         let first = today.with_day(1)?;
         first.checked_sub_signed(Duration::days(1))?.with_day(1)
      },
      "this quarter" => {
         let quarter_start_month = ((today.month0() / 3) * 3) + 1;
         NaiveDate::from_ymd_opt(today.year(), quarter_start_month, 1)
      },
      "last quarter" => today.checked_sub_signed(Duration::days(90)),
      "last sprint" => today.checked_sub_signed(Duration::weeks(2)),
      "this sprint" => today.checked_sub_signed(Duration::days(14)),
      _ => parse_since(&text, today, days_since_monday),
   }
}

fn parse_since(text: &str, today: NaiveDate, days_since_monday: i64) -> Option<NaiveDate> {
   let rest = text.strip_prefix("since ")?.trim();

   if rest == "monday" || rest == "mon" {
      return today.checked_sub_signed(Duration::days(days_since_monday));
   }

   // "since june" style: first of the named month, current year.
   let month = match rest {
      "january" => 1,
      "february" => 2,
      "march" => 3,
      "april" => 4,
      "may" => 5,
      "june" => 6,
      "july" => 7,
      "august" => 8,
      "september" => 9,
      "october" => 10,
      "november" => 11,
      "december" => 12,
      _ => return None,
   };
   NaiveDate::from_ymd_opt(today.year(), month, 1)
}

/// Convert a parsed date to the unix timestamp of its midnight (UTC).
pub fn date_to_timestamp(date: NaiveDate) -> i64 {
   date.and_hms_opt(0, 0, 0).map_or(0, |dt| dt.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
   use super::*;

   fn day(y: i32, m: u32, d: u32) -> NaiveDate {
      NaiveDate::from_ymd_opt(y, m, d).unwrap()
   }

   #[test]
   fn test_seven_days_ago() {
      let today = day(2024, 1, 10);
      assert_eq!(parse_relative_date_at("7 days ago", today), Some(day(2024, 1, 3)));
   }

   #[test]
   fn test_yesterday() {
      let today = day(2024, 1, 10);
      assert_eq!(parse_relative_date_at("yesterday", today), Some(day(2024, 1, 9)));
   }

   #[test]
   fn test_iso_passthrough() {
      let today = day(2024, 1, 10);
      assert_eq!(parse_relative_date_at("2023-06-15", today), Some(day(2023, 6, 15)));
   }

   #[test]
   fn test_weeks_ago() {
      let today = day(2024, 1, 10);
      assert_eq!(parse_relative_date_at("2 weeks ago", today), Some(day(2023, 12, 27)));
   }

   #[test]
   fn test_week_boundaries() {
      // 2024-01-10 is a Wednesday; Monday of that week is 2024-01-08.
      let today = day(2024, 1, 10);
      assert_eq!(parse_relative_date_at("this week", today), Some(day(2024, 1, 8)));
      assert_eq!(parse_relative_date_at("last week", today), Some(day(2024, 1, 1)));
      assert_eq!(parse_relative_date_at("since monday", today), Some(day(2024, 1, 8)));
   }

   #[test]
   fn test_month_boundaries() {
      let today = day(2024, 3, 15);
      assert_eq!(parse_relative_date_at("this month", today), Some(day(2024, 3, 1)));
      assert_eq!(parse_relative_date_at("last month", today), Some(day(2024, 2, 1)));
   }

   #[test]
   fn test_sprints_are_two_weeks() {
      let today = day(2024, 1, 15);
      assert_eq!(parse_relative_date_at("last sprint", today), Some(day(2024, 1, 1)));
      assert_eq!(parse_relative_date_at("this sprint", today), Some(day(2024, 1, 1)));
   }

   #[test]
   fn test_since_month() {
      let today = day(2024, 8, 2);
      assert_eq!(parse_relative_date_at("since june", today), Some(day(2024, 6, 1)));
   }

   #[test]
   fn test_malformed_returns_none() {
      let today = day(2024, 1, 10);
      assert_eq!(parse_relative_date_at("fortnight hence", today), None);
      assert_eq!(parse_relative_date_at("", today), None);
      assert_eq!(parse_relative_date_at("days ago", today), None);
   }
}
