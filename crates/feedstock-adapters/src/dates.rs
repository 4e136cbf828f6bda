//! Tolerant month/day/year parsing for dated report headings.

use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DateParseError {
    #[error("no four-digit year in {0:?}")]
    NoYear(String),
    #[error("no month in {0:?}")]
    NoMonth(String),
    #[error("day out of range in {0:?}")]
    OutOfRange(String),
}

/// Parse a free-text heading such as `March 2024 Update`, `15th March, 2024`
/// or `Report of 3/7/2024`.
///
/// Numeric `YYYY-MM-DD` and US-ordered `MM/DD/YYYY` words win when present.
/// Otherwise the first month name, the first 1-31 number and the first
/// four-digit year are combined; the day defaults to 1. Other words are ignored.
pub fn parse_loose_date(text: &str) -> Result<NaiveDate, DateParseError> {
    for word in text.split_whitespace() {
        let word = word.trim_matches(|c: char| !c.is_ascii_alphanumeric());
        for format in ["%Y-%m-%d", "%m/%d/%Y"] {
            if let Ok(date) = NaiveDate::parse_from_str(word, format) {
                return Ok(date);
            }
        }
    }

    let mut year = None;
    let mut month = None;
    let mut day = None;

    for token in text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let lower = token.to_ascii_lowercase();
        if let Some(m) = month_token_to_number(&lower) {
            month.get_or_insert(m);
            continue;
        }
        let digits = strip_ordinal(&lower);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if digits.len() == 4 {
            if let Ok(y) = digits.parse::<i32>() {
                year.get_or_insert(y);
            }
        } else if digits.len() <= 2 {
            if let Ok(d) = digits.parse::<u32>() {
                if (1..=31).contains(&d) {
                    day.get_or_insert(d);
                }
            }
        }
    }

    let year = year.ok_or_else(|| DateParseError::NoYear(text.to_string()))?;
    let month = month.ok_or_else(|| DateParseError::NoMonth(text.to_string()))?;
    NaiveDate::from_ymd_opt(year, month, day.unwrap_or(1))
        .ok_or_else(|| DateParseError::OutOfRange(text.to_string()))
}

fn strip_ordinal(token: &str) -> &str {
    ["st", "nd", "rd", "th"]
        .iter()
        .find_map(|suffix| token.strip_suffix(suffix))
        .unwrap_or(token)
}

/// Convert a lowercase month token to a month number (1-12).
fn month_token_to_number(token: &str) -> Option<u32> {
    match token {
        "jan" | "january" => Some(1),
        "feb" | "february" => Some(2),
        "mar" | "march" => Some(3),
        "apr" | "april" => Some(4),
        "may" => Some(5),
        "jun" | "june" => Some(6),
        "jul" | "july" => Some(7),
        "aug" | "august" => Some(8),
        "sep" | "sept" | "september" => Some(9),
        "oct" | "october" => Some(10),
        "nov" | "november" => Some(11),
        "dec" | "december" => Some(12),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn month_year_headings_default_to_first_day() {
        assert_eq!(parse_loose_date("March 2024 Update"), Ok(ymd(2024, 3, 1)));
        assert_eq!(parse_loose_date("**Sept. 2023 Outlook**"), Ok(ymd(2023, 9, 1)));
    }

    #[test]
    fn day_month_year_in_either_order() {
        assert_eq!(parse_loose_date("March 15, 2024"), Ok(ymd(2024, 3, 15)));
        assert_eq!(parse_loose_date("15th March 2024"), Ok(ymd(2024, 3, 15)));
        assert_eq!(parse_loose_date("Week of Dec 2nd 2024"), Ok(ymd(2024, 12, 2)));
    }

    #[test]
    fn numeric_forms() {
        assert_eq!(parse_loose_date("Issued 2024-03-07"), Ok(ymd(2024, 3, 7)));
        assert_eq!(parse_loose_date("Report of 3/7/2024"), Ok(ymd(2024, 3, 7)));
    }

    #[test]
    fn incomplete_or_impossible_dates_fail() {
        assert!(matches!(parse_loose_date("Q1 2024 Review"), Err(DateParseError::NoMonth(_))));
        assert!(matches!(parse_loose_date("March Update"), Err(DateParseError::NoYear(_))));
        assert!(matches!(
            parse_loose_date("February 30, 2024"),
            Err(DateParseError::OutOfRange(_))
        ));
    }
}
