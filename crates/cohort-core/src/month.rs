//! Calendar months, the unit of cohorts and measurement periods.
//!
//! A [`Month`] serialises as a `YYYY-MM` string, which also sorts correctly
//! as text. That property is relied on by SQL range filters over the snapshot
//! table.

use std::{fmt, str::FromStr};

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::Error;

/// A calendar month, e.g. `2024-03`.
///
/// Field order matters: the derived `Ord` compares `year` first.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct Month {
  year:  i32,
  /// 1-based.
  month: u32,
}

impl Month {
  /// Construct a month; returns `None` unless `1 <= month <= 12`.
  pub fn new(year: i32, month: u32) -> Option<Self> {
    (1..=12).contains(&month).then_some(Self { year, month })
  }

  /// The month containing `date`.
  pub fn of(date: NaiveDate) -> Self {
    Self { year: date.year(), month: date.month() }
  }

  pub fn year(self) -> i32 { self.year }

  pub fn month(self) -> u32 { self.month }

  /// January of `year`.
  pub fn first_of_year(year: i32) -> Self { Self { year, month: 1 } }

  /// December of `year`.
  pub fn last_of_year(year: i32) -> Self { Self { year, month: 12 } }

  /// Months since year 0; a linear index used for offset arithmetic.
  fn ordinal(self) -> i64 { i64::from(self.year) * 12 + i64::from(self.month) - 1 }

  fn from_ordinal(ordinal: i64) -> Self {
    Self {
      year:  ordinal.div_euclid(12) as i32,
      month: ordinal.rem_euclid(12) as u32 + 1,
    }
  }

  /// Whole months from `earlier` to `self`; negative if `self` is earlier.
  ///
  /// `"2024-04".offset_from("2024-01") == 3`.
  pub fn offset_from(self, earlier: Month) -> i32 {
    (self.ordinal() - earlier.ordinal()) as i32
  }

  /// The month `n` months after `self` (`n` may be negative).
  pub fn plus(self, n: i32) -> Self { Self::from_ordinal(self.ordinal() + i64::from(n)) }

  pub fn next(self) -> Self { self.plus(1) }

  pub fn prev(self) -> Self { self.plus(-1) }

  /// Inclusive iterator from `self` to `end`. Empty if `end < self`.
  pub fn through(self, end: Month) -> impl Iterator<Item = Month> {
    let (start, end) = (self.ordinal(), end.ordinal());
    (start..=end).map(Self::from_ordinal)
  }
}

impl fmt::Display for Month {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:04}-{:02}", self.year, self.month)
  }
}

impl FromStr for Month {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let invalid = || Error::InvalidMonth(s.to_owned());
    let (y, m) = s.split_once('-').ok_or_else(invalid)?;
    if y.len() != 4 || m.len() != 2 {
      return Err(invalid());
    }
    let year: i32 = y.parse().map_err(|_| invalid())?;
    let month: u32 = m.parse().map_err(|_| invalid())?;
    Self::new(year, month).ok_or_else(invalid)
  }
}

impl TryFrom<String> for Month {
  type Error = Error;

  fn try_from(s: String) -> Result<Self, Self::Error> { s.parse() }
}

impl From<Month> for String {
  fn from(m: Month) -> Self { m.to_string() }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn m(s: &str) -> Month { s.parse().unwrap() }

  #[test]
  fn parse_and_display() {
    assert_eq!(m("2024-03").to_string(), "2024-03");
    assert_eq!(m("0999-12").year(), 999);
  }

  #[test]
  fn parse_rejects_garbage() {
    for bad in ["2024-13", "2024-00", "2024-1", "24-01", "2024/01", "", "abcd-ef"] {
      assert!(bad.parse::<Month>().is_err(), "{bad:?} should not parse");
    }
  }

  #[test]
  fn offset_across_years() {
    assert_eq!(m("2024-04").offset_from(m("2024-01")), 3);
    assert_eq!(m("2025-02").offset_from(m("2024-11")), 3);
    assert_eq!(m("2024-01").offset_from(m("2024-04")), -3);
  }

  #[test]
  fn plus_and_prev_wrap_years() {
    assert_eq!(m("2024-12").next(), m("2025-01"));
    assert_eq!(m("2024-01").prev(), m("2023-12"));
    assert_eq!(m("2024-01").plus(25), m("2026-02"));
  }

  #[test]
  fn through_is_inclusive() {
    let months: Vec<_> = m("2023-11").through(m("2024-02")).collect();
    assert_eq!(months, vec![m("2023-11"), m("2023-12"), m("2024-01"), m("2024-02")]);
    assert_eq!(m("2024-02").through(m("2024-01")).count(), 0);
  }

  #[test]
  fn ordering_matches_text_ordering() {
    let (a, b) = (m("2023-12"), m("2024-01"));
    assert!(a < b);
    assert!(a.to_string() < b.to_string());
  }

  #[test]
  fn serde_as_string() {
    let json = serde_json::to_string(&m("2024-07")).unwrap();
    assert_eq!(json, "\"2024-07\"");
    let back: Month = serde_json::from_str(&json).unwrap();
    assert_eq!(back, m("2024-07"));
    assert!(serde_json::from_str::<Month>("\"2024-7\"").is_err());
  }
}
