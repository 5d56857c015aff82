use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{KeypackError, Result};

/// Maximum length of a country identifier.
pub const MAX_COUNTRY_LEN: usize = 16;

/// Canonical on-disk and wire form of a [`Day`].
pub const DAY_FORMAT: &str = "%Y-%m-%d";

// =============================================================================
// Enums
// =============================================================================

/// Time window a package covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// One full calendar day.
    Day,
    /// A single hour within a day.
    Hour,
}

// =============================================================================
// Key components
// =============================================================================

/// Reporting country identifier, e.g. `DE` or `EUR`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Country(String);

impl Country {
    /// Validate a country code.
    ///
    /// Codes are 1 to 16 ASCII alphanumeric characters. Case is preserved.
    pub fn parse(code: &str) -> Result<Self> {
        if code.is_empty() || code.len() > MAX_COUNTRY_LEN {
            return Err(KeypackError::ConstraintViolation(format!(
                "country code must be 1..={} characters, got {:?}",
                MAX_COUNTRY_LEN, code
            )));
        }
        if !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(KeypackError::ConstraintViolation(format!(
                "country code must be ASCII alphanumeric, got {:?}",
                code
            )));
        }
        Ok(Self(code.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Country {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Country {
    type Err = KeypackError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Country {
    type Error = KeypackError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Country> for String {
    fn from(value: Country) -> Self {
        value.0
    }
}

/// A calendar day in canonical `YYYY-MM-DD` form.
///
/// Ordering of `Day` values matches lexicographic ordering of their canonical
/// strings, which the store relies on for range queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Day(NaiveDate);

impl Day {
    /// Parse a canonical day string.
    ///
    /// Only the zero-padded ten character form is accepted; `2021-3-1` and
    /// `2021-03-01T00:00` are rejected even though a lenient parser would
    /// take them.
    pub fn parse(s: &str) -> Result<Self> {
        let date = NaiveDate::parse_from_str(s, DAY_FORMAT).map_err(|e| {
            KeypackError::ConstraintViolation(format!("malformed day {:?}: {}", s, e))
        })?;
        if s.len() != 10 || date.format(DAY_FORMAT).to_string() != s {
            return Err(KeypackError::ConstraintViolation(format!(
                "day {:?} is not in canonical YYYY-MM-DD form",
                s
            )));
        }
        Ok(Self(date))
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// Canonical string form used for storage.
    pub fn to_canonical(&self) -> String {
        self.0.format(DAY_FORMAT).to_string()
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(DAY_FORMAT))
    }
}

impl FromStr for Day {
    type Err = KeypackError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Day {
    type Error = KeypackError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Day> for String {
    fn from(value: Day) -> Self {
        value.to_canonical()
    }
}

/// Hour of the day, 0 through 23.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Hour(u8);

impl Hour {
    pub const MAX: u8 = 23;

    pub fn new(hour: u8) -> Result<Self> {
        if hour > Self::MAX {
            return Err(KeypackError::ConstraintViolation(format!(
                "hour {} out of range 0..=23",
                hour
            )));
        }
        Ok(Self(hour))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for Hour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u8> for Hour {
    type Error = KeypackError;

    fn try_from(value: u8) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Hour> for u8 {
    fn from(value: Hour) -> Self {
        value.0
    }
}

// =============================================================================
// Packages
// =============================================================================

/// Natural primary key of a stored package.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageKey {
    pub country: Country,
    pub day: Day,
    /// `None` for a daily package.
    pub hour: Option<Hour>,
}

impl PackageKey {
    pub fn daily(country: Country, day: Day) -> Self {
        Self {
            country,
            day,
            hour: None,
        }
    }

    pub fn hourly(country: Country, day: Day, hour: Hour) -> Self {
        Self {
            country,
            day,
            hour: Some(hour),
        }
    }

    pub fn granularity(&self) -> Granularity {
        match self.hour {
            Some(_) => Granularity::Hour,
            None => Granularity::Day,
        }
    }
}

impl fmt::Display for PackageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.hour {
            Some(hour) => write!(f, "{}/{}/{:02}", self.country, self.day, hour.value()),
            None => write!(f, "{}/{}", self.country, self.day),
        }
    }
}

/// A downloaded diagnostic key package.
///
/// The payload is the signed archive exactly as received; it is never
/// interpreted here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub key: PackageKey,
    /// Content version assigned by the origin, absent for legacy entries.
    pub etag: Option<String>,
    pub payload: Vec<u8>,
}

impl Package {
    pub fn country(&self) -> &Country {
        &self.key.country
    }

    pub fn day(&self) -> Day {
        self.key.day
    }

    pub fn hour(&self) -> Option<Hour> {
        self.key.hour
    }

    pub fn granularity(&self) -> Granularity {
        self.key.granularity()
    }
}
