use crate::topic_router::Category;
use chrono::{DateTime, FixedOffset, Local, Utc};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Time zone whose calendar date decides the `YYYY/MM/DD` partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceTimeZone {
    Utc,
    /// Time zone of the running process
    Local,
    Fixed(FixedOffset),
}

impl FromStr for ReferenceTimeZone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_lowercase().as_str() {
            "utc" | "z" => return Ok(ReferenceTimeZone::Utc),
            "local" => return Ok(ReferenceTimeZone::Local),
            _ => {}
        }
        parse_offset(s)
            .map(ReferenceTimeZone::Fixed)
            .ok_or_else(|| format!("expected utc, local or an offset like +02:00, got '{}'", s))
    }
}

/// Parse `+HH:MM`, `-HH:MM`, `+HHMM` or `+HH`
fn parse_offset(s: &str) -> Option<FixedOffset> {
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = match digits.len() {
        2 => (digits.parse::<i32>().ok()?, 0),
        4 => (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?),
        _ => return None,
    };
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Fully-qualified object key of an archived message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StorageKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Builds keys of the form `{prefix}/{category}/{YYYY}/{MM}/{DD}/{token}.json`
///
/// Partitioning strategy:
/// - prefix: environment and source version, e.g. `dev/ingest/sv1/mqtt`
/// - category: derived from the topic by the router
/// - date: calendar date of the arrival instant in the reference time zone
/// - token: arrival unix millis plus a random suffix, so two messages arriving
///   in the same millisecond never overwrite each other
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    prefix: String,
    time_zone: ReferenceTimeZone,
}

impl KeyBuilder {
    pub fn new(prefix: impl Into<String>, time_zone: ReferenceTimeZone) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            time_zone,
        }
    }

    pub fn build_key(&self, category: Category, timestamp: &DateTime<Utc>) -> StorageKey {
        let token = uniqueness_token(timestamp);
        let mut key = String::with_capacity(self.prefix.len() + 64);
        if !self.prefix.is_empty() {
            key.push_str(&self.prefix);
            key.push('/');
        }
        key.push_str(&format!(
            "{category}/{date}/{token}.json",
            category = category.as_str(),
            date = self.date_path(timestamp),
            token = token,
        ));
        StorageKey(key)
    }

    /// Zero-padded `YYYY/MM/DD` in the reference time zone
    pub fn date_path(&self, timestamp: &DateTime<Utc>) -> String {
        const FORMAT: &str = "%Y/%m/%d";
        match self.time_zone {
            ReferenceTimeZone::Utc => timestamp.format(FORMAT).to_string(),
            ReferenceTimeZone::Local => timestamp.with_timezone(&Local).format(FORMAT).to_string(),
            ReferenceTimeZone::Fixed(offset) => {
                timestamp.with_timezone(&offset).format(FORMAT).to_string()
            }
        }
    }
}

fn uniqueness_token(timestamp: &DateTime<Utc>) -> String {
    format!("{}-{}", timestamp.timestamp_millis(), Uuid::new_v4().simple())
}
