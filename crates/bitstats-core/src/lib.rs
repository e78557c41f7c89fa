//! Core domain model for bitstats: links, click samples and the persisted stats row.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub mod decompose;

pub use decompose::{decompose, DecomposeError, UrlParts};

pub const CRATE_NAME: &str = "bitstats-core";

/// Date format shared by the yesterday cutoff and the service's click buckets.
pub const DAY_FORMAT: &str = "%Y-%m-%d";

/// Opaque group identifier scoping the links of the authenticated account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub String);

impl GroupId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A shortened link and its long-form target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Service-side id, e.g. `bit.ly/abc123`. May contain `/`.
    pub id: String,
    pub short_url: String,
    pub long_url: String,
}

/// Click count for one day bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClickSample {
    /// ISO-8601 timestamp or date exactly as the service returned it.
    pub date: String,
    pub clicks: u64,
}

impl ClickSample {
    pub fn is_for_day(&self, day: &str) -> bool {
        self.date.starts_with(day)
    }
}

/// One persisted row of the `links` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsRecord {
    pub host: String,
    pub path: String,
    pub date: String,
    pub link: String,
    pub url: String,
    pub clicks: u64,
    pub utm_source: String,
    pub utm_medium: String,
    pub utm_campaign: String,
    pub utm_term: String,
    pub utm_content: String,
}

impl StatsRecord {
    pub fn new(link: &Link, sample: &ClickSample, parts: UrlParts) -> Self {
        Self {
            host: parts.host,
            path: parts.path,
            date: sample.date.clone(),
            link: link.short_url.clone(),
            url: link.long_url.clone(),
            clicks: sample.clicks,
            utm_source: parts.utm_source,
            utm_medium: parts.utm_medium,
            utm_campaign: parts.utm_campaign,
            utm_term: parts.utm_term,
            utm_content: parts.utm_content,
        }
    }
}

/// The UTC calendar day before `now`, formatted as `YYYY-MM-DD`.
pub fn yesterday_cutoff(now: DateTime<Utc>) -> String {
    (now.date_naive() - Duration::days(1))
        .format(DAY_FORMAT)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn yesterday_cutoff_crosses_year_boundary() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).single().unwrap();
        assert_eq!(yesterday_cutoff(now), "2023-12-31");
    }

    #[test]
    fn yesterday_cutoff_uses_utc_day() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 23, 59, 59).single().unwrap();
        assert_eq!(yesterday_cutoff(now), "2024-02-29");
    }

    #[test]
    fn click_sample_matches_timestamp_prefix() {
        let sample = ClickSample {
            date: "2024-01-01T00:00:00+0000".into(),
            clicks: 3,
        };
        assert!(sample.is_for_day("2024-01-01"));
        assert!(!sample.is_for_day("2023-12-31"));
    }

    #[test]
    fn stats_record_takes_link_and_sample_fields() {
        let link = Link {
            id: "bit.ly/abc".into(),
            short_url: "https://bit.ly/abc".into(),
            long_url: "https://example.com/a?utm_source=news".into(),
        };
        let sample = ClickSample {
            date: "2024-01-01".into(),
            clicks: 7,
        };
        let parts = decompose(&link.long_url).unwrap();
        let record = StatsRecord::new(&link, &sample, parts);
        assert_eq!(record.link, "https://bit.ly/abc");
        assert_eq!(record.url, link.long_url);
        assert_eq!(record.date, "2024-01-01");
        assert_eq!(record.clicks, 7);
        assert_eq!(record.host, "example.com");
        assert_eq!(record.utm_source, "news");
        assert_eq!(record.utm_medium, "");
    }
}
