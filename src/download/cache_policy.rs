//! HTTP caching policy used to decide whether a checkpoint can be trusted.
//!
//! A [`CachePolicy`] is captured from the response headers of the metadata
//! probe and stored inside the checkpoint. On the next attempt it answers two
//! questions:
//!
//! - is the stored segment plan still fresh (RFC 7234 §4.2), so no probe is
//!   needed at all?
//! - if not, which conditional headers (`If-None-Match`, `If-Modified-Since`)
//!   let the server confirm the resource is unchanged?
//!
//! Only the subset of RFC 7234 that matters for a private, single-user cache is
//! modelled: `max-age`, `no-cache`, `no-store`, `must-revalidate`, `Expires`,
//! `Age`, `Date`, and a heuristic based on `Last-Modified`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::header::{
    AGE, CACHE_CONTROL, CONTENT_LENGTH, DATE, ETAG, EXPIRES, HeaderMap, HeaderValue,
    IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, PRAGMA,
};
use serde::{Deserialize, Serialize};

use super::constants::{HEURISTIC_FRESHNESS_DIVISOR, MAX_HEURISTIC_FRESHNESS};
use super::metadata::ResourceMetadata;

/// Cacheability facts about one probed resource.
///
/// Times are whole seconds since the Unix epoch so the policy serializes
/// compactly into a checkpoint record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    /// URL the policy was captured for (after redirects).
    pub url: String,
    /// When the response was received.
    pub response_time: u64,
    /// Origin `Date` header.
    pub date: Option<u64>,
    /// `Age` header in seconds.
    pub age: u64,
    /// `Cache-Control: max-age`.
    pub max_age: Option<u64>,
    /// `Cache-Control: no-cache` (or `Pragma: no-cache`).
    pub no_cache: bool,
    /// `Cache-Control: no-store`.
    pub no_store: bool,
    /// `Cache-Control: must-revalidate`.
    pub must_revalidate: bool,
    /// `Expires` header.
    pub expires: Option<u64>,
    /// Raw `Last-Modified` header.
    pub last_modified: Option<String>,
    /// Raw `ETag` header.
    pub etag: Option<String>,
    /// `Content-Length` of the full representation.
    pub content_length: Option<u64>,
}

impl CachePolicy {
    /// Captures the policy from a probe response.
    #[must_use]
    pub fn from_response(url: &str, headers: &HeaderMap, received_at: SystemTime) -> Self {
        let mut policy = Self {
            url: url.to_string(),
            response_time: epoch_secs(received_at),
            date: header_date(headers, DATE.as_str()),
            age: header_str(headers, AGE.as_str())
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0),
            max_age: None,
            no_cache: false,
            no_store: false,
            must_revalidate: false,
            expires: header_date(headers, EXPIRES.as_str()),
            last_modified: header_str(headers, LAST_MODIFIED.as_str()).map(str::to_string),
            etag: header_str(headers, ETAG.as_str()).map(str::to_string),
            content_length: header_str(headers, CONTENT_LENGTH.as_str())
                .and_then(|v| v.trim().parse().ok()),
        };

        match header_str(headers, CACHE_CONTROL.as_str()) {
            Some(cache_control) => policy.apply_cache_control(cache_control),
            None => {
                policy.no_cache = header_str(headers, PRAGMA.as_str())
                    .is_some_and(|v| v.to_ascii_lowercase().contains("no-cache"));
            }
        }

        policy
    }

    /// Builds a policy from caller-supplied metadata.
    ///
    /// Carries only validators, so it is never fresh and every reuse goes
    /// through a conditional probe.
    #[must_use]
    pub fn from_metadata(metadata: &ResourceMetadata, received_at: SystemTime) -> Self {
        Self {
            url: metadata.url.clone(),
            response_time: epoch_secs(received_at),
            date: None,
            age: 0,
            max_age: None,
            no_cache: true,
            no_store: false,
            must_revalidate: true,
            expires: None,
            last_modified: metadata.last_modified.clone(),
            etag: metadata.etag.clone(),
            content_length: metadata.content_length,
        }
    }

    fn apply_cache_control(&mut self, value: &str) {
        for directive in value.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            let (name, argument) = match directive.split_once('=') {
                Some((name, argument)) => (name.trim(), Some(argument.trim().trim_matches('"'))),
                None => (directive.as_str(), None),
            };
            match name {
                "max-age" => self.max_age = argument.and_then(|a| a.parse().ok()),
                "no-cache" => self.no_cache = true,
                "no-store" => self.no_store = true,
                "must-revalidate" => self.must_revalidate = true,
                _ => {}
            }
        }
    }

    /// How long the response stays fresh after it was generated.
    #[must_use]
    pub fn freshness_lifetime(&self) -> Duration {
        if self.no_cache || self.no_store {
            return Duration::ZERO;
        }
        if let Some(max_age) = self.max_age {
            return Duration::from_secs(max_age);
        }
        let date = self.date.unwrap_or(self.response_time);
        if let Some(expires) = self.expires {
            return Duration::from_secs(expires.saturating_sub(date));
        }
        if self.must_revalidate {
            return Duration::ZERO;
        }
        self.last_modified
            .as_deref()
            .and_then(|value| httpdate::parse_http_date(value).ok())
            .map(|modified| {
                let since = date.saturating_sub(epoch_secs(modified));
                Duration::from_secs(since / HEURISTIC_FRESHNESS_DIVISOR)
                    .min(MAX_HEURISTIC_FRESHNESS)
            })
            .unwrap_or(Duration::ZERO)
    }

    /// Estimated age of the stored response at `now`.
    #[must_use]
    pub fn current_age(&self, now: SystemTime) -> Duration {
        let apparent = self
            .date
            .map_or(0, |date| self.response_time.saturating_sub(date));
        let corrected = apparent.max(self.age);
        let resident = epoch_secs(now).saturating_sub(self.response_time);
        Duration::from_secs(corrected + resident)
    }

    /// Returns true if the stored plan can be reused without contacting the
    /// server.
    #[must_use]
    pub fn is_fresh(&self, now: SystemTime) -> bool {
        self.current_age(now) < self.freshness_lifetime()
    }

    /// Returns true if the server gave anything to revalidate against.
    #[must_use]
    pub fn can_revalidate(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }

    /// Conditional headers for a revalidation probe.
    #[must_use]
    pub fn revalidation_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(etag) = self.etag.as_deref()
            && let Ok(value) = HeaderValue::from_str(etag)
        {
            headers.insert(IF_NONE_MATCH, value);
        }
        if let Some(modified) = self.last_modified.as_deref()
            && let Ok(value) = HeaderValue::from_str(modified)
        {
            headers.insert(IF_MODIFIED_SINCE, value);
        }
        headers
    }

    /// Policy after the server answered `304 Not Modified`.
    ///
    /// Freshness information comes from the 304; validators and length carry
    /// over from the stored policy when the 304 omits them.
    #[must_use]
    pub fn revalidated(&self, headers: &HeaderMap, received_at: SystemTime) -> Self {
        let mut updated = Self::from_response(&self.url, headers, received_at);
        if updated.etag.is_none() {
            updated.etag.clone_from(&self.etag);
        }
        if updated.last_modified.is_none() {
            updated.last_modified.clone_from(&self.last_modified);
        }
        updated.content_length = self.content_length;
        updated
    }

    /// Returns true if `other` describes the same representation: equal strong
    /// ETags and equal lengths.
    #[must_use]
    pub fn same_representation(&self, other: &Self) -> bool {
        match (self.etag.as_deref(), other.etag.as_deref()) {
            (Some(a), Some(b)) if !a.starts_with("W/") && !b.starts_with("W/") => {
                a == b && self.content_length == other.content_length
            }
            _ => false,
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn header_date(headers: &HeaderMap, name: &str) -> Option<u64> {
    header_str(headers, name)
        .and_then(|value| httpdate::parse_http_date(value).ok())
        .map(epoch_secs)
}

fn epoch_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
