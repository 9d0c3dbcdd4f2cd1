//! Inventory fetcher: the only component that talks to the cloud API.
//!
//! A fetcher turns one [`InventoryQuery`] into one [`RawPage`], owning
//! transport retries. Pagination is layered on top by [`PageCursor`],
//! which follows the continuation token embedded in each page until the
//! API stops returning one. Nothing here caches.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DiscoveryError, Result};
use crate::filter::DiscoveryFilterConfig;
use crate::inventory::{RawPage, WireFormat};
use crate::model::InstanceState;

pub mod http;
pub mod signing;

#[cfg(test)]
pub(crate) mod fake;

pub use http::HttpFetcher;

/// The single action this crate knows how to consume.
pub const DESCRIBE_INSTANCES: &str = "DescribeInstances";
pub const API_VERSION: &str = "2016-11-15";

/// Upper bound on pages per cycle. A provider that never stops handing
/// out tokens is treated as a malformed response.
const MAX_PAGES: usize = 1_000;

// ── Query ───────────────────────────────────────────────────────────

/// A server-side filter (`Filter.N.Name` / `Filter.N.Value.M`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryFilter {
    pub name: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryQuery {
    action: String,
    filters: Vec<QueryFilter>,
    max_results: Option<u32>,
    next_token: Option<String>,
}

impl InventoryQuery {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            filters: Vec::new(),
            max_results: None,
            next_token: None,
        }
    }

    pub fn describe_instances() -> Self {
        Self::new(DESCRIBE_INSTANCES)
    }

    /// Pre-filter on the provider side with whatever the filter config can
    /// express there. Client-side filtering still runs on every page.
    pub fn for_filter(config: &DiscoveryFilterConfig) -> Self {
        let mut query = Self::describe_instances();
        if config.required_state != InstanceState::Unknown {
            query = query.with_filter("instance-state-name", [config.required_state.as_str()]);
        }
        for (key, tag_match) in &config.tag_filters {
            let values = tag_match.values();
            if values.is_empty() {
                query = query.with_filter("tag-key", [key.as_str()]);
            } else {
                query = query.with_filter(format!("tag:{key}"), values);
            }
        }
        if !config.availability_zones.is_empty() {
            query = query.with_filter("availability-zone", config.availability_zones.iter().cloned());
        }
        query
    }

    pub fn with_filter<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filters.push(QueryFilter {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn with_max_results(mut self, max_results: u32) -> Self {
        self.max_results = Some(max_results);
        self
    }

    /// The same query, continued from `token`.
    pub fn continued(&self, token: impl Into<String>) -> Self {
        Self {
            next_token: Some(token.into()),
            ..self.clone()
        }
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn filters(&self) -> &[QueryFilter] {
        &self.filters
    }

    pub fn next_token(&self) -> Option<&str> {
        self.next_token.as_deref()
    }

    pub fn validate(&self) -> Result<()> {
        if self.action != DESCRIBE_INSTANCES {
            return Err(DiscoveryError::UnsupportedAction(self.action.clone()));
        }
        Ok(())
    }

    /// Wire parameters in the order the API documents them.
    pub fn to_params(&self) -> Result<Vec<(String, String)>> {
        self.validate()?;

        let mut params = vec![
            ("Action".to_string(), self.action.clone()),
            ("Version".to_string(), API_VERSION.to_string()),
        ];
        for (i, filter) in self.filters.iter().enumerate() {
            let n = i + 1;
            params.push((format!("Filter.{n}.Name"), filter.name.clone()));
            for (j, value) in filter.values.iter().enumerate() {
                params.push((format!("Filter.{n}.Value.{}", j + 1), value.clone()));
            }
        }
        if let Some(max) = self.max_results {
            params.push(("MaxResults".to_string(), max.to_string()));
        }
        if let Some(token) = &self.next_token {
            params.push(("NextToken".to_string(), token.clone()));
        }
        Ok(params)
    }

    /// `application/x-www-form-urlencoded` request body.
    pub fn to_form_body(&self) -> Result<String> {
        let params = self.to_params()?;
        serde_urlencoded::to_string(&params)
            .map_err(|e| DiscoveryError::UnsupportedAction(format!("{}: {e}", self.action)))
    }
}

// ── Retry Policy ────────────────────────────────────────────────────

/// Exponential backoff for transient transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per page, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Randomise each delay within its upper half.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn no_jitter(max_attempts: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms,
            max_backoff_ms,
            jitter: false,
        }
    }

    /// Upper bound of the delay before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.min(32)).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// The delay actually slept, jittered into `[backoff/2, backoff]`.
    pub fn delay(&self, retry: u32) -> Duration {
        let ceiling = self.backoff(retry);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }
        let half = ceiling / 2;
        let spread = (ceiling - half).as_millis() as u64;
        half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

// ── Fetcher Trait ───────────────────────────────────────────────────

/// Issues one inventory request and returns the raw page.
///
/// Implementations own retry/backoff. They must fail with
/// `UnsupportedAction` before touching the network when the query is not
/// one they support.
#[async_trait]
pub trait InventoryFetcher: Send + Sync {
    async fn fetch(&self, query: &InventoryQuery) -> Result<RawPage>;
}

/// Lazily walks every page of a query.
pub struct PageCursor<'a, F: InventoryFetcher + ?Sized> {
    fetcher: &'a F,
    format: WireFormat,
    next: Option<InventoryQuery>,
    seen_tokens: HashSet<String>,
    pages: usize,
}

impl<'a, F: InventoryFetcher + ?Sized> PageCursor<'a, F> {
    pub fn new(fetcher: &'a F, format: WireFormat, query: InventoryQuery) -> Self {
        Self {
            fetcher,
            format,
            next: Some(query),
            seen_tokens: HashSet::new(),
            pages: 0,
        }
    }

    /// Fetch the next page, or `None` once the last page was returned.
    pub async fn next_page(&mut self) -> Option<Result<RawPage>> {
        let query = self.next.take()?;
        let result = self.advance(&query).await;
        if result.is_err() {
            self.next = None;
        }
        Some(result)
    }

    async fn advance(&mut self, query: &InventoryQuery) -> Result<RawPage> {
        let page = self.fetcher.fetch(query).await?;
        self.pages += 1;

        if let Some(token) = self.format.continuation_token(&page)? {
            if !self.seen_tokens.insert(token.clone()) {
                return Err(DiscoveryError::MalformedResponse(format!(
                    "continuation token '{token}' repeated"
                )));
            }
            if self.pages >= MAX_PAGES {
                return Err(DiscoveryError::MalformedResponse(format!(
                    "more than {MAX_PAGES} pages"
                )));
            }
            debug!(page = self.pages, "inventory page has continuation token");
            self.next = Some(query.continued(token));
        }
        Ok(page)
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages
    }
}

/// Fetch every page of `query`, preserving page order.
pub async fn fetch_all<F>(fetcher: &F, format: WireFormat, query: InventoryQuery) -> Result<Vec<RawPage>>
where
    F: InventoryFetcher + ?Sized,
{
    let mut cursor = PageCursor::new(fetcher, format, query);
    let mut pages = Vec::new();
    while let Some(page) = cursor.next_page().await {
        pages.push(page?);
    }
    Ok(pages)
}
