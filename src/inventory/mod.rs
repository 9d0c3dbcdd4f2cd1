//! Inventory response parsing: wire format → typed instance records.
//!
//! Each supported wire format implements [`InventoryFormat`]. The
//! coordinator picks one [`WireFormat`] at startup and uses it for every
//! page; formats never see the fetcher or each other.
//!
//! Parsing is tolerant below the envelope: empty reservations are
//! skipped, missing fields become `None`, unknown fields are ignored and
//! unknown state codes map to [`InstanceState::Unknown`]. Only an
//! envelope that cannot be interpreted fails the page.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::InstanceRecord;

pub mod json;
pub mod xml;

pub use json::JsonInventoryFormat;
pub use xml::Ec2XmlFormat;

// ── Core Types ──────────────────────────────────────────────────────

/// One undecoded response body from the inventory API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPage {
    pub body: String,
}

impl RawPage {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }
}

/// A decoded page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPage {
    pub request_id: Option<String>,
    pub reservations: usize,
    pub instances: Vec<InstanceRecord>,
    /// Continuation token; `None` on the last page.
    pub next_token: Option<String>,
}

// ── Format Trait ────────────────────────────────────────────────────

/// A wire format of the instance-inventory API.
pub trait InventoryFormat {
    /// Format-native representation of a single instance element.
    type Instance<'a>;

    fn name(&self) -> &'static str;

    /// Decode a whole page. Fails only on an uninterpretable envelope.
    fn parse_response(&self, page: &RawPage) -> Result<ParsedPage>;

    /// Decode one instance element. Infallible: anomalies become defaults.
    fn parse_instance(&self, raw: Self::Instance<'_>) -> InstanceRecord;
}

/// The configured wire format, chosen once per coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Xml,
    Json,
}

impl WireFormat {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Xml => Ec2XmlFormat.name(),
            Self::Json => JsonInventoryFormat.name(),
        }
    }

    pub fn parse(&self, page: &RawPage) -> Result<ParsedPage> {
        match self {
            Self::Xml => Ec2XmlFormat.parse_response(page),
            Self::Json => JsonInventoryFormat.parse_response(page),
        }
    }

    /// Only the continuation token, for callers that page without decoding.
    pub fn continuation_token(&self, page: &RawPage) -> Result<Option<String>> {
        self.parse(page).map(|p| p.next_token)
    }
}

// ── Shared Helpers ──────────────────────────────────────────────────

/// Parse an inventory timestamp. Accepts RFC 3339 (what EC2 sends) and a
/// bare `YYYY-MM-DD HH:MM:SS` assumed to be UTC.
pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}
