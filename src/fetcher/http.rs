//! HTTP fetcher for the EC2 query API.
//!
//! POSTs form-encoded queries, signing them with SigV4 when credentials
//! are configured. Connection failures, timeouts and 5xx are retried per
//! [`RetryPolicy`]; 4xx is surfaced immediately.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use http::header::{CONTENT_TYPE, HOST};
use http::{HeaderName, HeaderValue};
use reqwest::Url;
use tracing::{debug, warn};

use super::signing::{self, Credentials, SignableRequest};
use super::{InventoryFetcher, InventoryQuery, RetryPolicy};
use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, Result};
use crate::inventory::RawPage;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";
const SERVICE: &str = "ec2";
const EXCERPT_CHARS: usize = 500;

pub struct HttpFetcher {
    client: reqwest::Client,
    endpoint: Url,
    region: String,
    credentials: Option<Credentials>,
    retry: RetryPolicy,
}

/// Outcome of one failed attempt, before retry policy is applied.
#[derive(Debug)]
enum AttemptError {
    Transient(String),
    Rejected {
        status: u16,
        code: Option<String>,
        message: String,
    },
}

impl HttpFetcher {
    pub fn new(
        endpoint: &str,
        region: impl Into<String>,
        credentials: Option<Credentials>,
        retry: RetryPolicy,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("Invalid inventory endpoint '{endpoint}'"))?;
        if endpoint.host_str().is_none() {
            anyhow::bail!("Inventory endpoint '{endpoint}' has no host");
        }

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint,
            region: region.into(),
            credentials,
            retry,
        })
    }

    pub fn from_config(config: &DiscoveryConfig) -> anyhow::Result<Self> {
        Self::new(
            &config.endpoint_url(),
            config.region.clone(),
            config.credentials.clone(),
            config.retry.clone(),
            config.request_timeout(),
        )
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn host_header(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    fn build_request(&self, body: &str) -> std::result::Result<reqwest::RequestBuilder, AttemptError> {
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .body(body.to_string());

        if let Some(credentials) = &self.credentials {
            let host = self.host_header();
            let signed = signing::sign(
                SignableRequest {
                    method: "POST",
                    path: self.endpoint.path(),
                    headers: vec![
                        (CONTENT_TYPE.as_str().to_string(), FORM_CONTENT_TYPE.to_string()),
                        (HOST.as_str().to_string(), host),
                    ],
                    body: body.as_bytes(),
                },
                credentials,
                &self.region,
                SERVICE,
                Utc::now(),
            );
            for (name, value) in signed {
                let value = HeaderValue::from_str(&value).map_err(|e| AttemptError::Rejected {
                    status: 0,
                    code: None,
                    message: format!("unencodable {name} header: {e}"),
                })?;
                request = request.header(HeaderName::from_static(name), value);
            }
        }

        Ok(request)
    }

    async fn attempt(&self, body: &str) -> std::result::Result<RawPage, AttemptError> {
        let response = self
            .build_request(body)?
            .send()
            .await
            .map_err(|e| AttemptError::Transient(describe_transport_error(&e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AttemptError::Transient(format!("reading body: {e}")))?;

        if status.is_success() {
            return Ok(RawPage::new(text));
        }
        if status.is_server_error() {
            return Err(AttemptError::Transient(format!(
                "HTTP {}: {}",
                status.as_u16(),
                excerpt(&text)
            )));
        }

        let (code, message) = parse_error_document(&text);
        Err(AttemptError::Rejected {
            status: status.as_u16(),
            code,
            message: message.unwrap_or_else(|| {
                let body = excerpt(&text);
                if body.is_empty() {
                    status
                        .canonical_reason()
                        .unwrap_or("request rejected")
                        .to_string()
                } else {
                    body
                }
            }),
        })
    }
}

#[async_trait]
impl InventoryFetcher for HttpFetcher {
    async fn fetch(&self, query: &InventoryQuery) -> Result<RawPage> {
        let body = query.to_form_body()?;
        let max_attempts = self.retry.max_attempts.max(1);

        let mut attempt = 1;
        loop {
            match self.attempt(&body).await {
                Ok(page) => {
                    debug!(
                        endpoint = %self.endpoint,
                        attempt,
                        bytes = page.body.len(),
                        "Inventory page fetched"
                    );
                    return Ok(page);
                }
                Err(AttemptError::Rejected {
                    status,
                    code,
                    message,
                }) => {
                    warn!(
                        endpoint = %self.endpoint,
                        status,
                        code = ?code,
                        "Inventory request rejected: {}",
                        message
                    );
                    return Err(DiscoveryError::FetchRejected {
                        status,
                        code,
                        message,
                    });
                }
                Err(AttemptError::Transient(last_error)) if attempt >= max_attempts => {
                    warn!(
                        endpoint = %self.endpoint,
                        attempts = attempt,
                        "Inventory fetch exhausted retries: {}",
                        last_error
                    );
                    return Err(DiscoveryError::FetchExhausted {
                        attempts: attempt,
                        last_error,
                    });
                }
                Err(AttemptError::Transient(e)) => {
                    let delay = self.retry.delay(attempt - 1);
                    warn!(
                        endpoint = %self.endpoint,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Inventory fetch failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

fn describe_transport_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("request timed out: {e}")
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else {
        e.to_string()
    }
}

fn excerpt(text: &str) -> String {
    text.trim().chars().take(EXCERPT_CHARS).collect()
}

/// Pull `Code` / `Message` out of an EC2 error document
/// (`<Response><Errors><Error>...`).
fn parse_error_document(body: &str) -> (Option<String>, Option<String>) {
    let Ok(doc) = roxmltree::Document::parse(body) else {
        return (None, None);
    };
    let find = |name: &str| {
        doc.descendants()
            .find(|n| n.is_element() && n.tag_name().name() == name)
            .and_then(|n| n.text())
            .map(excerpt)
            .filter(|t| !t.is_empty())
    };
    (find("Code"), find("Message"))
}
