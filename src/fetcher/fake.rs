//! Test fixtures: an in-memory fetcher and DescribeInstances documents.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::{InventoryFetcher, InventoryQuery};
use crate::error::{DiscoveryError, Result};
use crate::inventory::RawPage;

// ── Fixture Instances ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) struct FixtureInstance {
    pub id: String,
    pub code: i64,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    pub zone: String,
    pub tags: Vec<(String, String)>,
    pub groups: Vec<(String, String)>,
}

impl FixtureInstance {
    pub fn running(private_ip: &str) -> Self {
        Self {
            id: format!("i-{}", uuid::Uuid::new_v4().simple()),
            code: 16,
            private_ip: Some(private_ip.to_string()),
            public_ip: None,
            zone: "us-east-1e".to_string(),
            tags: Vec::new(),
            groups: Vec::new(),
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = code;
        self
    }

    pub fn with_public_ip(mut self, ip: &str) -> Self {
        self.public_ip = Some(ip.to_string());
        self
    }

    pub fn public_only(ip: &str) -> Self {
        let mut instance = Self::running(ip);
        instance.private_ip = None;
        instance.public_ip = Some(ip.to_string());
        instance
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.push((key.to_string(), value.to_string()));
        self
    }

    fn state_name(&self) -> &'static str {
        crate::model::InstanceState::from_code(self.code).as_str()
    }

    fn to_xml(&self) -> String {
        let tags: String = self
            .tags
            .iter()
            .map(|(k, v)| format!("<item><key>{k}</key><value>{v}</value></item>"))
            .collect();
        let groups: String = self
            .groups
            .iter()
            .map(|(id, name)| format!("<item><groupId>{id}</groupId><groupName>{name}</groupName></item>"))
            .collect();
        format!(
            "<item>\
               <instanceId>{id}</instanceId>\
               <imageId>ami-{image}</imageId>\
               <instanceState><code>{code}</code><name>{name}</name></instanceState>\
               <privateDnsName></privateDnsName>\
               <dnsName></dnsName>\
               <instanceType>m1.medium</instanceType>\
               <placement><availabilityZone>{zone}</availabilityZone><groupName/><tenancy>default</tenancy></placement>\
               <privateIpAddress>{private_ip}</privateIpAddress>\
               <ipAddress>{public_ip}</ipAddress>\
               <groupSet>{groups}</groupSet>\
               <tagSet>{tags}</tagSet>\
             </item>",
            id = self.id,
            image = uuid::Uuid::new_v4().simple(),
            code = self.code,
            name = self.state_name(),
            zone = self.zone,
            private_ip = self.private_ip.as_deref().unwrap_or_default(),
            public_ip = self.public_ip.as_deref().unwrap_or_default(),
        )
    }
}

/// A DescribeInstancesResponse document; one inner vec per reservation.
pub(crate) fn describe_instances_xml(
    reservations: &[Vec<FixtureInstance>],
    next_token: Option<&str>,
) -> String {
    let body: String = reservations
        .iter()
        .map(|instances| {
            let items: String = instances.iter().map(FixtureInstance::to_xml).collect();
            format!(
                "<item><reservationId>r-{}</reservationId><instancesSet>{items}</instancesSet></item>",
                uuid::Uuid::new_v4().simple()
            )
        })
        .collect();
    let token = next_token
        .map(|t| format!("<nextToken>{t}</nextToken>"))
        .unwrap_or_default();
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <DescribeInstancesResponse xmlns=\"http://ec2.amazonaws.com/doc/2016-11-15/\">\
         <requestId>{}</requestId>\
         <reservationSet>{body}</reservationSet>{token}\
         </DescribeInstancesResponse>",
        uuid::Uuid::new_v4()
    )
}

// ── Fixture Fetcher ─────────────────────────────────────────────────

/// Serves pre-built pages keyed by continuation token (`None` = first).
#[derive(Default)]
pub(crate) struct FixtureFetcher {
    pages: Mutex<HashMap<Option<String>, Result<RawPage>>>,
    queries: Mutex<Vec<InventoryQuery>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
    gate: Option<Arc<Semaphore>>,
}

impl FixtureFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, token: Option<&str>, body: impl Into<String>) -> Self {
        self.set_page(token, body);
        self
    }

    pub fn with_error(self, token: Option<&str>, error: DiscoveryError) -> Self {
        self.pages
            .lock()
            .unwrap()
            .insert(token.map(String::from), Err(error));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every fetch waits for a permit; add permits to release them.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Replace a page between cycles.
    pub fn set_page(&self, token: Option<&str>, body: impl Into<String>) {
        self.pages
            .lock()
            .unwrap()
            .insert(token.map(String::from), Ok(RawPage::new(body)));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<InventoryQuery> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl InventoryFetcher for FixtureFetcher {
    async fn fetch(&self, query: &InventoryQuery) -> Result<RawPage> {
        query.validate()?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(query.clone());

        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.map_err(|_| DiscoveryError::Cancelled)?;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let key = query.next_token().map(String::from);
        self.pages
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| {
                Err(DiscoveryError::FetchRejected {
                    status: 400,
                    code: Some("InvalidParameterValue".into()),
                    message: format!("no fixture page for token {key:?}"),
                })
            })
    }
}
