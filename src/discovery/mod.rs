//! Discovery coordinator: drives fetch → parse → filter → select and
//! publishes the result as an immutable snapshot.
//!
//! - At most one cycle runs per coordinator. Triggers that arrive while a
//!   cycle is in flight join it and observe the same outcome.
//! - The cycle runs on its own task; dropping a [`RefreshHandle`] never
//!   cancels it. Only [`DiscoveryCoordinator::shutdown`] does.
//! - A failed cycle leaves the current snapshot untouched.
//! - Readers get the current snapshot through an atomically swapped
//!   pointer and never wait on a cycle.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use chrono::Utc;
use tokio::sync::watch;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, Result};
use crate::fetcher::{fetch_all, HttpFetcher, InventoryFetcher, InventoryQuery};
use crate::filter::{filter, DiscoveryFilterConfig};
use crate::inventory::WireFormat;
use crate::model::{DiscoverySnapshot, PeerEndpoint};
use crate::selector::{select, EndpointSelectionPolicy};

pub mod poller;

pub use poller::spawn_poller;

pub const DEFAULT_CYCLE_DEADLINE: Duration = Duration::from_secs(60);

// ── Phases ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CyclePhase {
    Idle = 0,
    Fetching = 1,
    Parsing = 2,
    Filtering = 3,
    Selecting = 4,
    Published = 5,
    Failed = 6,
}

impl CyclePhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Fetching,
            2 => Self::Parsing,
            3 => Self::Filtering,
            4 => Self::Selecting,
            5 => Self::Published,
            6 => Self::Failed,
            _ => Self::Idle,
        }
    }

    /// True while a cycle is between its first fetch and its outcome.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            Self::Fetching | Self::Parsing | Self::Filtering | Self::Selecting
        )
    }
}

// ── Listener ────────────────────────────────────────────────────────

/// Notified synchronously after each snapshot is published, in
/// registration order. Implementations must not block.
pub trait SnapshotListener: Send + Sync {
    fn on_snapshot(&self, snapshot: &Arc<DiscoverySnapshot>);
}

// ── Refresh Handle ──────────────────────────────────────────────────

pub type CycleOutcome = Result<Arc<DiscoverySnapshot>>;

/// A caller's view of one cycle. Cloning it, or asking the coordinator
/// again while the cycle runs, yields the same outcome.
#[derive(Clone)]
pub struct RefreshHandle {
    rx: watch::Receiver<Option<CycleOutcome>>,
}

impl RefreshHandle {
    fn resolved(outcome: CycleOutcome) -> Self {
        let (_tx, rx) = watch::channel(Some(outcome));
        Self { rx }
    }

    /// Wait for the cycle's outcome.
    pub async fn wait(mut self) -> CycleOutcome {
        loop {
            let ready = self.rx.borrow_and_update().clone();
            if let Some(outcome) = ready {
                return outcome;
            }
            if self.rx.changed().await.is_err() {
                // Cycle task went away without reporting.
                return self.rx.borrow().clone().unwrap_or(Err(DiscoveryError::Cancelled));
            }
        }
    }

    /// The outcome if the cycle already finished.
    pub fn try_outcome(&self) -> Option<CycleOutcome> {
        self.rx.borrow().clone()
    }
}

// ── Coordinator ─────────────────────────────────────────────────────

#[derive(Clone)]
pub struct DiscoveryCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    fetcher: Arc<dyn InventoryFetcher>,
    wire_format: WireFormat,
    query: InventoryQuery,
    filter: DiscoveryFilterConfig,
    selection: EndpointSelectionPolicy,
    cycle_deadline: Duration,
    listeners: Vec<Arc<dyn SnapshotListener>>,

    current: ArcSwap<DiscoverySnapshot>,
    published: watch::Sender<Arc<DiscoverySnapshot>>,
    inflight: Mutex<Option<watch::Receiver<Option<CycleOutcome>>>>,
    phase: AtomicU8,
    shutdown: CancellationToken,
}

impl DiscoveryCoordinator {
    pub fn builder(fetcher: Arc<dyn InventoryFetcher>) -> DiscoveryCoordinatorBuilder {
        DiscoveryCoordinatorBuilder::new(fetcher)
    }

    /// HTTP-backed coordinator from a validated config.
    pub fn from_config(config: &DiscoveryConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let fetcher = HttpFetcher::from_config(config)?;
        info!(
            endpoint = %fetcher.endpoint(),
            region = %config.region,
            wire_format = config.wire_format.name(),
            "Inventory fetcher configured"
        );

        let mut builder = Self::builder(Arc::new(fetcher))
            .wire_format(config.wire_format)
            .filter(config.filter.clone())
            .selection(config.selection.clone())
            .cycle_deadline(config.cycle_deadline());
        if let Some(page_size) = config.page_size {
            builder = builder.page_size(page_size);
        }
        builder.build()
    }

    /// The most recently published snapshot. Never blocks.
    pub fn current_snapshot(&self) -> Arc<DiscoverySnapshot> {
        self.inner.current.load_full()
    }

    /// Observe every published snapshot. The receiver starts at the
    /// current one.
    pub fn subscribe(&self) -> watch::Receiver<Arc<DiscoverySnapshot>> {
        self.inner.published.subscribe()
    }

    pub fn phase(&self) -> CyclePhase {
        CyclePhase::from_u8(self.inner.phase.load(Ordering::SeqCst))
    }

    /// Run a cycle, or join the one in flight, and wait for it.
    pub async fn refresh(&self) -> CycleOutcome {
        self.begin_refresh().wait().await
    }

    /// Start a cycle, or join the one in flight, without waiting.
    ///
    /// Must be called within a Tokio runtime.
    pub fn begin_refresh(&self) -> RefreshHandle {
        if self.inner.shutdown.is_cancelled() {
            return RefreshHandle::resolved(Err(DiscoveryError::Cancelled));
        }

        let mut inflight = self.inner.lock_inflight();
        if let Some(rx) = inflight.as_ref() {
            debug!("Refresh joined in-flight cycle");
            return RefreshHandle { rx: rx.clone() };
        }

        let (tx, rx) = watch::channel(None);
        *inflight = Some(rx.clone());
        drop(inflight);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let outcome = {
                let _slot = InflightSlot(&inner);
                inner.run_cycle().await
            };
            tx.send_replace(Some(outcome));
        });

        RefreshHandle { rx }
    }

    /// Cancel the in-flight cycle and stop the poller. Later refreshes
    /// fail with `Cancelled`; the current snapshot stays readable.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!("Discovery coordinator shutting down");
            self.inner.shutdown.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }
}

/// Frees the in-flight slot when the cycle task finishes or is dropped.
struct InflightSlot<'a>(&'a Inner);

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        self.0.lock_inflight().take();
    }
}

impl Inner {
    fn lock_inflight(&self) -> MutexGuard<'_, Option<watch::Receiver<Option<CycleOutcome>>>> {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: CyclePhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    async fn run_cycle(&self) -> CycleOutcome {
        let started = Instant::now();
        let deadline = self.cycle_deadline;

        let outcome = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(DiscoveryError::Cancelled),
            result = time::timeout(deadline, self.pipeline()) => {
                result.unwrap_or(Err(DiscoveryError::RefreshTimeout(deadline)))
            }
        };

        if let Err(e) = &outcome {
            self.set_phase(CyclePhase::Failed);
            let previous = self.current.load();
            warn!(
                error = %e,
                elapsed_ms = started.elapsed().as_millis() as u64,
                kept_cycle_id = previous.cycle_id,
                kept_endpoints = previous.len(),
                "Discovery cycle failed, keeping previous snapshot"
            );
        }
        outcome
    }

    async fn pipeline(&self) -> CycleOutcome {
        let started = Instant::now();

        self.set_phase(CyclePhase::Fetching);
        let pages = fetch_all(self.fetcher.as_ref(), self.wire_format, self.query.clone()).await?;

        self.set_phase(CyclePhase::Parsing);
        let mut records = Vec::new();
        for page in &pages {
            let parsed = self.wire_format.parse(page)?;
            debug!(
                request_id = parsed.request_id.as_deref().unwrap_or("-"),
                reservations = parsed.reservations,
                instances = parsed.instances.len(),
                "Parsed inventory page"
            );
            records.extend(parsed.instances);
        }
        let seen = records.len();

        self.set_phase(CyclePhase::Filtering);
        let matched = filter(records, &self.filter);

        self.set_phase(CyclePhase::Selecting);
        let mut endpoints = BTreeSet::new();
        for record in &matched {
            match select(record, &self.selection) {
                Some(endpoint) => {
                    endpoints.insert(endpoint);
                }
                None => debug!(
                    instance_id = %record.instance_id,
                    preference = %self.selection.preference,
                    "Instance has no usable address, skipping"
                ),
            }
        }

        let snapshot = self.publish(endpoints, seen, matched.len());
        info!(
            cycle_id = snapshot.cycle_id,
            pages = pages.len(),
            seen,
            matched = snapshot.instances_matched,
            endpoints = snapshot.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "🔭 Discovery snapshot published"
        );
        Ok(snapshot)
    }

    /// Swap in the new snapshot and notify. Runs without awaiting, so a
    /// deadline or shutdown cannot interrupt it halfway.
    fn publish(
        &self,
        endpoints: BTreeSet<PeerEndpoint>,
        instances_seen: usize,
        instances_matched: usize,
    ) -> Arc<DiscoverySnapshot> {
        let snapshot = Arc::new(DiscoverySnapshot {
            cycle_id: self.current.load().cycle_id + 1,
            taken_at: Utc::now(),
            endpoints,
            instances_seen,
            instances_matched,
        });

        self.current.store(Arc::clone(&snapshot));
        self.published.send_replace(Arc::clone(&snapshot));
        self.set_phase(CyclePhase::Published);

        for listener in &self.listeners {
            listener.on_snapshot(&snapshot);
        }
        snapshot
    }
}

// ── Builder ─────────────────────────────────────────────────────────

pub struct DiscoveryCoordinatorBuilder {
    fetcher: Arc<dyn InventoryFetcher>,
    wire_format: WireFormat,
    filter: DiscoveryFilterConfig,
    selection: EndpointSelectionPolicy,
    query: Option<InventoryQuery>,
    page_size: Option<u32>,
    cycle_deadline: Duration,
    listeners: Vec<Arc<dyn SnapshotListener>>,
}

impl DiscoveryCoordinatorBuilder {
    fn new(fetcher: Arc<dyn InventoryFetcher>) -> Self {
        Self {
            fetcher,
            wire_format: WireFormat::default(),
            filter: DiscoveryFilterConfig::default(),
            selection: EndpointSelectionPolicy::default(),
            query: None,
            page_size: None,
            cycle_deadline: DEFAULT_CYCLE_DEADLINE,
            listeners: Vec::new(),
        }
    }

    pub fn wire_format(mut self, wire_format: WireFormat) -> Self {
        self.wire_format = wire_format;
        self
    }

    pub fn filter(mut self, filter: DiscoveryFilterConfig) -> Self {
        self.filter = filter;
        self
    }

    pub fn selection(mut self, selection: EndpointSelectionPolicy) -> Self {
        self.selection = selection;
        self
    }

    /// Replace the query derived from the filter config.
    pub fn query(mut self, query: InventoryQuery) -> Self {
        self.query = Some(query);
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn cycle_deadline(mut self, deadline: Duration) -> Self {
        self.cycle_deadline = deadline;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn SnapshotListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> anyhow::Result<DiscoveryCoordinator> {
        if self.cycle_deadline.is_zero() {
            anyhow::bail!("cycle deadline must be non-zero");
        }

        let mut query = self
            .query
            .unwrap_or_else(|| InventoryQuery::for_filter(&self.filter));
        if let Some(page_size) = self.page_size {
            query = query.with_max_results(page_size);
        }

        let initial = Arc::new(DiscoverySnapshot::empty());
        let (published, _) = watch::channel(Arc::clone(&initial));

        Ok(DiscoveryCoordinator {
            inner: Arc::new(Inner {
                fetcher: self.fetcher,
                wire_format: self.wire_format,
                query,
                filter: self.filter,
                selection: self.selection,
                cycle_deadline: self.cycle_deadline,
                listeners: self.listeners,
                current: ArcSwap::new(initial),
                published,
                inflight: Mutex::new(None),
                phase: AtomicU8::new(CyclePhase::Idle as u8),
                shutdown: CancellationToken::new(),
            }),
        })
    }
}
