//! EC2 inventory-backed peer discovery.
//!
//! Asks the EC2 query API which instances exist, keeps the ones that look
//! like cluster peers, and turns each into a `host:port` seed endpoint.
//! The result is published as an immutable [`DiscoverySnapshot`] that a
//! membership layer reads without blocking.
//!
//! ```text
//! fetcher ──raw pages──▶ inventory ──records──▶ filter ──▶ selector ──▶ snapshot
//!    ▲                                                                     │
//!    └──────────── DiscoveryCoordinator (poller + on-demand) ◀─────────────┘
//! ```
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use ec2_discovery::{spawn_poller, DiscoveryConfig, DiscoveryCoordinator};
//!
//! let config = DiscoveryConfig::load_default()?;
//! let coordinator = DiscoveryCoordinator::from_config(&config)?;
//! let _poller = spawn_poller(&coordinator, config.refresh_interval());
//!
//! let peers = coordinator.current_snapshot();
//! for addr in peers.socket_addrs() {
//!     println!("seed {addr}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod fetcher;
pub mod filter;
pub mod inventory;
pub mod model;
pub mod selector;

pub use config::DiscoveryConfig;
pub use discovery::{
    spawn_poller, CycleOutcome, CyclePhase, DiscoveryCoordinator, DiscoveryCoordinatorBuilder,
    RefreshHandle, SnapshotListener,
};
pub use error::{DiscoveryError, Result};
pub use fetcher::signing::Credentials;
pub use fetcher::{HttpFetcher, InventoryFetcher, InventoryQuery, RetryPolicy};
pub use filter::{DiscoveryFilterConfig, TagMatch};
pub use inventory::{InventoryFormat, RawPage, WireFormat};
pub use model::{DiscoverySnapshot, InstanceRecord, InstanceState, PeerEndpoint};
pub use selector::{AddressPreference, EndpointSelectionPolicy};
