//! ocspd daemon
//!
//! Caches OCSP responses and CRLs on disk, fetches them over HTTP or LDAP
//! on a miss, and keeps cached CRLs fresh in the background.
//!
//! # Components
//!
//! - [`store::ResponseCache`]: persistent cache keyed by identity and source URL
//! - [`fetch::Fetcher`]: HTTP and LDAP retrieval
//! - [`refresh::RefreshEngine`]: deletes bad or stale CRLs, re-fetches expired ones
//! - [`coordinator::RequestCoordinator`]: cache-then-network lookups with
//!   concurrent fetch deduplication
//! - [`sweeper::PeriodicSweeper`]: runs the refresh engine on a schedule
//!
//! # Example
//!
//! ```rust,no_run
//! use ocspd_server::{Config, Daemon};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("config.json")?;
//!     Daemon::build(config)?.run().await?;
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod fetch;
pub mod refresh;
pub mod store;
pub mod sweeper;

pub use config::{Config, ConfigError, FetchConfig, RefreshConfig, SweeperConfig};
pub use coordinator::{
    ErrorCode, LookupError, LookupRequest, LookupResponse, Origin, RequestCoordinator,
};
pub use daemon::{Daemon, DaemonError};
pub use fetch::{FetchError, FetchTarget, Fetcher, NetworkFetcher};
pub use refresh::{RefreshEngine, RefreshError, RefreshReport};
pub use store::{CacheKey, InsertOutcome, ResponseCache, StoreError};
pub use sweeper::{PeriodicSweeper, SweepError, SweepReport};
