//! Daemon assembly and lifecycle
//!
//! Every shared component is built exactly once here and handed out by
//! `Arc`. The daemon stops on Ctrl+C, or after `idle_exit_secs` without
//! requests or fetches when configured.

use crate::admin::{start_admin_server, AdminState};
use crate::config::{Config, ConfigError};
use crate::coordinator::{ActivityTracker, CoordinatorSettings, RequestCoordinator};
use crate::fetch::{FetchError, Fetcher, NetworkFetcher};
use crate::refresh::RefreshEngine;
use crate::store::ResponseCache;
use crate::sweeper::PeriodicSweeper;
use ocspd_proto::{CrlVerifier, ParseError, TrustAnchorVerifier, X509AttributeExtractor};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot create fetcher: {0}")]
    Fetcher(#[from] FetchError),

    #[error("cannot load trust anchors: {0}")]
    TrustAnchors(#[from] ParseError),

    #[error("admin server error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Daemon {
    config: Config,
    cache: Arc<ResponseCache>,
    fetcher: Arc<dyn Fetcher>,
    verifier: Option<Arc<dyn CrlVerifier>>,
    activity: Arc<ActivityTracker>,
    coordinator: Arc<RequestCoordinator>,
    sweeper: Arc<PeriodicSweeper>,
}

impl Daemon {
    /// Build the daemon with the network fetcher
    pub fn build(config: Config) -> Result<Self, DaemonError> {
        let fetcher = Arc::new(NetworkFetcher::new(&config.fetch)?);
        Self::build_with_fetcher(config, fetcher)
    }

    /// Build the daemon around a caller-supplied fetcher
    pub fn build_with_fetcher(config: Config, fetcher: Arc<dyn Fetcher>) -> Result<Self, DaemonError> {
        config.validate()?;

        let cache = Arc::new(
            ResponseCache::new(config.cache_path(), Arc::new(X509AttributeExtractor))
                .with_max_payload_bytes(config.max_payload_bytes),
        );

        let verifier: Option<Arc<dyn CrlVerifier>> = match &config.refresh.trust_anchors_path {
            Some(path) if config.refresh.full_crypto_verify => {
                let anchors = TrustAnchorVerifier::from_pem_file(path)?;
                info!(path = %path, anchors = anchors.len(), "Loaded CRL trust anchors");
                Some(Arc::new(anchors))
            }
            _ => None,
        };

        let activity = ActivityTracker::new();
        let mut coordinator = RequestCoordinator::new(
            Arc::clone(&cache),
            Arc::clone(&fetcher),
            Arc::clone(&activity),
            CoordinatorSettings::from(&config),
        );
        if let Some(verifier) = &verifier {
            coordinator = coordinator.with_verifier(Arc::clone(verifier));
        }

        let engine = RefreshEngine::new(Arc::clone(&cache), Arc::clone(&fetcher), verifier.clone())
            .with_activity(Arc::clone(&activity));
        let sweeper = PeriodicSweeper::new(engine, Arc::clone(&cache), config.refresh.clone());

        Ok(Self {
            config,
            cache,
            fetcher,
            verifier,
            activity,
            coordinator: Arc::new(coordinator),
            sweeper: Arc::new(sweeper),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn coordinator(&self) -> &Arc<RequestCoordinator> {
        &self.coordinator
    }

    pub fn sweeper(&self) -> &Arc<PeriodicSweeper> {
        &self.sweeper
    }

    /// A refresh engine sharing this daemon's cache, fetcher and verifier
    pub fn refresh_engine(&self) -> RefreshEngine {
        RefreshEngine::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.fetcher),
            self.verifier.clone(),
        )
        .with_activity(Arc::clone(&self.activity))
    }

    /// Serve until Ctrl+C or the idle limit
    pub async fn run(self) -> Result<(), DaemonError> {
        let addr = self.config.admin_addr()?;
        let idle_limit = self.config.idle_exit_secs.map(Duration::from_secs);

        if self.config.sweeper.enabled {
            self.sweeper.start(&self.config.sweeper);
        } else {
            info!("Periodic sweeper disabled");
        }

        let state = AdminState::new(Arc::clone(&self.coordinator), Arc::clone(&self.sweeper));
        let shutdown = shutdown_signal(Arc::clone(&self.activity), idle_limit);
        let served = start_admin_server(state, addr, shutdown).await;

        info!("Shutting down");
        self.coordinator.close();
        self.sweeper.shutdown().await;
        served?;
        Ok(())
    }
}

async fn shutdown_signal(activity: Arc<ActivityTracker>, idle_limit: Option<Duration>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let idle = async {
        match idle_limit {
            Some(limit) => wait_for_idle(&activity, limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = idle => {}
    }
}

/// Resolve once nothing has happened for `limit`
///
/// In-progress fetches count as activity, so the process never exits
/// while one is running.
pub async fn wait_for_idle(activity: &ActivityTracker, limit: Duration) {
    let period = (limit / 4).clamp(Duration::from_millis(10), Duration::from_secs(5));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        if activity.idle_for() >= limit {
            info!(idle_secs = limit.as_secs(), "Idle limit reached");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::mock::MockFetcher;

    fn config(dir: &std::path::Path) -> Config {
        Config {
            cache_dir: dir.display().to_string(),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_idle_waits_for_active_fetch() {
        let activity = ActivityTracker::new();
        let guard = activity.begin();

        let waited = tokio::time::timeout(
            Duration::from_millis(150),
            wait_for_idle(&activity, Duration::from_millis(40)),
        )
        .await;
        assert!(waited.is_err(), "went idle during a fetch");

        drop(guard);
        tokio::time::timeout(
            Duration::from_secs(2),
            wait_for_idle(&activity, Duration::from_millis(40)),
        )
        .await
        .expect("idle after the fetch finished");
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.max_concurrent_requests = 0;

        assert!(matches!(
            Daemon::build_with_fetcher(config, Arc::new(MockFetcher::new())),
            Err(DaemonError::Config(_))
        ));
    }

    #[test]
    fn test_build_requires_readable_anchors() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.refresh.full_crypto_verify = true;
        config.refresh.trust_anchors_path =
            Some(dir.path().join("missing.pem").display().to_string());

        assert!(matches!(
            Daemon::build_with_fetcher(config, Arc::new(MockFetcher::new())),
            Err(DaemonError::TrustAnchors(_))
        ));
    }

    #[tokio::test]
    async fn test_built_components_share_one_cache() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = Daemon::build_with_fetcher(config(dir.path()), Arc::new(MockFetcher::new()))
            .unwrap();

        assert!(Arc::ptr_eq(daemon.cache(), daemon.coordinator().cache()));
        let report = daemon
            .refresh_engine()
            .run(&daemon.config().refresh, chrono::Utc::now())
            .await
            .unwrap();
        assert_eq!(report.scanned, 0);
    }

    #[tokio::test]
    async fn test_sweep_refresh_keeps_daemon_active() {
        use ocspd_proto::fixture::CrlBuilder;
        use ocspd_proto::ArtifactKind;

        let dir = tempfile::tempdir().unwrap();
        let url = "http://ca.example/ca.crl";
        let expiring = |minutes: i64| {
            let now = chrono::Utc::now();
            CrlBuilder::new("Idle Test CA")
                .this_update_at(now - chrono::Duration::days(1))
                .next_update_at(now + chrono::Duration::minutes(minutes))
                .build()
        };
        let fetcher = MockFetcher::new().with_delay(Duration::from_millis(300));
        fetcher.respond(url, Ok(expiring(60 * 24 * 7)));
        let daemon = Daemon::build_with_fetcher(config(dir.path()), Arc::new(fetcher)).unwrap();
        // Inside the expiry overlap, so the sweep re-fetches it
        daemon
            .cache()
            .insert(ArtifactKind::Crl, &expiring(10), Some(url))
            .unwrap();
        let activity = Arc::clone(daemon.coordinator().activity());
        let sweeper = Arc::clone(daemon.sweeper());

        let sweep = tokio::spawn(async move { sweeper.trigger_now().await });
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(activity.active_count(), 1);

        let report = sweep.await.unwrap().unwrap();
        assert_eq!(report.crl.refreshed, 1);
        assert_eq!(activity.active_count(), 0);
    }
}
