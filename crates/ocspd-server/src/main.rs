use clap::{Parser, Subcommand, ValueEnum};
use ocspd_proto::ArtifactKind;
use ocspd_server::{CacheKey, Config, Daemon, RefreshConfig};
use std::process;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// ocspd - OCSP/CRL revocation cache daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "ocspd")]
struct Cli {
    /// Path to configuration file
    #[arg(value_name = "CONFIG", default_value = "config.json")]
    config_path: String,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon (default)
    Serve,

    /// Run one CRL refresh pass and exit
    Refresh {
        /// Days past nextUpdate after which an expired CRL is deleted
        #[arg(long)]
        stale_days: Option<u32>,

        /// Seconds before nextUpdate at which a CRL counts as expired
        #[arg(long, value_name = "SECS")]
        expire_overlap: Option<u64>,

        /// Delete every cached CRL
        #[arg(long)]
        purge_all: bool,

        /// Verify CRL signatures against the configured trust anchors
        #[arg(long)]
        full_crypto_verify: bool,

        /// Only delete; do not re-fetch expired CRLs
        #[arg(long)]
        no_refresh: bool,
    },

    /// Delete cached records
    Flush {
        #[arg(long, value_enum, required_unless_present = "stale")]
        kind: Option<KindArg>,

        /// Issuer/certificate identity (hex)
        #[arg(long, requires = "kind")]
        identity: Option<String>,

        /// Source URL
        #[arg(long, requires = "kind")]
        url: Option<String>,

        /// Delete stale CRLs and expired OCSP responses instead
        #[arg(long, conflicts_with = "kind")]
        stale: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Crl,
    Ocsp,
}

impl From<KindArg> for ArtifactKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Crl => ArtifactKind::Crl,
            KindArg::Ocsp => ArtifactKind::Ocsp,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    // Load or create configuration (without logging first)
    let config = match Config::from_file(&cli.config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing_subscriber::registry()
                .with(EnvFilter::new("info"))
                .with(tracing_subscriber::fmt::layer())
                .init();

            if cli.validate {
                eprintln!("Configuration validation failed!");
                eprintln!("   Error: {}", e);
                process::exit(1);
            }

            warn!("Could not load config file from {}: {}", cli.config_path, e);
            if std::path::Path::new(&cli.config_path).exists() {
                process::exit(1);
            }
            info!("Creating example configuration at: {}", cli.config_path);
            if let Err(e) = Config::example().to_file(&cli.config_path) {
                error!("Error creating example config: {}", e);
                process::exit(1);
            }
            info!("Please edit {} and restart ocspd", cli.config_path);
            process::exit(0);
        }
    };

    if cli.validate {
        println!("✓ Configuration validated successfully!");
        println!();
        println!("Configuration summary:");
        println!("  Cache directory: {}", config.cache_dir);
        println!("  Admin listen: {}", config.admin_listen);
        println!("  Log level: {}", config.effective_log_level());
        println!("  Max concurrent requests: {}", config.max_concurrent_requests);
        println!("  CRL wait ceiling: {} ms", config.crl_wait_ceiling_ms);
        println!(
            "  Refresh: stale after {} days, {} s overlap, crypto verify {}",
            config.refresh.effective_stale_days(),
            config.refresh.effective_expire_overlap_secs(),
            config.refresh.full_crypto_verify
        );
        if config.sweeper.enabled {
            println!("  Sweeper: every {} s", config.sweeper.interval_secs);
        } else {
            println!("  Sweeper: disabled");
        }
        process::exit(0);
    }

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.effective_log_level())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(threads) = config.worker_threads {
        builder.worker_threads(threads);
    }
    let runtime = match builder.build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            process::exit(1);
        }
    };

    let code = runtime.block_on(run(config, cli.command.unwrap_or(Command::Serve)));
    process::exit(code);
}

async fn run(mut config: Config, command: Command) -> i32 {
    match command {
        Command::Serve => {
            info!("ocspd v{}", env!("CARGO_PKG_VERSION"));
            info!("Cache directory: {}", config.cache_dir);
            let daemon = match Daemon::build(config) {
                Ok(d) => d,
                Err(e) => {
                    error!("Failed to start: {}", e);
                    return 1;
                }
            };
            match daemon.run().await {
                Ok(()) => 0,
                Err(e) => {
                    error!("Daemon error: {}", e);
                    1
                }
            }
        }
        Command::Refresh {
            stale_days,
            expire_overlap,
            purge_all,
            full_crypto_verify,
            no_refresh,
        } => {
            let refresh = RefreshConfig {
                stale_days: stale_days.unwrap_or(config.refresh.stale_days),
                expire_overlap_secs: expire_overlap.unwrap_or(config.refresh.expire_overlap_secs),
                purge_all: purge_all || config.refresh.purge_all,
                full_crypto_verify: full_crypto_verify || config.refresh.full_crypto_verify,
                do_refresh: !no_refresh && config.refresh.do_refresh,
                trust_anchors_path: config.refresh.trust_anchors_path.clone(),
            };
            config.refresh = refresh;
            refresh_once(config, false).await
        }
        Command::Flush { stale: true, .. } => {
            config.refresh.do_refresh = false;
            refresh_once(config, true).await
        }
        Command::Flush {
            kind, identity, url, ..
        } => {
            let Some(kind) = kind else {
                error!("flush requires --kind or --stale");
                return 2;
            };
            let mut key = CacheKey::new(kind.into());
            if let Some(identity) = identity {
                match hex::decode(&identity) {
                    Ok(bytes) => key = key.with_identity(bytes),
                    Err(e) => {
                        error!("Invalid --identity: {}", e);
                        return 2;
                    }
                }
            }
            if let Some(url) = url {
                key = key.with_url(url);
            }
            let daemon = match Daemon::build(config) {
                Ok(d) => d,
                Err(e) => {
                    error!("{}", e);
                    return 1;
                }
            };
            match daemon.coordinator().flush(&key).await {
                Ok(removed) => {
                    println!("{}", serde_json::json!({ "removed": removed }));
                    0
                }
                Err(e) => {
                    error!("Flush failed: {}", e);
                    1
                }
            }
        }
    }
}

/// One offline refresh pass, optionally followed by an OCSP purge
async fn refresh_once(config: Config, purge_ocsp: bool) -> i32 {
    let daemon = match Daemon::build(config) {
        Ok(d) => d,
        Err(e) => {
            error!("{}", e);
            return 1;
        }
    };
    let now = chrono::Utc::now();
    let report = match daemon.refresh_engine().run(&daemon.config().refresh, now).await {
        Ok(report) => report,
        Err(e) => {
            error!("Refresh failed: {}", e);
            return 1;
        }
    };
    let ocsp_purged = if purge_ocsp {
        match daemon.cache().blocking(move |c| c.purge_expired_ocsp(now)).await {
            Ok(n) => n,
            Err(e) => {
                error!("OCSP purge failed: {}", e);
                return 1;
            }
        }
    } else {
        0
    };

    match serde_json::to_string_pretty(&serde_json::json!({
        "crl": report,
        "ocsp_purged": ocsp_purged,
    })) {
        Ok(json) => println!("{}", json),
        Err(e) => warn!("Cannot render report: {}", e),
    }
    0
}
