#![cfg_attr(test, allow(clippy::unwrap_used, clippy::too_many_lines))]

mod cache;
mod certificate;
mod config;
mod database;
mod demux;
mod error;
mod fingerprint;
mod http_range;
mod humanfmt;
mod mitm;
mod reverse;
mod scheduler;
mod socks5;
mod stream;
mod web_interface;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use clap::Parser;
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::header::{HeaderValue, SERVER};
use hyper::Response;
use hyper_rustls::{ConfigBuilderExt as _, HttpsConnector};
use hyper_util::client::legacy::connect::HttpConnector;
use log::{LevelFilter, debug, error, info, trace};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};
use tokio::net::TcpListener;
use tokio::runtime::Builder;
use tokio::signal::unix::SignalKind;

use crate::cache::CacheManager;
use crate::certificate::CertificateAuthority;
use crate::config::Config;
use crate::database::Database;
use crate::error::ProxyCacheError;
use crate::scheduler::Scheduler;

pub(crate) type Client = hyper_util::client::legacy::Client<
    hyper_timeout::TimeoutConnector<HttpsConnector<HttpConnector>>,
    BoxBody<bytes::Bytes, ProxyCacheError>,
>;

pub(crate) type ProxyCacheBody = BoxBody<bytes::Bytes, ProxyCacheError>;

pub(crate) const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub(crate) const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub(crate) const APP_USER_AGENT: &str =
    concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60); /* hourly */

#[must_use]
pub(crate) fn empty() -> ProxyCacheBody {
    Empty::<bytes::Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

#[must_use]
pub(crate) fn full<T: Into<bytes::Bytes>>(chunk: T) -> ProxyCacheBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

#[must_use]
pub(crate) fn quick_response<T: Into<bytes::Bytes>>(
    status: hyper::StatusCode,
    message: T,
) -> Response<ProxyCacheBody> {
    Response::builder()
        .status(status)
        .header(SERVER, HeaderValue::from_static(APP_NAME))
        .body(full(message))
        .expect("Response is valid")
}

/// Shared handles cloned into every connection task.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) database: Database,
    pub(crate) https_client: Client,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) cache: Arc<CacheManager>,
    pub(crate) ca: Arc<CertificateAuthority>,
    pub(crate) sni_tls: Arc<rustls::ServerConfig>,
    pub(crate) tls_client: Arc<rustls::ClientConfig>,
}

#[derive(Debug)]
pub(crate) struct RuntimeDetails {
    pub(crate) start_time: time::OffsetDateTime,
    config: Config,
}

pub(crate) static RUNTIMEDETAILS: OnceLock<RuntimeDetails> = OnceLock::new();

#[must_use]
pub(crate) fn global_config() -> &'static Config {
    &RUNTIMEDETAILS
        .get()
        .expect("Global was initialized in main()")
        .config
}

pub(crate) fn build_https_client(
    connect_timeout: Duration,
    http_timeout: Duration,
) -> Result<Client, std::io::Error> {
    let tls_cfg = rustls::ClientConfig::builder()
        .with_native_roots()?
        .with_no_client_auth();
    let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_cfg)
        .https_or_http()
        .enable_http1()
        .build();

    let mut timeout_connector = hyper_timeout::TimeoutConnector::new(https_connector);
    timeout_connector.set_connect_timeout(Some(connect_timeout));
    timeout_connector.set_read_timeout(Some(http_timeout));
    timeout_connector.set_write_timeout(Some(http_timeout));

    Ok(
        hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
            .build(timeout_connector),
    )
}

async fn run_housekeeping(state: &AppState) {
    match state.cache.cleanup_expired().await {
        Ok(removed) => {
            for file_hash in &removed {
                state.scheduler.forget(file_hash);
            }
        }
        Err(err) => error!("Error performing TTL cleanup:  {err}"),
    }

    match state
        .cache
        .lru_evict(global_config().cache.max_total_size)
        .await
    {
        Ok(removed) => {
            for file_hash in &removed {
                state.scheduler.forget(file_hash);
            }
        }
        Err(err) => error!("Error performing LRU eviction:  {err}"),
    }
}

async fn main_loop(args: &Cli) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = global_config();

    /* Set a process wide default crypto provider. */
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let https_client = build_https_client(config.connect_timeout, config.http_timeout)?;

    let tls_client = Arc::new(
        rustls::ClientConfig::builder()
            .with_native_roots()?
            .with_no_client_auth(),
    );

    let database = Database::connect(&args.database_path, config.database_slow_timeout)
        .await
        .map_err(|err| {
            error!("Error creating database:  {err}");
            err
        })?;

    database.init_tables().await.map_err(|err| {
        error!("Error initializing database:  {err}");
        err
    })?;

    let cache = Arc::new(
        CacheManager::new(database.clone(), &config.cache.cache_dir, config.cache.ttl).map_err(
            |err| {
                error!("Error setting up cache directory:  {err}");
                err
            },
        )?,
    );
    info!(
        "Using cache directory `{}`",
        config.cache.cache_dir.display()
    );

    let ca_dir = CertificateAuthority::default_directory()
        .ok_or("Failed to determine the home directory for the root CA material")?;
    let ca = Arc::new(CertificateAuthority::load_or_create(&ca_dir).map_err(|err| {
        error!("Error setting up root CA:  {err}");
        err
    })?);
    info!(
        "Using root CA certificate `{}`",
        ca.cert_path().display()
    );

    let scheduler = Arc::new(Scheduler::new(database.clone(), https_client.clone()));
    let sni_tls = ca.sni_server_config();

    let state = AppState {
        database,
        https_client,
        scheduler,
        cache,
        ca,
        sni_tls,
        tls_client,
    };

    let addr = config.listen_socket();
    let listener = TcpListener::bind(addr).await.map_err(|err| {
        error!("Error binding on {addr}:  {err}");
        err
    })?;
    info!(
        "Listening on {addr} (proxy mode {:?})",
        config.proxy_mode
    );

    let mut term_signal = tokio::signal::unix::signal(SignalKind::terminate())?;

    let first_cleanup = tokio::time::Instant::now() + CLEANUP_INTERVAL;
    let mut cleanup_interval = tokio::time::interval_at(first_cleanup, CLEANUP_INTERVAL);

    loop {
        let next = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, stopping...");
                return Ok(());
            },
            _ = term_signal.recv() => {
                info!("SIGTERM received, stopping...");
                return Ok(());
            },
            _ = cleanup_interval.tick() => {
                info!("Hourly cache housekeeping issued...");
                let st = state.clone();
                tokio::task::spawn(async move {
                    run_housekeeping(&st).await;
                });
                continue;
            },
            n = listener.accept() => n,
        };

        let (conn_stream, client) = next.map_err(|err| {
            error!("Error accepting connection:  {err}");
            err
        })?;

        debug!("New client connection from {}", client.ip());

        let st = state.clone();
        tokio::task::spawn(async move {
            demux::handle_connection(conn_stream, client, st).await;
        });
    }
}

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Logging level
    #[arg(short, long, value_name = "SEVERITY")]
    log_level: Option<LevelFilter>,
    /// Configuration file path
    #[arg(
        short = 'c',
        long = "config",
        default_value = config::DEFAULT_CONFIGURATION_PATH,
        value_name = "PATH"
    )]
    config_path: PathBuf,
    /// SQLite database path
    #[arg(
        short = 'd',
        long = "db",
        default_value = config::DEFAULT_DATABASE_PATH,
        value_name = "PATH"
    )]
    database_path: PathBuf,
    /// Skip timestamp in log messages
    #[arg(long, default_value = "false")]
    skip_log_timestamp: bool,
    /// Permit daemon running as root user (potentially dangerous)
    #[arg(long, default_value = "false")]
    permit_running_daemon_as_root: bool,
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub(crate) fn init_test_runtime() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        RUNTIMEDETAILS.get_or_init(|| RuntimeDetails {
            start_time: time::OffsetDateTime::now_utc(),
            config: config::for_tests(),
        });
    }

    /// Full application state backed by temporary directories and an
    /// in-memory store.
    pub(crate) async fn test_state() -> (AppState, tempfile::TempDir) {
        init_test_runtime();

        let dir = tempfile::tempdir().unwrap();
        let database = database::connect_memory().await;
        let https_client =
            build_https_client(Duration::from_secs(2), Duration::from_secs(30)).unwrap();
        let cache = Arc::new(
            CacheManager::new(
                database.clone(),
                &dir.path().join("cache"),
                Duration::from_secs(3600),
            )
            .unwrap(),
        );
        let ca = Arc::new(CertificateAuthority::load_or_create(&dir.path().join("ca")).unwrap());
        let scheduler = Arc::new(Scheduler::new(database.clone(), https_client.clone()));
        let sni_tls = ca.sni_server_config();
        let tls_client = Arc::new(
            rustls::ClientConfig::builder()
                .with_native_roots()
                .unwrap()
                .with_no_client_auth(),
        );

        let state = AppState {
            database,
            https_client,
            scheduler,
            cache,
            ca,
            sni_tls,
            tls_client,
        };

        (state, dir)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Cli::parse();

    let (config, cfg_fallback) = Config::new(&args.config_path)?;

    let config_log_level = config.log_level;

    RUNTIMEDETAILS
        .set(RuntimeDetails {
            start_time: time::OffsetDateTime::now_utc(),
            config,
        })
        .expect("Initial set should succeed");

    let output_log_config = if args.skip_log_timestamp {
        ConfigBuilder::new()
            .set_time_level(LevelFilter::Off)
            .build()
    } else {
        simplelog::Config::default()
    };

    TermLogger::init(
        args.log_level.unwrap_or(config_log_level),
        output_log_config,
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )?;

    debug!("Logger initialized");
    trace!("Tracing enabled");

    if cfg_fallback {
        info!(
            "Default configuration file {} not found, using defaults",
            args.config_path.display()
        );
    }

    debug!("Configuration: {:?}", global_config());

    if nix::unistd::getuid().is_root() {
        if args.permit_running_daemon_as_root {
            log::warn!("!! Running as root is not recommended !!");
        } else {
            error!("Running as root is not recommended and not permitted by default");
            std::process::exit(1);
        }
    }

    std::panic::set_hook(Box::new(move |info| {
        error!("{info}");
        eprintln!("{info}");
    }));

    scopeguard::defer! {
        info!("Stopped.");
    }

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .thread_name("cdn-cacher-rs-w")
        .build()
        .expect("Should succeed");

    runtime.block_on(async { main_loop(&args).await })
}
