use chrono::Local;
use clap::Parser;
use ffp_core::{ConfigError, MapConfig, ServiceConfig};
use ffp_driver::{DriverFactory, WebDriverFactory};
use ffp_locate::{AddressResolver, HighwayTable, NominatimGeocoder};
use std::{fs::OpenOptions, io, path::PathBuf, sync::Arc};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    EnvFilter,
};

mod distributor;
mod poller;
mod reconciler;

use distributor::Distributor;
use poller::{FeedSource, Poller};

const DEFAULT_LOG_DIR: &str = "logs";

#[derive(Parser, Debug)]
#[command(name = "ffp-infoscreen")]
struct Args {
    #[arg(long, env = "FFP_CONFIG", default_value = "ffp_infoscreen_config.json")]
    config: PathBuf,
    /// Read the feed from a local JSON snapshot instead of the network.
    #[arg(long)]
    testdata: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, env = "FFP_LOG_DIR", default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let loaded = load_config(&args);
    let log_config = loaded.as_ref().ok().map(|config| &config.log);
    init_logging(
        args.debug,
        &resolve_log_dir(&args.log_dir, log_config.and_then(|log| log.dir.as_deref())),
        log_config.and_then(|log| log.level.as_deref()),
    );

    let config = match loaded {
        Ok(config) => config,
        Err(err) => {
            error!(event = "config_error", path = %args.config.display(), error = %err);
            return;
        }
    };

    let source = match FeedSource::from_config(&config.feed) {
        Ok(source) => source,
        Err(err) => {
            error!(event = "feed_setup_failed", error = %err);
            return;
        }
    };

    let distributor = Distributor::new();
    let mut tasks = JoinSet::new();
    for screen in &config.screens {
        let factory: Arc<dyn DriverFactory> =
            match WebDriverFactory::new(&screen.webdriver_url, &config.browser) {
                Ok(factory) => Arc::new(factory),
                Err(err) => {
                    error!(event = "driver_setup_failed", screen = %screen.name, error = %err);
                    return;
                }
            };
        tasks.spawn(reconciler::supervise(
            screen.clone(),
            config.fallback_url.clone(),
            config.settle_delay(),
            factory,
            distributor.clone(),
        ));
    }

    let mut poller = Poller::new(
        source,
        config.feed.alarm_codes(),
        config.feed.period(),
        distributor,
    );
    if let Some(map) = &config.map {
        match build_resolver(map) {
            Ok(resolver) => poller = poller.with_resolver(Arc::new(resolver)),
            Err(err) => warn!(event = "map_disabled", error = %err),
        }
    }
    let mut maps = poller.map_updates();
    tasks.spawn(async move {
        while maps.changed().await.is_ok() {
            let params = *maps.borrow_and_update();
            match params {
                Some(params) => info!(event = "incident_map", path = %params),
                None => info!(event = "incident_map_cleared"),
            }
        }
    });
    tasks.spawn(poller.run());

    info!(
        event = "service_start",
        config = %args.config.display(),
        screens = config.screens.len(),
        offline = config.feed.testdata.is_some()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(event = "service_stop");
                break;
            }
            joined = tasks.join_next() => match joined {
                Some(Err(err)) => error!(event = "task_failed", error = %err),
                Some(Ok(())) => {}
                None => break,
            },
        }
    }
}

fn load_config(args: &Args) -> Result<ServiceConfig, ConfigError> {
    let mut config = ServiceConfig::read(&args.config)?;
    if let Some(path) = &args.testdata {
        config.feed.testdata = Some(path.clone());
    }
    config.validate()?;
    Ok(config)
}

fn build_resolver(map: &MapConfig) -> Result<AddressResolver, ffp_locate::LocateError> {
    let highway = match &map.highway_markers {
        Some(path) => HighwayTable::load(path)?,
        None => HighwayTable::default(),
    };
    let geocoder = NominatimGeocoder::new(&map.geocoder_url, &map.user_agent)?;
    info!(
        event = "map_ready",
        highway = %map.highway_name,
        markers = highway.len(),
        geocoder = %map.geocoder_url
    );
    Ok(AddressResolver::new(map.highway_name.clone(), highway, Arc::new(geocoder)).with_zoom(map.zoom))
}

/// `--debug` wins over `RUST_LOG`, which wins over `FFP_LOG_LEVEL` and the config level.
fn log_filter(debug: bool, config_level: Option<&str>) -> EnvFilter {
    if debug {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("FFP_LOG_LEVEL")
            .ok()
            .filter(|level| !level.trim().is_empty())
            .or_else(|| config_level.map(str::to_string))
            .unwrap_or_else(|| "info".to_string());
        EnvFilter::new(level)
    })
}

/// Logs to stdout and, when the directory is usable, to a per-run file in `log_dir`.
fn init_logging(debug: bool, log_dir: &str, config_level: Option<&str>) {
    let writer = match open_log_file(log_dir) {
        Ok(Some(file)) => BoxMakeWriter::new(io::stdout.and(file)),
        Ok(None) => BoxMakeWriter::new(io::stdout),
        Err(err) => {
            eprintln!("log_file_error: {err}");
            BoxMakeWriter::new(io::stdout)
        }
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(log_filter(debug, config_level))
        .with_writer(writer)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn open_log_file(log_dir: &str) -> io::Result<Option<Arc<std::fs::File>>> {
    if log_dir.trim().is_empty() {
        return Ok(None);
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!(
        "ffp-infoscreen-{}.log",
        Local::now().format("%Y%m%d-%H%M%S")
    ));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Some(Arc::new(file)))
}

/// `--log-dir` / `FFP_LOG_DIR`, then the config file, then `logs`.
fn resolve_log_dir(log_dir_flag: &str, configured: Option<&str>) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    match configured {
        Some(dir) if !dir.trim().is_empty() => dir.to_string(),
        _ => DEFAULT_LOG_DIR.to_string(),
    }
}
