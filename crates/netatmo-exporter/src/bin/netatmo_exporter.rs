//! Netatmo Exporter
//!
//! Usage:
//!   netatmo_exporter                          # config.yaml + data/token.json
//!   netatmo_exporter -c /etc/netatmo.yaml     # explicit config file
//!   netatmo_exporter -t /var/lib/token.json   # explicit token file
//!   netatmo_exporter -v 3                     # debug logging

use std::process::ExitCode;
use std::sync::Arc;

use argh::FromArgs;
use log::LevelFilter;
use netatmo_exporter::{
    http_client, server, Config, ConfigSource, CredentialStore, MetricProjector, Metrics,
    Poller, StationsClient, TokenAuthenticator,
};
use tokio::sync::watch;

#[derive(FromArgs)]
/// Prometheus exporter for Netatmo weather stations
struct Args {
    /// path to the YAML config file (default: config.yaml)
    #[argh(option, short = 'c', default = "String::from(\"config.yaml\")")]
    config_file: String,

    /// path to the persisted token file (default: data/token.json)
    #[argh(option, short = 't', default = "String::from(\"data/token.json\")")]
    token_file: String,

    /// verbosity: 1=warning, 2=info, 3=debug (default: from config)
    #[argh(option, short = 'v', default = "0")]
    verbosity: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Args = argh::from_env();

    let (config, source) = match load_config(&args.config_file) {
        Ok(loaded) => loaded,
        Err(e) => {
            init_logging(LevelFilter::Info);
            log::error!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let loglevel_from_env = std::env::var_os("LOGLEVEL").is_some();
    init_logging(config.log_level(args.verbosity, loglevel_from_env));
    match source {
        ConfigSource::File => log::info!("Loaded config from {}", args.config_file),
        ConfigSource::Defaults => log::info!(
            "Config file {} not found, using defaults",
            args.config_file
        ),
    }

    match run(&args, config).await {
        Ok(()) => {
            log::info!("Netatmo exporter stopped.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: &str) -> anyhow::Result<(Config, ConfigSource)> {
    let (mut config, source) = Config::load(path)?;
    config.apply_env_overrides()?;
    Ok((config, source))
}

/// `RUST_LOG` wins when set; otherwise the resolved level applies.
fn init_logging(level: LevelFilter) {
    let env = env_logger::Env::default().default_filter_or(level.as_str());
    env_logger::init_from_env(env);
}

async fn run(args: &Args, config: Config) -> anyhow::Result<()> {
    let credentials = config.client_credentials()?;

    log::info!("Starting Netatmo exporter...");
    log::debug!("Token file: {}", args.token_file);

    let http = http_client()?;
    let auth = TokenAuthenticator::new(
        http.clone(),
        config.netatmo.token_url.as_str(),
        credentials,
        CredentialStore::new(&args.token_file),
    );
    let stations = StationsClient::new(http, config.netatmo.stations_url.as_str());
    let metrics = Arc::new(Metrics::new()?);

    let listener = server::bind(config.listen_port).await?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    // Set up Ctrl+C / SIGTERM handler
    ctrlc::set_handler({
        let shutdown_tx = shutdown_tx.clone();
        move || {
            log::info!("Received termination signal, shutting down gracefully...");
            shutdown_tx.send(()).ok();
        }
    })?;

    let server_task = tokio::spawn(server::serve(
        listener,
        metrics.clone(),
        shutdown_rx.clone(),
    ));

    log::info!(
        "Exporter ready. Metrics on port {}, polling every {} second(s).",
        config.listen_port,
        config.interval
    );

    let poller = Poller::new(
        auth,
        stations,
        MetricProjector::new(metrics),
        config.interval(),
    );
    let outcome = poller.run(shutdown_rx).await;

    // Stop the listener on fatal errors too
    shutdown_tx.send(()).ok();
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("Metrics endpoint error: {}", e),
        Err(e) => log::warn!("Metrics endpoint task failed: {}", e),
    }

    outcome?;
    Ok(())
}
