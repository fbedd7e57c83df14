mod control_commands;
mod doctor_commands;

use std::{net::SocketAddr, path::PathBuf};

use {
    anyhow::{Context, bail},
    clap::{Parser, Subcommand},
    parley_config::{ParleyConfig, Severity},
    parley_engine::Engine,
    parley_whatsapp::WhatsAppTransport,
    tokio_util::sync::CancellationToken,
    tracing::{error, info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "parley", about = "parley — WhatsApp conversational relay", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (overrides discovery of parley.{toml,yaml,json}).
    #[arg(long, global = true, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,
    /// Data directory for snapshots, auth state and temp audio.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Address the HTTP façade binds to.
    #[arg(long, global = true)]
    bind: Option<String>,
    /// Port of the HTTP façade.
    #[arg(long, global = true)]
    port: Option<u16>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Run the relay (default when no subcommand is provided).
    Serve,
    /// Ask a running relay to flush its pending replies now.
    Flush,
    /// Print the stats of a running relay.
    Status,
    /// Validate config and check the local installation.
    Doctor,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

/// File (or discovered) config, then environment, then flags.
fn load_config(cli: &Cli) -> anyhow::Result<ParleyConfig> {
    let mut config = match &cli.config {
        Some(path) => parley_config::load_config(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => parley_config::discover_and_load(),
    };
    parley_config::apply_env_overrides(&mut config);
    apply_cli_overrides(cli, &mut config);
    Ok(config)
}

fn apply_cli_overrides(cli: &Cli, config: &mut ParleyConfig) {
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(bind) = &cli.bind {
        config.server.bind = bind.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn serve(config: ParleyConfig) -> anyhow::Result<()> {
    let report = parley_config::validate(&config);
    for diagnostic in &report.diagnostics {
        match diagnostic.severity {
            Severity::Error => error!(%diagnostic, "invalid config"),
            Severity::Warning => warn!(%diagnostic, "questionable config"),
        }
    }
    if report.has_errors() {
        bail!("configuration is invalid; run `parley doctor` for details");
    }

    for dir in [
        config.data_dir.clone(),
        config.voice_temp_dir(),
        config.whatsapp_auth_dir(),
    ] {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .context("invalid server bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let (transport, events) = WhatsAppTransport::new(&config.whatsapp, config.whatsapp_auth_dir());
    info!(
        ai_backend = %config.backend.ai_endpoint(),
        voice_backend = %config.backend.voice_endpoint(),
        data_dir = %config.data_dir.display(),
        "relay configured"
    );
    let engine = Engine::from_config(config, transport.clone())?;

    let signals = tokio::spawn({
        let engine = engine.clone();
        async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            engine.shutdown();
        }
    });

    let http_stop = CancellationToken::new();
    let http = tokio::spawn(parley_gateway::serve(listener, engine.clone(), {
        let stop = http_stop.clone();
        async move { stop.cancelled().await }
    }));

    let result = engine.run(events).await;

    http_stop.cancel();
    signals.abort();
    transport.shutdown().await;
    match http.await {
        Ok(Ok(())) => {},
        Ok(Err(e)) => warn!(error = %e, "http façade failed"),
        Err(e) => warn!(error = %e, "http façade task failed"),
    }

    match result {
        Ok(()) => {
            info!("parley stopped");
            Ok(())
        },
        Err(e) => {
            error!(error = %e, "relay stopped");
            Err(e.into())
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let config = load_config(&cli)?;

    match cli.command {
        None | Some(Commands::Serve) => {
            info!(version = env!("CARGO_PKG_VERSION"), "parley starting");
            serve(config).await
        },
        Some(Commands::Flush) => control_commands::flush(&config).await,
        Some(Commands::Status) => control_commands::status(&config).await,
        Some(Commands::Doctor) => doctor_commands::run(&config),
    }
}
