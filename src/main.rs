mod api;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;
use warelay_core::config::{self, shellexpand, Config, ServerMode};
use warelay_sessions::{
    qr::generate_qr_terminal, whatsapp::WhatsAppBackend, InstanceRegistry, RegistryOptions,
};

#[derive(Parser)]
#[command(
    name = "warelay",
    version,
    about = "warelay: send WhatsApp messages over HTTP"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file.
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server.
    Serve(Overrides),
    /// Validate the configuration and print the effective settings.
    Check(Overrides),
}

/// Command-line and environment settings that win over the config file.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Port to listen on.
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Shared secret every request must present.
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Endpoint set to expose: `multi` or `single`.
    #[arg(long)]
    mode: Option<ServerMode>,
}

impl Overrides {
    fn apply(self, cfg: &mut Config) {
        if let Some(port) = self.port {
            cfg.server.port = port;
        }
        if let Some(key) = self.api_key {
            cfg.server.api_key = key;
        }
        if let Some(mode) = self.mode {
            cfg.server.mode = mode;
        }
        // One implicit slot.
        if cfg.server.mode == ServerMode::Single {
            cfg.sessions.max_instances = 1;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(overrides) => {
            let mut cfg = config::load(&cli.config)?;
            overrides.apply(&mut cfg);
            cfg.validate()?;

            let _guard = init_logging(&cfg)?;
            serve(cfg).await?;
        }
        Commands::Check(overrides) => {
            let mut cfg = config::load(&cli.config)?;
            overrides.apply(&mut cfg);

            println!("warelay: Config Check\n");
            println!("Config: {}", cli.config);
            print_config(&cfg);
            println!();

            match cfg.validate() {
                Ok(()) => println!("  config: ok"),
                Err(e) => anyhow::bail!("{e}"),
            }
        }
    }

    Ok(())
}

/// Console logging, plus `{data_dir}/logs/warelay.log` when enabled.
///
/// `RUST_LOG` wins over `relay.log_level`.
fn init_logging(cfg: &Config) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(&cfg.relay.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    });

    if !cfg.relay.log_file {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    }

    let log_dir = PathBuf::from(shellexpand(&cfg.relay.data_dir)).join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let (file, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(&log_dir, "warelay.log"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(std::io::stdout.and(file))
        .init();
    Ok(Some(guard))
}

async fn serve(cfg: Config) -> anyhow::Result<()> {
    let backend = Arc::new(WhatsAppBackend::new(
        &cfg.relay.data_dir,
        &cfg.sessions.device_name,
    ));
    let options = RegistryOptions::from(&cfg.sessions);
    let mode = cfg.server.mode;

    let registry = match mode {
        ServerMode::Multi => InstanceRegistry::new(backend, options),
        ServerMode::Single => InstanceRegistry::with_qr_listener(backend, options, print_qr),
    };

    if mode == ServerMode::Single {
        let registry = registry.clone();
        let identity = cfg.sessions.default_identity.clone();
        tokio::spawn(async move {
            match registry.create(&identity).await {
                Ok(_) => info!("default session '{identity}' started, waiting for login"),
                Err(e) => error!("default session '{identity}' failed to start: {e}"),
            }
        });
    }

    let state = api::ApiState::new(
        registry.clone(),
        &cfg.server.api_key,
        mode,
        &cfg.sessions.default_identity,
    );
    let addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    let result = api::serve(state, &addr, shutdown_signal()).await;

    registry.shutdown().await;
    info!("warelay stopped");
    result
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => {
            error!("failed to listen for shutdown signal: {e}");
            std::future::pending::<()>().await;
        }
    }
}

/// Render a login QR on the terminal (single-instance mode).
fn print_qr(instance_id: &str, payload: &str) {
    match generate_qr_terminal(payload) {
        Ok(qr) => println!(
            "\nScan with WhatsApp > Linked devices to log in '{instance_id}':\n\n{qr}"
        ),
        Err(e) => warn!("instance {instance_id}: could not render QR: {e}"),
    }
}

fn print_config(cfg: &Config) {
    println!("  mode: {}", cfg.server.mode.as_str());
    println!("  listen: {}:{}", cfg.server.host, cfg.server.port);
    println!("  api_key: {}", redact(&cfg.server.api_key));
    println!("  data_dir: {}", shellexpand(&cfg.relay.data_dir));
    println!(
        "  log: {}{}",
        cfg.relay.log_level,
        if cfg.relay.log_file { " (+ file)" } else { "" }
    );
    println!("  max_instances: {}", cfg.sessions.max_instances);
    println!(
        "  timeouts: init {}s, send {}s, logout {}s",
        cfg.sessions.init_timeout_secs,
        cfg.sessions.send_timeout_secs,
        cfg.sessions.logout_timeout_secs
    );
    if cfg.server.mode == ServerMode::Single {
        println!("  default_identity: {}", cfg.sessions.default_identity);
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        "(not set)"
    } else {
        "********"
    }
}
