//! # relay
//!
//! Streams agent turns to WebSocket clients as renderable node messages, or replays a
//! recorded upstream event log through the same pipeline.

#![deny(unsafe_code)]

mod replay;

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use relay_core::source::EventSourceFactory;
use relay_engine::{EchoFactory, Verbosity};
use relay_server::{load_settings, RelaySettings};
use relay_telemetry::{init_telemetry, parse_level, LogFormat, TelemetryConfig};

/// Relay streaming-session server.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "Streaming-session relay server", version)]
struct Cli {
    /// Settings file (default: ~/.relay/settings.json).
    #[arg(long, global = true, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Log level; `RUST_LOG` takes precedence.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format (`pretty` or `json`).
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the WebSocket server with the built-in echo source (default).
    Serve(ServeArgs),
    /// Convert a JSONL upstream event log and print messages and transcript.
    Replay(ReplayArgs),
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Tool message verbosity (`full` or `minimal`).
    #[arg(long)]
    verbosity: Option<Verbosity>,

    /// Outbound queue capacity per connection.
    #[arg(long)]
    max_send_queue: Option<usize>,

    /// Delay between words streamed by the echo source.
    #[arg(long)]
    word_delay_ms: Option<u64>,
}

#[derive(Args, Debug)]
struct ReplayArgs {
    /// JSONL file of upstream events, one per line.
    file: PathBuf,

    /// Tool message verbosity (`full` or `minimal`).
    #[arg(long)]
    verbosity: Option<Verbosity>,

    /// Print only the rendered transcript.
    #[arg(long)]
    transcript_only: bool,
}

impl ServeArgs {
    fn apply(self, settings: &mut RelaySettings) {
        if let Some(host) = self.host {
            settings.server.host = host;
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(verbosity) = self.verbosity {
            settings.server.verbosity = verbosity;
        }
        if let Some(max_send_queue) = self.max_send_queue {
            settings.server.max_send_queue = max_send_queue.max(1);
        }
        if let Some(word_delay_ms) = self.word_delay_ms {
            settings.source.word_delay_ms = word_delay_ms;
        }
    }
}

fn telemetry_config(settings: &RelaySettings) -> Result<TelemetryConfig> {
    let log_level = parse_level(&settings.logging.level)
        .with_context(|| format!("invalid log level: {}", settings.logging.level))?;
    Ok(TelemetryConfig {
        log_level,
        format: settings.logging.format,
        ..TelemetryConfig::default()
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings =
        load_settings(cli.config.as_deref()).context("Failed to load settings")?;
    if let Some(level) = cli.log_level {
        settings.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        settings.logging.format = format;
    }
    let telemetry = init_telemetry(telemetry_config(&settings)?);

    match cli.command.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::Serve(args) => {
            args.apply(&mut settings);
            serve(settings, telemetry.metrics()).await
        }
        Command::Replay(args) => {
            let file = File::open(&args.file)
                .with_context(|| format!("Failed to open {}", args.file.display()))?;
            let verbosity = args.verbosity.unwrap_or(settings.server.verbosity);
            let stdout = std::io::stdout();
            let summary = replay::run(
                BufReader::new(file),
                &mut stdout.lock(),
                verbosity,
                args.transcript_only,
            )?;
            tracing::info!(
                events = summary.events,
                skipped = summary.skipped,
                turns = summary.turns,
                messages = summary.messages,
                violations = summary.violations,
                "replay finished"
            );
            Ok(())
        }
    }
}

async fn serve(
    settings: RelaySettings,
    metrics: Arc<relay_telemetry::MetricsRecorder>,
) -> Result<()> {
    let factory: Arc<dyn EventSourceFactory> =
        Arc::new(EchoFactory::new(settings.source.word_delay()));
    let handle = relay_server::start(settings.server, factory, metrics)
        .await
        .context("Failed to start server")?;

    tracing::info!(addr = %handle.addr(), "relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    handle.shutdown().await;
    Ok(())
}
