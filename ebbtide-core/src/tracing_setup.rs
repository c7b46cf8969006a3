//! Dual-sink tracing bootstrap: console at the chosen level, full trace
//! record on disk

use std::fs::{File, create_dir_all};
use std::path::Path;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Installs the global subscriber with two sinks: console output filtered
/// to `console_level` (or `RUST_LOG` when set), and an unconditional trace
/// file under `logs_dir` (default `./logs`).
///
/// The file sink rewrites `logs/ebbtide-last-run.log` on every start, so
/// the record of a run survives exactly until the next one.
///
/// # Errors
///
/// - `Box<dyn std::error::Error>` - If the logs directory or the trace
///   file cannot be created
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let dir = logs_dir.unwrap_or_else(|| Path::new("logs"));
    create_dir_all(dir)?;

    let trace_path = dir.join("ebbtide-last-run.log");
    let trace_file = File::create(&trace_path)?;

    // RUST_LOG wins over the CLI flag when both are present.
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_filter(console_filter);

    // The file sink stays at trace regardless of the console level.
    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(trace_file)
        .with_filter(EnvFilter::new("trace"));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    tracing::info!(
        "console logging at {console_level}, trace file at {}",
        trace_path.display()
    );

    Ok(())
}

/// Log level choices exposed on the CLI.
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum CliLogLevel {
    /// Errors only
    Error,
    /// Errors and warnings
    Warn,
    /// Routine progress and above
    Info,
    /// Diagnostic detail and above
    Debug,
    /// Everything, including per-frame detail
    Trace,
}

impl CliLogLevel {
    /// The `tracing::Level` this choice maps to.
    ///
    /// ```
    /// use ebbtide_core::tracing_setup::CliLogLevel;
    ///
    /// assert_eq!(CliLogLevel::Info.as_tracing_level(), tracing::Level::INFO);
    /// ```
    pub fn as_tracing_level(self) -> Level {
        match self {
            Self::Error => Level::ERROR,
            Self::Warn => Level::WARN,
            Self::Info => Level::INFO,
            Self::Debug => Level::DEBUG,
            Self::Trace => Level::TRACE,
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        })
    }
}
