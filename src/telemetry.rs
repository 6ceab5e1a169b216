//! Logging initialisation.
//!
//! Stderr always; a file layer when the config sets `log_file`. The filter
//! honours `SNAPSYNC_LOG` (tracing `EnvFilter` syntax) and falls back to
//! the verbosity flag.

use std::path::Path;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

pub const LOG_ENV: &str = "SNAPSYNC_LOG";

pub struct TelemetryGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn init(verbosity: u8, log_file: Option<&Path>) -> TelemetryGuard {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(verbosity).into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();

    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(false);

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = vec![Box::new(stderr_layer)];
    let mut file_guard = None;
    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let name = path.file_name().map(|n| n.to_string_lossy().to_string());
        match (std::fs::create_dir_all(dir), name) {
            (Ok(()), Some(name)) => {
                let appender = tracing_appender::rolling::never(dir, name);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                file_guard = Some(guard);
                layers.push(Box::new(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(true),
                ));
            }
            _ => eprintln!("snapsync: cannot open log file {}", path.display()),
        }
    }

    Registry::default().with(layers).with(filter).init();

    TelemetryGuard {
        _file_guard: file_guard,
    }
}

fn level_from_verbosity(verbosity: u8) -> tracing::metadata::LevelFilter {
    match verbosity {
        0 => tracing::metadata::LevelFilter::WARN,
        1 => tracing::metadata::LevelFilter::INFO,
        2 => tracing::metadata::LevelFilter::DEBUG,
        _ => tracing::metadata::LevelFilter::TRACE,
    }
}
