use std::fs::OpenOptions;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_LOG_FILTER: &str = "info";
const ENV_VAR_LOG_FILE: &str = "SUMMITVPN_LOG_FILE";

fn make_file_fmt_layer<S>(log_path: &str) -> std::io::Result<fmt::Layer<S, fmt::format::DefaultFields, fmt::format::Format, BoxMakeWriter>>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let file = OpenOptions::new().create(true).append(true).open(log_path)?;
    Ok(fmt::layer().with_writer(BoxMakeWriter::new(file)).with_ansi(false))
}

/// Install the global collector. Logs go to the file named by
/// `SUMMITVPN_LOG_FILE` when set, stdout otherwise; `RUST_LOG` overrides the
/// default filter.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    match std::env::var(ENV_VAR_LOG_FILE) {
        Ok(log_path) => match make_file_fmt_layer(&log_path) {
            Ok(layer) => {
                tracing_subscriber::registry().with(layer).with(filter).init();
            }
            Err(e) => {
                eprintln!("failed to open log file {log_path}: {e} - falling back to stdout");
                tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
            }
        },
        Err(_) => {
            tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
        }
    }
}
