use std::error::Error;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

/// Environment variable that overrides the configured filter.
pub const LOG_ENV: &str = "PARLANCE_LOG";

/// Install the global `tracing` subscriber.
///
/// The filter comes from `PARLANCE_LOG` when set, otherwise from
/// `default_filter`. Output goes to stderr, or is appended to `log_file`.
pub fn init_tracing(default_filter: &str, log_file: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact();

    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .map_err(|e| -> Box<dyn Error> { e })?;
        }
        None => builder
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| -> Box<dyn Error> { e })?,
    }
    Ok(())
}
