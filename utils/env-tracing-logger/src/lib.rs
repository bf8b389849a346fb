//! Set up `tracing` output for camcap programs.
//!
//! Filtering comes from `RUST_LOG` when it is set, otherwise from the default
//! directives passed by the program. Events go to the console, to a file, or
//! both.

use time::{UtcOffset, format_description::well_known::Iso8601};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, time::OffsetTime},
    layer::SubscriberExt,
};

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Where log output goes.
#[derive(Debug, Clone)]
pub struct LogOptions<'a> {
    /// Also write events, without color codes, to this file.
    pub file: Option<&'a std::path::Path>,
    pub console: bool,
    /// Filter used when `RUST_LOG` is not set, e.g. `"camcap=info,warn"`.
    pub default_directives: &'a str,
}

impl Default for LogOptions<'_> {
    fn default() -> Self {
        Self {
            file: None,
            console: true,
            default_directives: "info",
        }
    }
}

/// Keeps logging alive. Currently a marker; hold it for the life of `main`.
#[must_use]
pub struct LogGuard {
    _private: (),
}

fn env_filter(default_directives: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives))
}

/// Install the global subscriber.
pub fn initiate_logging(options: &LogOptions<'_>) -> Result<LogGuard, Error> {
    // Create a fixed offset time formatter based on the timezone at the
    // time this line of code runs.
    let timer = OffsetTime::new(
        UtcOffset::from_whole_seconds(chrono::Local::now().offset().local_minus_utc())?,
        Iso8601::DEFAULT,
    );

    let file_layer = match options.file {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            Some(
                fmt::layer()
                    .with_timer(timer.clone())
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false)
                    .with_file(true)
                    .with_line_number(true),
            )
        }
        None => None,
    };

    let console_layer = options.console.then(|| {
        fmt::layer()
            .with_timer(timer)
            .with_ansi(!cfg!(windows))
            .with_target(false)
    });

    let collector = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(env_filter(options.default_directives));
    tracing::subscriber::set_global_default(collector)?;

    let source = match std::env::var("RUST_LOG") {
        Ok(var) => format!("RUST_LOG=\"{var}\""),
        Err(_) => format!("default filter \"{}\"", options.default_directives),
    };
    if let Some(path) = options.file {
        tracing::debug!("Logging to file \"{}\" with {source}.", path.display());
    }
    if options.console {
        tracing::debug!("Logging to console with {source}.");
    }

    Ok(LogGuard { _private: () })
}
