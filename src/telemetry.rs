//! Logging initialization
//!
//! The subscriber is installed before configuration is resolved so that
//! config file loading is logged. The filter sits behind a reload handle: a
//! config file can still turn on `verbose` after the fact.
//!
//! Level precedence: `RUST_LOG`, then `--verbose` / `VIRTWORK_VERBOSE`, then
//! the config file's `verbose`, then `info`.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::config::Config;
use crate::{Error, Result};

/// Reloadable filter layer over the registry
pub type FilterLayer = reload::Layer<EnvFilter, Registry>;

fn level(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}

/// Handle for adjusting the log filter once configuration is known
pub struct LogFilter {
    handle: reload::Handle<EnvFilter, Registry>,
    from_env: bool,
    verbose: bool,
}

impl LogFilter {
    /// Build the filter layer.
    ///
    /// `from_env` is the `RUST_LOG` filter, if set; it is never overridden.
    pub fn new(from_env: Option<EnvFilter>, verbose: bool) -> (FilterLayer, Self) {
        let env_set = from_env.is_some();
        let filter = from_env.unwrap_or_else(|| EnvFilter::new(level(verbose)));
        let (layer, handle) = reload::Layer::new(filter);
        (
            layer,
            Self {
                handle,
                from_env: env_set,
                verbose,
            },
        )
    }

    /// Raise the level to debug if only the config file asked for it
    pub fn apply(&self, config: &Config) -> Result<()> {
        if self.from_env || self.verbose || !config.verbose {
            return Ok(());
        }
        self.handle
            .reload(EnvFilter::new(level(true)))
            .map_err(|e| Error::config(format!("failed to raise log level: {}", e)))
    }
}

/// Install the global subscriber: reloadable filter plus a `fmt` layer on stderr
pub fn init(verbose: bool) -> LogFilter {
    let (filter, handle) = LogFilter::new(EnvFilter::try_from_default_env().ok(), verbose);
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
    handle
}
