//! Logger setup for binaries and demos. The library itself only uses the
//! `log` facade.

use env_logger::{Builder, Env};
use log::LevelFilter;

/// Initializes the global logger.
///
/// `RUST_LOG` wins when set. Otherwise `verbose` selects debug output and the
/// default is info.
pub fn init(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let env = Env::default().default_filter_or(level.to_string());
    // `try_init` fails only when a logger is already installed.
    let _ = Builder::from_env(env).try_init();
}
