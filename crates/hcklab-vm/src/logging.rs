//! Tracing subscriber setup shared by the hcklab binaries.
//!
//! Output goes to stderr, filtered by `RUST_LOG` (default `info`). With
//! `HCKLAB_LOG_JSON=1` each event is one JSON object per line, which is what
//! CI log collectors want.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::parse_bool_env;

pub const ENV_LOG_JSON: &str = "HCKLAB_LOG_JSON";

/// Installs the global subscriber. Later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(ENV_LOG_JSON)
        .ok()
        .and_then(|raw| parse_bool_env(ENV_LOG_JSON, &raw).ok())
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .try_init()
            .ok();
    }
}
