//! Tracing setup shared by the `mlgate` and `mlgate-registryd` binaries.
//!
//! `RUST_LOG` always wins. Without it the filter is built from the
//! verbosity flag, with the storage engine and HTTP stack held at `warn`
//! so pipeline events stay readable.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const QUIET_DEPENDENCIES: &[&str] = &["surrealdb", "surrealkv", "hyper", "reqwest", "h2"];

/// Map repeated `-v` flags to a default level.
pub fn level_for_verbosity(verbose: u8) -> Level {
    match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn default_directives(level: Level) -> String {
    let mut directives = level.as_str().to_ascii_lowercase();
    for dep in QUIET_DEPENDENCIES {
        directives.push_str(&format!(",{dep}=warn"));
    }
    directives
}

/// Install the global subscriber; newline-delimited JSON when `json` is set.
///
/// Only the first call in a process takes effect.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        registry.with(fmt::layer().with_target(false)).try_init().ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_levels() {
        assert_eq!(level_for_verbosity(0), Level::INFO);
        assert_eq!(level_for_verbosity(1), Level::DEBUG);
        assert_eq!(level_for_verbosity(7), Level::TRACE);
    }

    #[test]
    fn dependencies_are_quieted() {
        let d = default_directives(Level::DEBUG);
        assert!(d.starts_with("debug"));
        assert!(d.contains("surrealdb=warn"));
    }
}
