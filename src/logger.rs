// Aglogen Assistant — Structured logging via tracing

use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_ENV: &str = "AGLOGEN_LOG";

/// HTTP plumbing is only interesting when something breaks.
const QUIET_DEPENDENCIES: &str = "hyper=warn,hyper_util=warn,reqwest=warn,tower_http=warn";

/// Filter used when `AGLOGEN_LOG` is unset or unparsable.
pub fn default_filter(level: &str) -> String {
    format!("{},{}", level, QUIET_DEPENDENCIES)
}

/// Install the global subscriber. Output goes to stderr so commands that
/// print JSON on stdout stay machine-readable.
///
///   AGLOGEN_LOG=debug
///   AGLOGEN_LOG=aglogen_assistant::tool=trace,info
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_filter(default_level)));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .init();
}

#[cfg(test)]
pub fn init_test() {
    let _ = fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        let filter = default_filter("warn");
        assert!(filter.starts_with("warn,"));
        assert!(filter.contains("reqwest=warn"));
        assert!(EnvFilter::try_new(&filter).is_ok());
    }
}
