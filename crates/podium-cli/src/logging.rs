//! Tracing subscriber setup from `LoggingConfig`.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use podium_core::config::LoggingConfig;

/// Filter directives: base level first, then per-crate overrides.
pub fn filter_directives(logging: Option<&LoggingConfig>, verbose: bool) -> String {
    let level = if verbose {
        "debug"
    } else {
        logging
            .and_then(|l| l.level.as_deref())
            .unwrap_or("info")
    };

    let mut directives = vec![level.to_string()];
    if let Some(logging) = logging {
        directives.extend(logging.filters.iter().cloned());
    }
    directives.join(",")
}

/// Install the global subscriber. `RUST_LOG` wins unless `--verbose` is set.
pub fn init_logging(logging: Option<&LoggingConfig>, verbose: bool) {
    let directives = filter_directives(logging, verbose);
    let filter = if verbose {
        EnvFilter::new(&directives)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives))
    };

    let writer = match logging.map(|l| l.output.as_str()) {
        Some("stdout") => BoxMakeWriter::new(std::io::stdout),
        _ => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);

    match logging.map(|l| l.format.as_str()) {
        Some("json") => builder.json().init(),
        _ => builder.init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logging(level: Option<&str>, filters: &[&str]) -> LoggingConfig {
        LoggingConfig {
            format: "plain".into(),
            level: level.map(String::from),
            filters: filters.iter().map(|f| f.to_string()).collect(),
            output: "stderr".into(),
        }
    }

    #[test]
    fn test_default_is_info() {
        assert_eq!(filter_directives(None, false), "info");
    }

    #[test]
    fn test_verbose_forces_debug() {
        let config = logging(Some("warn"), &[]);
        assert_eq!(filter_directives(Some(&config), true), "debug");
    }

    #[test]
    fn test_filters_follow_level() {
        let config = logging(Some("warn"), &["podium_backplane=trace", "axum=error"]);
        assert_eq!(
            filter_directives(Some(&config), false),
            "warn,podium_backplane=trace,axum=error"
        );
    }
}
