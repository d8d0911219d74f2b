pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds the default terminal logger used when no logging configuration is supplied.
pub fn terminal() -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_str(DEFAULT_CONFIG).expect("Broken embedded logging configuration");

    config
        .build_logger()
        .expect("Error building terminal logger")
}

/// Builds a logger from a TOML logging configuration file.
pub fn from_file(path: &str) -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_file(path).expect("Error loading logging configuration file");

    config.build_logger().expect("Error building logger")
}

/// A logger that swallows everything. Used as the default for engine instances
/// constructed without a parent logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discard_logger() {
        let log = discard();
        debug!(log, "no-op"; "key" => 1);
    }

    #[test]
    fn test_terminal_logger_builds() {
        let _ = terminal();
    }
}
