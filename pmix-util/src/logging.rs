use slog::Logger;
use sloggers::{Config, LoggerConfig};

/// Builds the daemon's root logger.
///
/// `PMIX_DEBUG` maps onto severity: `0` (or unset) is `info`, `1` is `debug`, `2` or higher is
/// `trace`. The level is read once at startup and baked into the returned logger; it is never
/// polled again.
pub fn init(debug_level: u8) -> Logger {
    let level = match debug_level {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let toml = format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    );

    let config: LoggerConfig = serdeconv::from_toml_str(&toml).expect("invalid built-in logger config");
    config.build_logger().expect("failed to build logger")
}
