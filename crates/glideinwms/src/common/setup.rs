use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use env_logger::{DEFAULT_FILTER_ENV, Target, WriteStyle};
use log::LevelFilter;

/// Configures the global logger. `RUST_LOG` refines the level chosen by `debug`.
/// With `log_file`, records are appended to that file without colors.
pub fn setup_logging(debug: bool, log_file: Option<&Path>) -> std::io::Result<()> {
    let mut builder = env_logger::Builder::default();
    builder.filter_level(if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    let has_debug = std::env::var(DEFAULT_FILTER_ENV)
        .map(|v| v.contains("debug") || v.contains("trace"))
        .unwrap_or(false);

    if debug || has_debug {
        builder.format_timestamp_millis();
    } else {
        // <time> <level> <message>
        builder.format(|buf, record| {
            let level_style = buf.default_level_style(record.level()).bold();
            writeln!(
                buf,
                "{} {level_style}{}{level_style:#} {}",
                buf.timestamp_seconds(),
                record.level(),
                record.args()
            )
        });
    }

    if let Some(path) = log_file {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder
            .target(Target::Pipe(Box::new(file)))
            .write_style(WriteStyle::Never);
    }

    builder.parse_default_env();
    builder.init();
    Ok(())
}
