use log::{log_enabled, Level};
use std::io::Write;

pub fn init(verbosity: u8) {
    let mut builder = env_logger::Builder::from_default_env();

    builder
        .format_indent(Some(8))
        .filter(None, verbosity_level(verbosity).to_level_filter())
        .format(|f, record| {
            let style = f.default_level_style(record.level()).bold();
            write!(f, "{style}{:>7}{style:#} ", prettyprint_level(record.level()))?;

            if log_enabled!(Level::Debug) {
                write!(f, "[{}] ", record.target())?;
            }

            writeln!(f, "{}", record.args())
        })
        .init();
}

/// Maps the number of `-v` flags to a log level. Warnings from the EDT
/// build are always shown.
fn verbosity_level(num: u8) -> Level {
    match num {
        0 => Level::Info,
        1 => Level::Debug,
        2.. => Level::Trace,
    }
}

fn prettyprint_level(lvl: Level) -> &'static str {
    match lvl {
        Level::Error => "error",
        Level::Warn => "warning",
        Level::Info => "info",
        Level::Debug => "debug",
        Level::Trace => "trace",
    }
}
