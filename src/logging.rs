//! Log output to stderr and, optionally, to a file.

use std::path::Path;

use tracing_subscriber::{filter::LevelFilter, prelude::*, registry, Layer};

/// Maps the number of `-v` flags to the most verbose level shown.
pub fn level_filter(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Installs a global subscriber logging to stderr and, when given, to a file.
///
/// `log` records emitted by this crate and by burn are forwarded to the subscriber. Nothing is
/// installed if a global subscriber already exists.
pub fn install_logger(verbosity: u8, log_file: Option<&Path>) {
    let level = level_filter(verbosity);

    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(level);

    let file = log_file.and_then(|path| {
        let file_name = path.file_name()?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let writer = tracing_appender::rolling::never(dir, file_name);

        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(level),
        )
    });

    if registry().with(stderr).with(file).try_init().is_ok() {
        update_panic_hook(log_file);
    }
}

fn update_panic_hook(log_file: Option<&Path>) {
    let hook = std::panic::take_hook();
    let log_file = log_file.map(Path::to_path_buf);

    std::panic::set_hook(Box::new(move |info| {
        log::error!("PANIC => {}", info);
        if let Some(path) = &log_file {
            eprintln!(
                "=== PANIC ===\n\
                 A fatal error happened, you can check the logs here => '{}'\n\
                 =============",
                path.display()
            );
        }
        hook(info);
    }));
}
