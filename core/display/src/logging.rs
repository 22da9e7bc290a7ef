//! File plus stderr logging for display processes.
//!
//! Each display writes a daily rolling file under `~/.baylock/logs/` so that
//! kiosk screens without a visible terminal still leave a trail. The returned
//! guard must live until exit or buffered lines are lost.

use std::env;

use baylock_core::config;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "display.log";

fn filter() -> EnvFilter {
    let debug_enabled = env::var("BAYLOCK_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

pub fn init() -> Option<WorkerGuard> {
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let file = config::logs_dir().ok().and_then(|dir| {
        fs_err::create_dir_all(&dir).ok()?;
        Some(tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX))
    });

    match file {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer().with_writer(writer).with_ansi(false);
            let result = tracing_subscriber::registry()
                .with(filter())
                .with(stderr_layer)
                .with(file_layer)
                .try_init();
            result.ok().map(|_| guard)
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(filter())
                .with(stderr_layer)
                .try_init();
            None
        }
    }
}
