//! Subscriber setup for binaries and tests embedding the engine.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

fn base_level(value: Option<&str>) -> &'static str {
    match value {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    let level = base_level(std::env::var("REQLET_LOG").ok().as_deref());
    EnvFilter::new(format!("reqlet={level}"))
}

/// Install a stderr subscriber.
///
/// `RUST_LOG` takes precedence. Otherwise `REQLET_LOG` picks the level for
/// every `reqlet::*` target, defaulting to `info`. `REQLET_LOG_FORMAT=json`
/// switches to JSON lines. Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let use_json = std::env::var("REQLET_LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
