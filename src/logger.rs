/* Logger initialization */
use std::{panic, thread};

use tracing::{error, level_filters::LevelFilter};
use tracing_appender::non_blocking::WorkerGuard;

use crate::CargoEnv;

pub struct LoggerGuards {
    pub _tracing_guard: WorkerGuard,
    // option because sentry is opt-in
    pub _sentry_guard: Option<sentry::ClientInitGuard>,
}

pub struct Logger {}

impl Logger {
    pub fn init(cargo_env: CargoEnv, log_dir: &str, sentry_dsn: Option<String>) -> LoggerGuards {
        // dev is INFO on stdout, production is DEBUG into a daily file because upstream portals
        // misbehave in ways you only see at debug
        let (max_level, (non_blocking, guard)) = match cargo_env {
            CargoEnv::Development => (
                LevelFilter::INFO,
                tracing_appender::non_blocking(std::io::stdout()),
            ),
            CargoEnv::Production => (
                LevelFilter::DEBUG,
                tracing_appender::non_blocking(tracing_appender::rolling::daily(
                    log_dir,
                    "relay.log",
                )),
            ),
        };

        let sentry_guard = sentry_dsn.map(|dsn| {
            sentry::init((
                dsn,
                sentry::ClientOptions {
                    release: sentry::release_name!(),
                    environment: Some(Self::environment_name(cargo_env).into()),
                    attach_stacktrace: true,
                    ..Default::default()
                },
            ))
        });

        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let registry = tracing_subscriber::registry()
            .with(max_level)
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking));

        // try_init so a second init (tests) doesn't blow up
        let init_result = if sentry_guard.is_some() {
            registry.with(sentry_tracing::layer()).try_init()
        } else {
            registry.try_init()
        };
        if let Err(e) = init_result {
            eprintln!("tracing subscriber already set: {}", e);
        }

        panic::set_hook(Box::new(|info| {
            let thread = thread::current();
            let thread = thread.name().unwrap_or("unknown");

            let msg = info
                .payload()
                .downcast_ref::<&'static str>()
                .copied()
                .or_else(|| info.payload().downcast_ref::<String>().map(|s| s.as_str()))
                .unwrap_or("Box<Any>");

            // panics prefixed with "notrace - " skip the backtrace, they're expected enough
            let (msg, trace) = match msg.strip_prefix("notrace - ") {
                Some(stripped) => (stripped, None),
                None => (msg, Some(backtrace::Backtrace::new())),
            };

            let location = info
                .location()
                .map(|l| format!("{}:{}", l.file(), l.line()))
                .unwrap_or_else(|| "unknown location".to_string());

            match trace {
                Some(trace) => error!(
                    target: "panic", "thread '{}' panicked at '{}': {}\n{:?}",
                    thread, msg, location, trace
                ),
                None => error!(
                    target: "panic", "thread '{}' panicked at '{}': {}",
                    thread, msg, location
                ),
            }
        }));

        LoggerGuards {
            _tracing_guard: guard,
            _sentry_guard: sentry_guard,
        }
    }

    pub fn environment_name(cargo_env: CargoEnv) -> &'static str {
        match cargo_env {
            CargoEnv::Development => "development",
            CargoEnv::Production => "production",
        }
    }
}
