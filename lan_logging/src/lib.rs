//! Logging bootstrap shared by every crate in the workspace.
//!
//! Library code logs through the `log` facade under [`LOG_TARGET`]. Binaries call
//! [`setup_log`] (or [`setup_log_no_panic_hook`]) once; tests call [`setup_test_log`] so the
//! output is captured per test. `RUST_LOG` overrides the default filter, which only lets
//! engine warnings through.
pub use tracing::{self, debug, error, info, instrument, trace, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::SubscriberBuilder;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// The log target used by the engine crates
pub const LOG_TARGET: &str = "lan";

/// Sets up the logging for any crate. A panic anywhere terminates the process after being logged
pub fn setup_log() {
    std::panic::set_hook(Box::new(|info| {
        error!(target: LOG_TARGET, "Panic occurred: {}", info);
        std::process::exit(1);
    }));

    setup_log_no_panic_hook()
}

/// Same as [`setup_log`], but leaves the default panic hook alone. Use this where panics are
/// expected to be caught (e.g., user callbacks run through the task queue)
pub fn setup_log_no_panic_hook() {
    install(false)
}

/// Like [`setup_log_no_panic_hook`], with output routed through the test harness capture
pub fn setup_test_log() {
    install(true)
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{LOG_TARGET}=warn")))
}

fn install(test_writer: bool) {
    let builder = SubscriberBuilder::default()
        .with_line_number(true)
        .with_file(true)
        .with_span_events(FmtSpan::NONE)
        .with_env_filter(env_filter());

    // a second install in the same process is a no-op
    let _ = if test_writer {
        builder.with_test_writer().finish().try_init()
    } else {
        builder.finish().try_init()
    };
}
