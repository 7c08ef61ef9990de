use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "PVGPU_LOG";

/// Filter used when `PVGPU_LOG` is unset: the bus stack at `info`,
/// dependencies at `warn`.
pub const DEFAULT_FILTER: &str = "warn,pvgpu=info,pvgpu_core=info,pvgpu_transport=info,pvgpu_protocol=info";

/// Quieter default for test runs, where only bus failures are of interest.
pub const TEST_FILTER: &str = "warn,pvgpu_core=warn,pvgpu_transport=warn";

/// Build the filter from `PVGPU_LOG`, falling back to `default` when the
/// variable is unset or does not parse.
pub fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default))
}

/// Initialize structured logging with environment filter.
/// Set PVGPU_LOG to a level or to per-target directives such as
/// `pvgpu_transport=trace,pvgpu_core=debug` for verbosity control.
pub fn init_logging() {
    fmt()
        .with_env_filter(env_filter(DEFAULT_FILTER))
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Like [`init_logging`], but safe to call repeatedly. Returns false when a
/// subscriber was already installed.
pub fn try_init_logging() -> bool {
    fmt()
        .with_env_filter(env_filter(TEST_FILTER))
        .with_target(true)
        .with_test_writer()
        .try_init()
        .is_ok()
}
