pub mod logging;

pub use logging::{env_filter, init_logging, try_init_logging, DEFAULT_FILTER, LOG_ENV, TEST_FILTER};
