pub mod logging;

pub use logging::{init_tracing, log_file_path, LogGuard, LogLevel};
