use crate::config::Config;
use log::{LevelFilter, SetLoggerError};
use simplelog::{self, ConfigBuilder, ThreadLogMode};

/// Modules to filter out from logging when not in Trace mode.
/// Runtime internals are chatty at debug level and drown out connection lifecycle lines.
const FILTERED_MODULES: &[&str] = &["tokio", "mio", "dashmap", "async_trait"];

pub struct Logger {}

impl Logger {
    /// Initializes the global logger with configuration based on the provided Config.
    ///
    /// Panics if a global logger was already installed; the binary calls this exactly once.
    pub fn init_logger(config: &Config) {
        Self::try_init_logger(config).expect("Failed to start simplelog");
    }

    /// Fallible variant of [`Logger::init_logger`]. Returns an error if a logger is already set.
    pub fn try_init_logger(config: &Config) -> Result<(), SetLoggerError> {
        let log_level_filter = Self::convert_level_filter(config.log_level_filter);
        let log_config = Self::build_log_config(config.log_level_filter);

        simplelog::TermLogger::init(
            log_level_filter,
            log_config,
            simplelog::TerminalMode::Mixed,
            simplelog::ColorChoice::Auto,
        )
    }

    /// Converts log::LevelFilter to simplelog::LevelFilter.
    fn convert_level_filter(level: LevelFilter) -> simplelog::LevelFilter {
        match level {
            LevelFilter::Off => simplelog::LevelFilter::Off,
            LevelFilter::Error => simplelog::LevelFilter::Error,
            LevelFilter::Warn => simplelog::LevelFilter::Warn,
            LevelFilter::Info => simplelog::LevelFilter::Info,
            LevelFilter::Debug => simplelog::LevelFilter::Debug,
            LevelFilter::Trace => simplelog::LevelFilter::Trace,
        }
    }

    fn should_filter_dependencies(level: LevelFilter) -> bool {
        level != LevelFilter::Trace
    }

    /// Builds a simplelog Config. Thread names are shown from Debug upward so
    /// interleaved per-connection task output can be told apart.
    fn build_log_config(level: LevelFilter) -> simplelog::Config {
        let mut builder = ConfigBuilder::new();
        builder.set_time_format_rfc3339();
        builder.set_thread_level(Self::convert_level_filter(LevelFilter::Debug));
        builder.set_thread_mode(ThreadLogMode::Both);

        if Self::should_filter_dependencies(level) {
            for module in FILTERED_MODULES {
                builder.add_filter_ignore_str(module);
            }
        }

        builder.build()
    }
}
