pub mod logging {
    //! Log setup for the daemon and CLI.
    //!
    //! The chosen level applies to tether's own subsystems. Dependencies stay
    //! at `warn`. `TETHER_LOG_FILTER` replaces the whole filter.

    use std::fmt::Write as _;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;

    use clap::ValueEnum;
    use serde::{Deserialize, Serialize};
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    pub const FILTER_ENV: &str = "TETHER_LOG_FILTER";

    /// Log targets, one per subsystem. `tether` covers the CLI itself.
    pub const SUBSYSTEMS: &[&str] = &[
        "tether",
        "tether::server",
        "tether::router",
        "tether::job",
        "tether::conn",
        "tether::transport",
        "tether::shell",
        "tether::ssh",
    ];

    #[derive(
        Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
    )]
    #[serde(rename_all = "lowercase")]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn as_str(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            }
        }

        pub fn to_filter(self) -> LevelFilter {
            match self {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        /// Appends to this file instead of writing to stderr.
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("invalid {FILTER_ENV}: {0}")]
        Filter(String),
        #[error("a global logger is already installed: {0}")]
        Install(String),
    }

    // keeps the non-blocking writer flushing until exit
    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }
        let filter = match std::env::var(FILTER_ENV) {
            Ok(directives) => {
                EnvFilter::try_new(&directives).map_err(|err| InitError::Filter(err.to_string()))?
            }
            Err(_) => EnvFilter::new(default_filter(config.level)),
        };

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(config.level == LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Install(err.to_string()))?;
        let _ = GUARD.set(guard);
        Ok(())
    }

    /// `warn` for everything, then `level` for each tether subsystem.
    pub fn default_filter(level: LogLevel) -> String {
        let mut filter = String::from("warn");
        for target in SUBSYSTEMS {
            let _ = write!(filter, ",{target}={}", level.as_str());
        }
        filter
    }

    /// Renders a frame for trace logs: offset, hex columns, printable ascii.
    pub fn hexdump(bytes: &[u8]) -> String {
        const WIDTH: usize = 16;
        let mut out = String::new();
        for (i, chunk) in bytes.chunks(WIDTH).enumerate() {
            let _ = write!(out, "{:08x}  ", i * WIDTH);
            for (j, byte) in chunk.iter().enumerate() {
                if j == WIDTH / 2 {
                    out.push(' ');
                }
                let _ = write!(out, "{byte:02x} ");
            }
            for _ in chunk.len()..WIDTH {
                out.push_str("   ");
            }
            out.push(' ');
            out.extend(chunk.iter().map(|&byte| {
                if (0x20..=0x7e).contains(&byte) {
                    byte as char
                } else {
                    '.'
                }
            }));
            out.push('\n');
        }
        out
    }

}
