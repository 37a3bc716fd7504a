//! Logging initialization and small diagnostics helpers.
//!
//! The library itself only emits `tracing` events; binaries and tests call
//! [`logging::init`] once to install a subscriber.

pub mod logging {
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::str::FromStr;
    use std::sync::OnceLock;

    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
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

        fn to_filter(self) -> LevelFilter {
            match self {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    impl FromStr for LogLevel {
        type Err = String;

        fn from_str(value: &str) -> Result<Self, Self::Err> {
            match value.to_ascii_lowercase().as_str() {
                "error" => Ok(LogLevel::Error),
                "warn" | "warning" => Ok(LogLevel::Warn),
                "info" => Ok(LogLevel::Info),
                "debug" => Ok(LogLevel::Debug),
                "trace" => Ok(LogLevel::Trace),
                other => Err(format!("unknown log level {other:?}")),
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        /// Append to this file instead of stderr.
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    static INIT: OnceLock<()> = OnceLock::new();
    static GUARD: OnceLock<Option<WorkerGuard>> = OnceLock::new();

    /// Installs the global subscriber once; later calls are no-ops so tests
    /// can all try.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if INIT.get().is_some() {
            return Ok(());
        }
        inner_init(config)?;
        INIT.set(()).ok();
        Ok(())
    }

    fn inner_init(config: &LogConfig) -> Result<(), InitError> {
        let env_filter = build_env_filter(config.level.to_filter());

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
            .with_env_filter(env_filter)
            .with_level(true)
            .with_target(config.level >= LogLevel::Debug)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;
        let _ = GUARD.set(Some(guard));
        Ok(())
    }

    const NOISY_DEP_TARGETS: &[&str] = &["tokio_tungstenite", "tungstenite", "rustls", "webrtc"];

    fn build_env_filter(level: LevelFilter) -> EnvFilter {
        if let Ok(filter) = std::env::var("TELEOP_LOG_FILTER") {
            return EnvFilter::new(filter);
        }
        let base = match level {
            LevelFilter::TRACE => "info,teleop_core=trace",
            LevelFilter::DEBUG => "info,teleop_core=debug",
            LevelFilter::INFO => "info",
            LevelFilter::WARN => "warn",
            LevelFilter::ERROR => "error",
            LevelFilter::OFF => "off",
        };
        let mut filter = base.to_owned();
        if level >= LevelFilter::DEBUG && std::env::var("TELEOP_TRACE_DEPS").is_err() {
            for target in NOISY_DEP_TARGETS {
                filter.push(',');
                filter.push_str(target);
                filter.push_str("=info");
            }
        }
        EnvFilter::new(filter)
    }

    /// Single-line hex rendering of a frame for trace logs. Payloads past
    /// the cap are cut short; the total length is always stated.
    pub fn frame_preview(payload: &[u8]) -> String {
        use std::fmt::Write as _;
        const CAP: usize = 24;
        let mut rendered = String::with_capacity(CAP * 3 + 16);
        for byte in payload.iter().take(CAP) {
            if !rendered.is_empty() {
                rendered.push(' ');
            }
            let _ = write!(rendered, "{byte:02x}");
        }
        if payload.len() > CAP {
            let _ = write!(rendered, " .. {} bytes total", payload.len());
        }
        rendered
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn log_level_parses_common_spellings() {
            assert_eq!("warn".parse::<LogLevel>().unwrap(), LogLevel::Warn);
            assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
            assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Trace);
            assert!("loud".parse::<LogLevel>().is_err());
        }

        #[test]
        fn frame_preview_renders_hex_and_truncates() {
            assert_eq!(frame_preview(b"ping"), "70 69 6e 67");
            assert_eq!(frame_preview(b""), "");
            let long = vec![0xAB_u8; 100];
            let preview = frame_preview(&long);
            assert!(preview.starts_with("ab ab"));
            assert!(preview.ends_with(".. 100 bytes total"));
        }

        #[test]
        fn init_is_idempotent() {
            let config = LogConfig::default();
            assert!(init(&config).is_ok());
            assert!(init(&config).is_ok());
        }
    }
}
