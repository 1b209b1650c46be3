use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

use crate::config::{LoggingConfig, DEFAULT_LOG_FILTER, DEFAULT_LOG_RETENTION_FILES};

pub const DEFAULT_LOG_FILE_PREFIX: &str = "img2tensor";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub log_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            log_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

impl LoggingInitOptions {
    /// Options seeded from the `[logging]` config section.
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self {
            log_dir: config.dir.clone(),
            default_log_filter: config.filter.clone(),
            retention_files: config.retention_files,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub filter: String,
    pub file_sink: FileSinkPlan,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready(ReadyFileSinkPlan),
    Fallback(FallbackFileSinkPlan),
}

#[derive(Debug)]
pub struct ReadyFileSinkPlan {
    pub log_dir: PathBuf,
    pub retention_files: usize,
    pub appender: RollingFileAppender,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackFileSinkPlan {
    pub attempted_log_dir: Option<PathBuf>,
    pub retention_files: usize,
    pub reason: String,
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn retention_files(&self) -> usize {
        match self {
            Self::Ready(plan) => plan.retention_files,
            Self::Fallback(plan) => plan.retention_files,
        }
    }

    pub fn log_dir(&self) -> Option<&Path> {
        match self {
            Self::Ready(plan) => Some(plan.log_dir.as_path()),
            Self::Fallback(plan) => plan.attempted_log_dir.as_deref(),
        }
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            Self::Ready(_) => None,
            Self::Fallback(plan) => Some(plan.reason.as_str()),
        }
    }
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        filter: select_log_filter(options),
        file_sink: build_file_sink_plan(options),
    }
}

/// `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`, then the configured default.
pub fn select_log_filter(options: &LoggingInitOptions) -> String {
    if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref().filter(|f| !f.trim().is_empty()) {
        filter.to_string()
    } else {
        options.default_log_filter.clone()
    }
}

pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let retention_files = normalize_retention_files(options.retention_files);

    let Some(log_dir) = options.log_dir.clone() else {
        return FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: None,
            retention_files,
            reason: "file sink disabled: log dir is not configured".to_string(),
        });
    };

    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: Some(log_dir),
            retention_files,
            reason: format!("failed to create log directory: {error}"),
        });
    }

    let appender_builder = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files);

    match appender_builder.build(&log_dir) {
        Ok(appender) => FileSinkPlan::Ready(ReadyFileSinkPlan {
            log_dir,
            retention_files,
            appender,
        }),
        Err(error) => FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: Some(log_dir),
            retention_files,
            reason: format!("failed to initialize rolling file sink: {error}"),
        }),
    }
}

fn normalize_retention_files(retention_files: usize) -> usize {
    if retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        retention_files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_log_filter_overrides_everything() {
        let options = LoggingInitOptions {
            verbose: 2,
            cli_log_filter: Some("img2tensor_core=trace".to_string()),
            rust_log_env: Some("error".to_string()),
            ..Default::default()
        };

        assert_eq!(select_log_filter(&options), "img2tensor_core=trace");
    }

    #[test]
    fn verbose_levels_map_to_debug_and_trace() {
        let one = LoggingInitOptions {
            verbose: 1,
            rust_log_env: Some("warn".to_string()),
            ..Default::default()
        };
        let two = LoggingInitOptions {
            verbose: 2,
            ..one.clone()
        };

        assert_eq!(select_log_filter(&one), "debug");
        assert_eq!(select_log_filter(&two), "trace");
    }

    #[test]
    fn rust_log_env_used_when_no_cli_or_verbose() {
        let options = LoggingInitOptions {
            rust_log_env: Some("warn,img2tensor_core=debug".to_string()),
            ..Default::default()
        };
        assert_eq!(select_log_filter(&options), "warn,img2tensor_core=debug");

        let blank = LoggingInitOptions {
            rust_log_env: Some("  ".to_string()),
            default_log_filter: "warn".to_string(),
            ..Default::default()
        };
        assert_eq!(select_log_filter(&blank), "warn");
    }

    #[test]
    fn from_config_seeds_default_filter_and_dir() {
        let config = LoggingConfig {
            filter: "error".to_string(),
            retention_files: 3,
            dir: Some(PathBuf::from("/var/log/img2tensor")),
        };
        let options = LoggingInitOptions::from_config(&config);

        assert_eq!(select_log_filter(&options), "error");
        assert_eq!(options.retention_files, 3);
        assert_eq!(options.log_dir, config.dir);
    }

    #[test]
    fn file_sink_falls_back_without_log_dir() {
        let plan = build_file_sink_plan(&LoggingInitOptions {
            retention_files: 0,
            ..Default::default()
        });

        assert!(!plan.is_ready());
        assert!(plan.log_dir().is_none());
        assert_eq!(plan.retention_files(), DEFAULT_LOG_RETENTION_FILES);
        assert!(plan
            .fallback_reason()
            .is_some_and(|reason| reason.contains("not configured")));
    }

    #[test]
    fn file_sink_falls_back_when_dir_is_a_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let blocker = temp.path().join("blocker");
        fs::write(&blocker, "x").expect("blocker file");

        let plan = build_file_sink_plan(&LoggingInitOptions {
            log_dir: Some(blocker.join("logs")),
            ..Default::default()
        });

        assert!(!plan.is_ready());
        assert_eq!(plan.log_dir(), Some(blocker.join("logs").as_path()));
        assert!(plan
            .fallback_reason()
            .is_some_and(|reason| reason.contains("failed to create log directory")));
    }

    #[test]
    fn file_sink_ready_creates_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log_dir = temp.path().join("logs");

        let plan = compose_logging_init_plan(&LoggingInitOptions {
            log_dir: Some(log_dir.clone()),
            retention_files: 2,
            ..Default::default()
        });

        assert_eq!(plan.filter, "info");
        assert!(plan.file_sink.is_ready());
        assert_eq!(plan.file_sink.retention_files(), 2);
        assert!(log_dir.is_dir());
    }
}
