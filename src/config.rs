use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "emrsd=info";

/// Startup configuration, read once from the environment.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Workspace opened before the first request, if set.
    pub workspace: Option<PathBuf>,
    pub log_filter: Option<String>,
    pub log_json: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Config {
            workspace: non_empty("EMRSD_WORKSPACE").map(PathBuf::from),
            log_filter: non_empty("EMRSD_LOG").or_else(|| non_empty("RUST_LOG")),
            log_json: non_empty("EMRSD_LOG_JSON")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
        }
    }
}

/// Logs go to stderr; stdout carries the IPC responses.
pub fn init_tracing(cfg: &Config) -> anyhow::Result<()> {
    let filter = match cfg.log_filter.as_deref() {
        Some(f) => EnvFilter::try_new(f)?,
        None => EnvFilter::new(DEFAULT_FILTER),
    };
    let registry = tracing_subscriber::registry().with(filter);

    if cfg.log_json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr).with_ansi(false))
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .try_init()?;
    }
    Ok(())
}
