//! Tracing subscriber setup shared by the binaries.

use std::fs::File;
use std::path::Path;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
    /// Single-line json for cloud log collectors.
    Cloud,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "cloud" => Ok(Self::Cloud),
            other => anyhow::bail!("unsupported log format {}", other),
        }
    }
}

/// Initializes the global subscriber. Must be called once at startup before
/// the first event is emitted.
pub fn initialize(filter: &str, format: LogFormat, path: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(filter)?;
    match (format, path) {
        (LogFormat::Text, None) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        (LogFormat::Text, Some(path)) => {
            let file = File::create(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(file_writer(file))
                .init();
        }
        (LogFormat::Json | LogFormat::Cloud, None) => {
            tracing_subscriber::fmt().with_env_filter(filter).json().init();
        }
        (LogFormat::Json | LogFormat::Cloud, Some(path)) => {
            let file = File::create(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_writer(file_writer(file))
                .init();
        }
    }
    Ok(())
}

fn file_writer(file: File) -> impl Fn() -> File {
    move || file.try_clone().expect("failed to clone log file handle")
}
