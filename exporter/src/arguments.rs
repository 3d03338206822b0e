//! Command line arguments of the exporter binary.

use model::CronPrecision;
use shared::tracing::LogFormat;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(setting = structopt::clap::AppSettings::DisableVersion)]
pub struct Arguments {
    /// Print the version string and exit.
    #[structopt(long)]
    pub version: bool,

    /// Validate the config file and exit with a status reflecting validity.
    #[structopt(long)]
    pub check_config: bool,

    /// Path to the yaml configuration.
    #[structopt(long, env = "CONFIG_PATH", default_value = "config.yaml")]
    pub config_path: PathBuf,

    /// HTTP bind address for pull mode. Overridden by the pull export port
    /// from the config when present.
    #[structopt(long, env = "LISTEN_ADDRESS")]
    pub listen_address: Option<SocketAddr>,

    /// Disables the exporter's own metrics.
    #[structopt(long)]
    pub disable_self_monitor: bool,

    /// When set, output samples carry no explicit timestamp.
    #[structopt(long)]
    pub disable_timestamp: bool,

    #[structopt(long, env = "LOG_FILTER", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[structopt(long, default_value = "text", parse(try_from_str))]
    pub log_format: LogFormat,

    /// Log file location; stdout when not set.
    #[structopt(long)]
    pub log_path: Option<PathBuf>,

    /// Key file for config password decryption. Accepted for deployment
    /// compatibility; encrypted passwords are handled outside the core.
    #[structopt(long)]
    pub key_path: Option<PathBuf>,

    /// Cron precision: second or minute.
    #[structopt(long, default_value = "second", parse(try_from_str))]
    pub croniter_precision: CronPrecision,
}

impl Arguments {
    /// Re-applies options from the config file's `flags:` map. Unknown
    /// names are logged and skipped.
    pub fn apply_config_flags(&mut self, flags: &HashMap<String, String>) {
        for (name, value) in flags {
            let applied = match name.as_str() {
                "listen-address" => match value.parse() {
                    Ok(address) => {
                        self.listen_address = Some(address);
                        true
                    }
                    Err(_) => false,
                },
                "disable-self-monitor" => {
                    self.disable_self_monitor = value == "true";
                    true
                }
                "disable-timestamp" => {
                    self.disable_timestamp = value == "true";
                    true
                }
                "log-level" => {
                    self.log_level = value.clone();
                    true
                }
                "croniter-precision" => match value.parse() {
                    Ok(precision) => {
                        self.croniter_precision = precision;
                        true
                    }
                    Err(_) => false,
                },
                _ => false,
            };
            if applied {
                tracing::info!(flag = %name, %value, "flag applied from config");
            } else {
                tracing::error!(
                    error_code = shared::codes::LME_8102,
                    flag = %name,
                    %value,
                    "failed to apply flag from config",
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;

    fn arguments() -> Arguments {
        Arguments::from_iter(vec!["log-exporter"])
    }

    #[test]
    fn defaults_are_sane() {
        let args = arguments();
        assert!(!args.version);
        assert_eq!(args.config_path, PathBuf::from("config.yaml"));
        assert_eq!(args.croniter_precision, CronPrecision::Second);
    }

    #[test]
    fn config_flags_override_arguments() {
        let mut args = arguments();
        args.apply_config_flags(&hashmap! {
            "disable-timestamp".to_string() => "true".to_string(),
            "croniter-precision".to_string() => "minute".to_string(),
        });
        assert!(args.disable_timestamp);
        assert_eq!(args.croniter_precision, CronPrecision::Minute);
    }

    #[test]
    fn unknown_flags_are_skipped() {
        let mut args = arguments();
        args.apply_config_flags(&hashmap! {"no-such-flag".to_string() => "1".to_string()});
        assert!(!args.disable_timestamp);
    }
}
