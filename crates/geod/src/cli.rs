//! Command-line interface of the geod daemon.

use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;

/// Options that override the configuration file.
#[derive(Debug, Clone)]
pub struct CliArgs {
    pub config_path: PathBuf,
    pub plugin_dir: Option<PathBuf>,
    /// HTTP listener address.
    pub bind_address: Option<String>,
    pub log_level: Option<String>,
    pub json_logs: bool,
}

fn command() -> Command {
    Command::new("geod")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Multi-protocol daemon hosting hot-pluggable modules")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("geod.toml"),
        )
        .arg(
            Arg::new("plugins")
                .short('p')
                .long("plugins")
                .value_name("DIR")
                .help("Module directory"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("HTTP bind address (e.g., 127.0.0.1:8080)"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(ArgAction::SetTrue),
        )
}

impl CliArgs {
    pub fn parse() -> Self {
        Self::from_matches(&command().get_matches())
    }

    fn from_matches(matches: &clap::ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("geod.toml")),
            plugin_dir: matches.get_one::<String>("plugins").map(PathBuf::from),
            bind_address: matches.get_one::<String>("bind").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::from_matches(&command().get_matches_from(args))
    }

    #[test]
    fn defaults() {
        let args = parse(&["geod"]);
        assert_eq!(args.config_path, PathBuf::from("geod.toml"));
        assert!(args.plugin_dir.is_none());
        assert!(!args.json_logs);
    }

    #[test]
    fn overrides() {
        let args = parse(&["geod", "-c", "/etc/geod.toml", "-p", "mods", "-b", "0.0.0.0:80", "-l", "debug", "--json-logs"]);
        assert_eq!(args.config_path, PathBuf::from("/etc/geod.toml"));
        assert_eq!(args.plugin_dir, Some(PathBuf::from("mods")));
        assert_eq!(args.bind_address.as_deref(), Some("0.0.0.0:80"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.json_logs);
    }
}
