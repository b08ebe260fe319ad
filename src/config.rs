use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use tracing::debug;

/// Top-level configuration file: a set of watches plus supervisor knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Override for the PID-file directory. When absent the default
    /// candidates are probed in order.
    #[serde(default)]
    pub pid_dir: Option<PathBuf>,

    /// Cadence of the liveness poller used when the kernel process
    /// connector is unavailable.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Skip the process connector entirely and rely on liveness polling.
    #[serde(default)]
    pub poll_only: bool,

    pub watches: BTreeMap<String, WatchConfig>,
}

fn default_poll_interval_secs() -> u64 {
    5
}

/// One watch definition as written by the operator.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchConfig {
    pub start: CommandLine,
    #[serde(default)]
    pub stop: Option<CommandLine>,
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub error_file: Option<PathBuf>,
}

/// Command line given either as a single string or as an argv list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Line(String),
    Argv(Vec<String>),
}

impl CommandLine {
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            CommandLine::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            CommandLine::Argv(argv) => argv.clone(),
        }
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&raw)
        .with_context(|| format!("parse config file {}", path.display()))?;
    anyhow::ensure!(
        !config.watches.is_empty(),
        "no watches configured in {}",
        path.display()
    );
    Ok(config)
}

const PID_DIR_CANDIDATES: &[&str] = &["/var/run/warden", "~/.warden/pid", "/tmp/warden/pid"];

/// Pick the directory PID files live in: the configured override if any,
/// else the first default candidate that can be created.
pub fn determine_pid_dir(configured: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(dir) = configured {
        fs::create_dir_all(dir)
            .with_context(|| format!("create PID directory {}", dir.display()))?;
        return Ok(dir.to_path_buf());
    }

    for candidate in PID_DIR_CANDIDATES {
        let Some(dir) = expand_home(candidate) else {
            continue;
        };
        if fs::create_dir_all(&dir).is_ok() {
            debug!("using '{}' as PID directory", dir.display());
            return Ok(dir);
        }
    }

    anyhow::bail!("failed to determine a usable PID directory")
}

fn expand_home(path: &str) -> Option<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => std::env::var_os("HOME").map(|home| PathBuf::from(home).join(rest)),
        None => Some(PathBuf::from(path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_string_and_list_start_commands() {
        let config: Config = serde_yaml::from_str(
            r#"
watches:
  redis:
    start: /usr/bin/redis-server /etc/redis.conf
    dir: /var/lib/redis
  echo:
    start: [/bin/echo, hello, world]
"#,
        )
        .unwrap();

        assert_eq!(config.poll_interval_secs, 5);
        assert!(!config.poll_only);
        assert_eq!(
            config.watches["redis"].start.to_argv(),
            vec!["/usr/bin/redis-server", "/etc/redis.conf"]
        );
        assert_eq!(
            config.watches["echo"].start.to_argv(),
            vec!["/bin/echo", "hello", "world"]
        );
    }

    #[test]
    fn rejects_unknown_keys() {
        let result: Result<Config, _> = serde_yaml::from_str(
            r#"
watches:
  app:
    start: /bin/true
    restart_limit: 3
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_an_empty_watch_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.yaml");
        fs::write(&path, "watches: {}\n").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn configured_pid_dir_is_created_and_used() {
        let dir = tempfile::tempdir().unwrap();
        let wanted = dir.path().join("pids");
        let picked = determine_pid_dir(Some(&wanted)).unwrap();
        assert_eq!(picked, wanted);
        assert!(wanted.is_dir());
    }

    #[test]
    fn home_prefix_expands_against_the_environment() {
        let expanded = expand_home("~/.warden/pid");
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(expanded, Some(PathBuf::from(home).join(".warden/pid")));
        } else {
            assert_eq!(expanded, None);
        }
        assert_eq!(expand_home("/tmp/x"), Some(PathBuf::from("/tmp/x")));
    }
}
