use std::path::PathBuf;

use anyhow::Context;
use users::{get_group_by_name, get_user_by_name};

use crate::config::WatchConfig;

/// Immutable description of one supervised program.
///
/// Built once from configuration; workers and the dispatch layer only read
/// it. `user` keeps the textual name alongside the resolved ids because
/// supplementary-group initialization is keyed by name.
#[derive(Debug, Clone)]
pub struct Watch {
    pub name: String,
    pub start: Vec<String>,
    pub dir: Option<PathBuf>,
    pub user: Option<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub stop: Option<Vec<String>>,
    pub log_file: Option<PathBuf>,
    pub error_file: Option<PathBuf>,
}

impl Watch {
    pub fn from_config(name: &str, config: &WatchConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(!name.is_empty(), "watch name must not be empty");

        let start = config.start.to_argv();
        anyhow::ensure!(
            !start.is_empty(),
            "watch '{name}' has an empty start command"
        );

        let mut uid = None;
        let mut gid = None;
        if let Some(user) = config.user.as_deref() {
            let entry = get_user_by_name(user)
                .with_context(|| format!("watch '{name}': unknown user '{user}'"))?;
            uid = Some(entry.uid());
            gid = Some(entry.primary_group_id());
        }
        if let Some(group) = config.group.as_deref() {
            let entry = get_group_by_name(group)
                .with_context(|| format!("watch '{name}': unknown group '{group}'"))?;
            gid = Some(entry.gid());
        }

        Ok(Self {
            name: name.to_string(),
            start,
            dir: config.dir.clone(),
            user: config.user.clone(),
            uid,
            gid,
            stop: config.stop.as_ref().map(|stop| stop.to_argv()),
            log_file: config.log_file.clone(),
            error_file: config.error_file.clone(),
        })
    }
}
