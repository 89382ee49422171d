use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::identity::{User, UserId};
use crate::core::workspace::WorkspaceId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub id: u64,
    pub name: String,
}

/// 进程配置（toml）。缺省字段取默认值。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub http_port: u16,
    /// 默认 workspace 的 id（不可取消发布）
    pub default_workspace: u64,
    pub snapshot_interval_secs: u64,
    /// 未带 X-User-Id 时的操作者
    pub anonymous_user: u64,
    pub users: Vec<UserEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: Self::default_data_dir(),
            http_port: 6061,
            default_workspace: 1,
            snapshot_interval_secs: 300,
            anonymous_user: UserId::ANONYMOUS.0,
            users: Vec::new(),
        }
    }
}

impl Config {
    /// ~/.local/share/ws-seq（平台相关）
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ws-seq")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn default_workspace_id(&self) -> WorkspaceId {
        WorkspaceId(self.default_workspace)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join("registry.db")
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    pub fn user_list(&self) -> Vec<User> {
        self.users
            .iter()
            .map(|u| User::new(UserId(u.id), &u.name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg = Config::parse(
            r#"
            http_port = 7000
            default_workspace = 3

            [[users]]
            id = 1
            name = "admin"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.http_port, 7000);
        assert_eq!(cfg.default_workspace_id(), WorkspaceId(3));
        assert_eq!(cfg.snapshot_interval_secs, 300);
        assert_eq!(cfg.user_list(), vec![User::new(UserId(1), "admin")]);
        assert_eq!(cfg.wal_dir(), cfg.data_dir.join("wal"));
    }

    #[test]
    fn unknown_type_is_an_error() {
        assert!(Config::parse("http_port = \"not a port\"").is_err());
    }
}
