// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::ValueEnum;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub publisher: PublisherConfig,
    /// Static credentials and settings exposed to the template as `auth`.
    #[serde(default)]
    pub auth: serde_json::Value,
    pub tailer: TailerConfig,
    pub control: ControlConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    pub template: PathBuf,
    pub script: PathBuf,
    #[serde(default = "default_queue_maxsize")]
    pub queue_maxsize: usize,
    #[serde(default = "default_env")]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_argument_prefix")]
    pub argument_prefix: String,
    #[serde(default)]
    pub shutdown_policy: ShutdownPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TailerConfig {
    pub file_path: PathBuf,
    #[serde(default = "default_backlog")]
    pub backlog: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    pub socket_path: PathBuf,
}

/// What happens to a running export when the service is asked to shut down.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum, Default, Deserialize)]
#[clap(rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ShutdownPolicy {
    #[default]
    /// Default: cancel the loops but let the export subprocess run to completion on its own
    LeaveRunning,
    /// Terminate the export's process group before the loops are cancelled
    Terminate,
}

fn default_queue_maxsize() -> usize {
    10
}

fn default_backlog() -> usize {
    100
}

fn default_env() -> BTreeMap<String, String> {
    BTreeMap::from([("DISPLAY".to_string(), ":0".to_string())])
}

fn default_argument_prefix() -> String {
    "properties=".to_string()
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = Config::parse(
            r#"{
                "publisher": {"template": "/etc/publishd/project.tmpl", "script": "/opt/export/run.sh"},
                "tailer": {"file_path": "/var/log/export.log"},
                "control": {"socket_path": "/run/publishd.sock"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.publisher.queue_maxsize, 10);
        assert_eq!(config.publisher.env.get("DISPLAY").map(String::as_str), Some(":0"));
        assert_eq!(config.publisher.argument_prefix, "properties=");
        assert_eq!(config.publisher.shutdown_policy, ShutdownPolicy::LeaveRunning);
        assert_eq!(config.tailer.backlog, 100);
        assert!(config.auth.is_null());
    }

    #[test]
    fn explicit_values_win() {
        let config = Config::parse(
            r#"{
                "publisher": {
                    "template": "t", "script": "s", "queue_maxsize": 3,
                    "env": {"DISPLAY": ":1", "LANG": "C"},
                    "shutdown_policy": "terminate"
                },
                "auth": {"username": "svc", "password": "secret"},
                "tailer": {"file_path": "log", "backlog": 5},
                "control": {"socket_path": "sock"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.publisher.queue_maxsize, 3);
        assert_eq!(config.publisher.env.len(), 2);
        assert_eq!(config.publisher.shutdown_policy, ShutdownPolicy::Terminate);
        assert_eq!(config.auth["username"], "svc");
        assert_eq!(config.tailer.backlog, 5);
    }

    #[test]
    fn missing_section_is_rejected() {
        assert!(Config::parse(r#"{"publisher": {"template": "t", "script": "s"}}"#).is_err());
    }
}
