//! Runner configuration parsing.
//!
//! ```kdl
//! runner {
//!     executor "docker"
//!     max-parallel 4
//!     workspace-root "/var/tmp/pipewright"
//!     keep-workspace #false
//! }
//! images {
//!     ubuntu-latest "ubuntu:24.04"
//! }
//! ```

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Which executor backend runs the steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Child processes on the host.
    #[default]
    Local,
    /// One container per run.
    Docker,
}

impl FromStr for ExecutorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s {
            "local" => Ok(ExecutorKind::Local),
            "docker" => Ok(ExecutorKind::Docker),
            other => Err(ConfigError::InvalidValue {
                field: "executor".to_string(),
                message: format!("unknown executor: {} (expected local or docker)", other),
            }),
        }
    }
}

/// Runner-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub executor: ExecutorKind,
    /// Overrides the workflow's `max-parallel`.
    pub max_parallel: Option<usize>,
    /// Where workspaces are created (defaults to the system temp dir).
    pub workspace_root: Option<PathBuf>,
    /// Leave workspaces on disk after runs finish.
    pub keep_workspace: bool,
    /// Container image for each `os` matrix value.
    pub images: HashMap<String, String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let images = [
            ("ubuntu-latest", "ubuntu:24.04"),
            ("ubuntu-24.04", "ubuntu:24.04"),
            ("ubuntu-22.04", "ubuntu:22.04"),
            ("debian-latest", "debian:bookworm"),
        ]
        .into_iter()
        .map(|(os, image)| (os.to_string(), image.to_string()))
        .collect();

        Self {
            executor: ExecutorKind::Local,
            max_parallel: None,
            workspace_root: None,
            keep_workspace: false,
            images,
        }
    }
}

impl RunnerConfig {
    /// Container image for an `os` value. Unmapped values are used as image names.
    pub fn image_for(&self, os: &str) -> String {
        self.images
            .get(os)
            .cloned()
            .unwrap_or_else(|| os.to_string())
    }
}

/// Read and parse a runner configuration file.
pub fn load_runner_config(path: &Path) -> ConfigResult<RunnerConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_runner_config(&content)
}

/// Parse runner configuration from KDL text. Missing settings keep their defaults.
pub fn parse_runner_config(kdl: &str) -> ConfigResult<RunnerConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = RunnerConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "runner" => {
                let Some(children) = node.children() else {
                    continue;
                };
                for child in children.nodes() {
                    match child.name().value() {
                        "executor" => {
                            config.executor = first_string(child, "executor")?.parse()?;
                        }
                        "max-parallel" => {
                            let value = first_integer(child, "max-parallel")?;
                            if value < 1 {
                                return Err(ConfigError::InvalidValue {
                                    field: "max-parallel".to_string(),
                                    message: "must be at least 1".to_string(),
                                });
                            }
                            config.max_parallel = Some(value as usize);
                        }
                        "workspace-root" => {
                            config.workspace_root =
                                Some(PathBuf::from(first_string(child, "workspace-root")?));
                        }
                        "keep-workspace" => {
                            config.keep_workspace = child
                                .entries()
                                .iter()
                                .find(|e| e.name().is_none())
                                .and_then(|e| e.value().as_bool())
                                .ok_or_else(|| ConfigError::InvalidValue {
                                    field: "keep-workspace".to_string(),
                                    message: "expected #true or #false".to_string(),
                                })?;
                        }
                        other => {
                            return Err(ConfigError::InvalidValue {
                                field: "runner".to_string(),
                                message: format!("unknown setting: {}", other),
                            });
                        }
                    }
                }
            }
            "images" => {
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        let os = child.name().value().to_string();
                        let image = first_string(child, &os)?;
                        config.images.insert(os, image);
                    }
                }
            }
            _ => {}
        }
    }

    Ok(config)
}

fn first_arg(node: &KdlNode) -> Option<&kdl::KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn first_string(node: &KdlNode, field: &str) -> ConfigResult<String> {
    first_arg(node)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

fn first_integer(node: &KdlNode, field: &str) -> ConfigResult<i128> {
    first_arg(node)
        .and_then(|v| v.as_integer())
        .ok_or_else(|| ConfigError::InvalidValue {
            field: field.to_string(),
            message: "expected an integer".to_string(),
        })
}
