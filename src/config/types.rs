use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pipeline::Stage;

/// How the compiler treats a `{token}` it cannot resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenPolicy {
    /// Warn and leave the placeholder in the command.
    #[default]
    Lenient,
    /// Fail resolution with `UnresolvedToken`.
    Strict,
}

/// Runner settings, read from `secpipe.yaml` in the catalog directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pipeline_catalog: String,
    pub tool_catalog: String,
    pub log_dir: PathBuf,
    pub docker_binary: String,
    /// Seconds a single container may run before it is killed.
    pub docker_timeout: u64,
    pub helper_image: String,
    pub service_user: String,
    pub mount_root: String,
    pub sync_images: bool,
    pub token_policy: TokenPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pipeline_catalog: "master.yaml".to_string(),
            tool_catalog: "secpipeline-config.yaml".to_string(),
            log_dir: PathBuf::from("./logs"),
            docker_binary: "docker".to_string(),
            docker_timeout: 3600,
            helper_image: "mtesauro/gasp-base:1.0.0".to_string(),
            service_user: "appsecpipeline:appsecpipeline".to_string(),
            mount_root: "/opt/appsecpipeline".to_string(),
            sync_images: true,
            token_policy: TokenPolicy::Lenient,
        }
    }
}

impl Settings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.docker_timeout)
    }

    /// `mount_root` without a trailing slash.
    pub fn mount_root(&self) -> &str {
        let root = self.mount_root.trim_end_matches('/');
        if root.is_empty() { "/" } else { root }
    }
}

/// Declared type of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    #[default]
    String,
    Int,
    Bool,
    Path,
    Url,
}

impl ParameterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterType::String => "a string",
            ParameterType::Int => "an integer",
            ParameterType::Bool => "true or false",
            ParameterType::Path => "a path",
            ParameterType::Url => "a URL",
        }
    }

    /// Check a raw value against this type.
    pub fn accepts(&self, value: &str) -> bool {
        match self {
            ParameterType::String => true,
            ParameterType::Int => value.parse::<i64>().is_ok(),
            ParameterType::Bool => matches!(value, "true" | "false"),
            ParameterType::Path => !value.is_empty(),
            ParameterType::Url => value
                .split_once("://")
                .is_some_and(|(scheme, rest)| !scheme.is_empty() && !rest.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterSpec {
    #[serde(rename = "type", default)]
    pub kind: ParameterType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<String>,
}

/// One containerized tool from the tool catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolDefinition {
    #[serde(alias = "docker")]
    pub image: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Phase templates (`pre`, `exec`, `report`, `post`) and auxiliary
    /// tokens such as `reportname`.
    #[serde(default)]
    pub commands: BTreeMap<String, String>,
    pub profiles: BTreeMap<String, String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterSpec>,
}

impl ToolDefinition {
    pub fn command(&self, phase: &str) -> Option<&str> {
        self.commands
            .get(phase)
            .map(String::as_str)
            .filter(|c| !c.trim().is_empty())
    }

    pub fn has_profile(&self, profile: &str) -> bool {
        self.profiles.contains_key(profile)
    }
}

/// A `(tool, tool-profile)` pair inside a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageEntry {
    pub tool: String,
    #[serde(rename = "tool-profile", alias = "tool_profile")]
    pub tool_profile: String,
}

impl StageEntry {
    pub fn new(tool: impl Into<String>, tool_profile: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            tool_profile: tool_profile.into(),
        }
    }
}

/// A named pipeline from the pipeline catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineProfile {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub startup: Vec<StageEntry>,
    #[serde(default)]
    pub pipeline: Vec<StageEntry>,
    #[serde(default, rename = "final")]
    pub final_stage: Vec<StageEntry>,
    #[serde(default, rename = "runevery", alias = "run_every")]
    pub run_every: Vec<StageEntry>,
}

impl PipelineProfile {
    pub fn entries(&self, stage: Stage) -> &[StageEntry] {
        match stage {
            Stage::Startup => &self.startup,
            Stage::Pipeline => &self.pipeline,
            Stage::Final => &self.final_stage,
            Stage::RunEvery => &self.run_every,
        }
    }

    pub fn entries_mut(&mut self, stage: Stage) -> &mut Vec<StageEntry> {
        match stage {
            Stage::Startup => &mut self.startup,
            Stage::Pipeline => &mut self.pipeline,
            Stage::Final => &mut self.final_stage,
            Stage::RunEvery => &mut self.run_every,
        }
    }
}

/// Both catalogs, loaded once per process.
#[derive(Debug, Clone, Default)]
pub struct Catalogs {
    pub pipelines: BTreeMap<String, PipelineProfile>,
    pub tools: BTreeMap<String, ToolDefinition>,
}
