use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::params::BoundParameters;
use crate::config::{PipelineProfile, ToolDefinition};
use crate::error::PipelineError;
use crate::logging::DetailedLog;

/// One of the four stage groups of a pipeline profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Startup,
    Pipeline,
    Final,
    RunEvery,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Startup, Stage::Pipeline, Stage::Final, Stage::RunEvery];

    /// Stages a single synchronous run walks through, in order.
    pub const SCHEDULED: [Stage; 3] = [Stage::Startup, Stage::Pipeline, Stage::Final];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Startup => "startup",
            Stage::Pipeline => "pipeline",
            Stage::Final => "final",
            Stage::RunEvery => "runevery",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the run's shared data lives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StorageStrategy {
    /// A fresh `data_<run_id>` volume.
    #[default]
    Ephemeral,
    /// A host directory mounted in place of the volume.
    External(PathBuf),
}

/// What a run asks for, as translated from the command line.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub profile: String,
    pub app_name: String,
    pub target: Option<String>,
    pub dry_run: bool,
    pub keep: bool,
    pub storage: StorageStrategy,
    pub source: Option<PathBuf>,
    pub report: Option<PathBuf>,
    pub tool_profile: Option<String>,
    /// Space separated `NAME=value` tokens.
    pub params: String,
}

/// The source side of the main `-v` mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    Volume(String),
    HostPath(PathBuf),
}

impl fmt::Display for MountSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountSource::Volume(name) => f.write_str(name),
            MountSource::HostPath(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A catalog tool plus the parameters bound to it for this run.
#[derive(Debug, Clone)]
pub struct ResolvedTool {
    pub definition: ToolDefinition,
    pub params: BoundParameters,
}

/// Everything the orchestrator needs for one run. Owned by a single run
/// and dropped when it ends.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: Uuid,
    pub request: RunRequest,
    /// Stage lists copied from the matched profile, overrides applied.
    pub stages: PipelineProfile,
    pub tools: BTreeMap<String, ResolvedTool>,
    pub mount: Option<MountSource>,
    /// Volume created for this run, if any.
    pub volume: Option<String>,
    /// Names of containers launched so far.
    pub launched: Vec<String>,
    pub log: DetailedLog,
}

impl RunContext {
    pub fn container_name(&self, tool: &str) -> String {
        format!("{tool}_{}", self.run_id)
    }

    pub fn volume_name(&self) -> String {
        format!("data_{}", self.run_id)
    }

    pub fn attach_log(&mut self, log: DetailedLog) {
        self.log = log;
    }

    /// Distinct images of every tool in the run.
    pub fn images(&self) -> BTreeSet<String> {
        self.tools
            .values()
            .map(|t| t.definition.image.clone())
            .collect()
    }

    /// Copy/paste commands for removing what this run left behind.
    pub fn cleanup_hints(&self, binary: &str) -> Vec<String> {
        let mut hints = Vec::new();
        if self.request.keep && !self.request.dry_run {
            hints.extend(self.launched.iter().map(|c| format!("{binary} rm {c}")));
        }
        if let Some(volume) = &self.volume {
            hints.push(format!("{binary} volume rm {volume}"));
        }
        hints
    }
}

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Init,
    Startup,
    Pipeline,
    Final,
    Done,
    Aborted,
}

impl RunState {
    /// State for a scheduled stage; `None` for `RunEvery`.
    pub fn for_stage(stage: Stage) -> Option<Self> {
        match stage {
            Stage::Startup => Some(RunState::Startup),
            Stage::Pipeline => Some(RunState::Pipeline),
            Stage::Final => Some(RunState::Final),
            Stage::RunEvery => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryStatus {
    Launched,
    DryRun,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryOutcome {
    pub stage: Stage,
    pub tool: String,
    pub tool_profile: String,
    pub container: String,
    pub command: String,
    pub status: EntryStatus,
}

/// Serializable record of a finished (or aborted) run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub profile: String,
    pub app_name: String,
    pub target: Option<String>,
    pub dry_run: bool,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mount: Option<String>,
    pub volume: Option<String>,
    pub containers: Vec<String>,
    pub entries: Vec<EntryOutcome>,
    pub skipped_run_every: usize,
    pub error: Option<String>,
}

/// Result of `Orchestrator::run`: the summary is produced either way.
#[derive(Debug)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub error: Option<PipelineError>,
}

impl RunOutcome {
    pub fn into_result(self) -> Result<RunSummary, PipelineError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.summary),
        }
    }
}
