//! Error taxonomy for pipeline resolution and execution.

use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::Stage;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Everything that can stop a run.
///
/// Resolution-time variants are raised before any container starts.
/// Run-time variants (storage, sync, launch) abort the run in progress.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("missing dependency: {0}")]
    DependencyMissing(String),

    #[error("invalid catalog {}: {reason}", .path.display())]
    CatalogInvalid { path: PathBuf, reason: String },

    #[error("required field `{0}` is missing or blank")]
    MissingField(&'static str),

    #[error("pipeline profile `{0}` is not defined in the pipeline catalog")]
    UnknownProfile(String),

    #[error("{stage} stage references tool `{tool}`, which is not in the tool catalog")]
    UnknownTool { stage: Stage, tool: String },

    #[error("{stage} stage uses profile `{profile}` for `{tool}`, which the tool does not declare")]
    UnknownToolProfile {
        stage: Stage,
        tool: String,
        profile: String,
    },

    #[error("pipeline profile `{0}` has no entries in its pipeline stage")]
    EmptyPipeline(String),

    #[error("parameter token `{0}` is not of the form NAME=value")]
    MalformedParameter(String),

    #[error("parameter `{name}` for `{tool}` expects {expected}, got `{value}`")]
    InvalidParameter {
        tool: String,
        name: String,
        expected: &'static str,
        value: String,
    },

    #[error("tool `{tool}` requires parameter `{name}`")]
    MissingParameter { tool: String, name: String },

    #[error("tool `{tool}` references unknown token `{{{token}}}`")]
    UnresolvedToken { tool: String, token: String },

    #[error("image sync failed for `{image}`: {reason}")]
    ImageSyncFailure { image: String, reason: String },

    #[error("failed to create volume `{volume}`: {reason}")]
    VolumeCreateFailure { volume: String, reason: String },

    #[error("failed to fix ownership on `{volume}`: {reason}")]
    PermissionFixFailure { volume: String, reason: String },

    #[error(
        "{stage} stage: container `{container}` for `{tool}` failed ({}): {stderr}",
        describe_exit(.exit_code, .timed_out)
    )]
    ContainerLaunchFailure {
        stage: Stage,
        tool: String,
        container: String,
        exit_code: Option<i32>,
        timed_out: bool,
        stderr: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Process exit code for this failure: 2 for configuration and
    /// validation problems, 1 for failures while the run was executing.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::DependencyMissing(_)
            | Self::CatalogInvalid { .. }
            | Self::MissingField(_)
            | Self::UnknownProfile(_)
            | Self::UnknownTool { .. }
            | Self::UnknownToolProfile { .. }
            | Self::EmptyPipeline(_)
            | Self::MalformedParameter(_)
            | Self::InvalidParameter { .. }
            | Self::MissingParameter { .. }
            | Self::UnresolvedToken { .. } => 2,
            Self::ImageSyncFailure { .. }
            | Self::VolumeCreateFailure { .. }
            | Self::PermissionFixFailure { .. }
            | Self::ContainerLaunchFailure { .. }
            | Self::Io(_) => 1,
        }
    }
}

fn describe_exit(exit_code: &Option<i32>, timed_out: &bool) -> String {
    match (*exit_code, *timed_out) {
        (_, true) => "timed out".to_string(),
        (Some(code), false) => format!("exit {code}"),
        (None, false) => "no exit status".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_errors_exit_with_two() {
        let err = PipelineError::UnknownProfile("nope".into());
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn launch_failure_exits_with_one_and_names_container() {
        let err = PipelineError::ContainerLaunchFailure {
            stage: Stage::Startup,
            tool: "git".into(),
            container: "git_1234".into(),
            exit_code: Some(3),
            timed_out: false,
            stderr: "fatal: repository not found".into(),
        };
        assert_eq!(err.exit_code(), 1);
        let msg = err.to_string();
        assert!(msg.contains("git_1234"));
        assert!(msg.contains("exit 3"));
        assert!(msg.contains("startup"));
    }

    #[test]
    fn timed_out_launch_says_so() {
        let err = PipelineError::ContainerLaunchFailure {
            stage: Stage::Pipeline,
            tool: "zap".into(),
            container: "zap_1".into(),
            exit_code: None,
            timed_out: true,
            stderr: String::new(),
        };
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn unresolved_token_renders_braces() {
        let err = PipelineError::UnresolvedToken {
            tool: "bandit".into(),
            token: "outdir".into(),
        };
        assert!(err.to_string().contains("{outdir}"));
    }
}
