use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use tracing::{debug, error, info, info_span};

use super::compiler;
use super::launcher;
use super::types::{
    EntryOutcome, EntryStatus, RunContext, RunOutcome, RunState, RunSummary, Stage,
};
use super::volume;
use crate::config::Settings;
use crate::docker::{self, ContainerRuntime};
use crate::error::{PipelineError, Result};

/// Drives one resolved run: image sync, storage, then Startup, Pipeline and
/// Final strictly in order. The first failure aborts the run.
pub struct Orchestrator<R> {
    runtime: R,
    settings: Settings,
}

impl<R: ContainerRuntime> Orchestrator<R> {
    pub fn new(runtime: R, settings: Settings) -> Self {
        Self { runtime, settings }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Execute the run. A summary comes back whether or not it succeeded.
    pub fn run(&self, ctx: &mut RunContext) -> RunOutcome {
        let span = info_span!("run", run_id = %ctx.run_id, profile = %ctx.request.profile);
        let _enter = span.enter();

        let started_at = Utc::now();
        let mut state = RunState::Init;
        let mut entries = Vec::new();

        info!(
            "starting run for `{}`{}",
            ctx.request.app_name,
            if ctx.request.dry_run { " (dry run)" } else { "" }
        );
        ctx.log.record(
            &format!(
                "run {} profile={} app={}",
                ctx.run_id, ctx.request.profile, ctx.request.app_name
            ),
            "",
        );

        let result = self.drive(ctx, &mut state, &mut entries);
        let skipped_run_every = skip_run_every(ctx);

        let error = result.err();
        match &error {
            Some(e) => {
                error!("run aborted in {state:?}: {e}");
                ctx.log.record(&format!("aborted: {e}"), "");
                state = RunState::Aborted;
            }
            None => {
                info!("run complete, {} entries", entries.len());
                state = RunState::Done;
            }
        }

        let summary = RunSummary {
            run_id: ctx.run_id,
            profile: ctx.request.profile.clone(),
            app_name: ctx.request.app_name.clone(),
            target: ctx.request.target.clone(),
            dry_run: ctx.request.dry_run,
            state,
            started_at,
            finished_at: Utc::now(),
            mount: ctx.mount.as_ref().map(ToString::to_string),
            volume: ctx.volume.clone(),
            containers: ctx.launched.clone(),
            entries,
            skipped_run_every,
            error: error.as_ref().map(ToString::to_string),
        };

        RunOutcome { summary, error }
    }

    fn drive(
        &self,
        ctx: &mut RunContext,
        state: &mut RunState,
        entries: &mut Vec<EntryOutcome>,
    ) -> Result<()> {
        if ctx.request.dry_run {
            debug!("dry run, skipping image sync");
        } else if !self.settings.sync_images {
            debug!("image sync disabled");
        } else {
            let images = ctx.images();
            docker::sync_images(&self.runtime, &images, self.settings.timeout(), &mut ctx.log)?;
        }

        let mount = volume::prepare_storage(ctx, &self.runtime, &self.settings)?;
        info!("run data mounted from {mount}");

        for stage in Stage::SCHEDULED {
            if let Some(next) = RunState::for_stage(stage) {
                *state = next;
            }
            let stage_entries = ctx.stages.entries(stage).to_vec();
            if stage_entries.is_empty() {
                debug!("{stage}: nothing to run");
                continue;
            }
            info!("{stage}: {} entries", stage_entries.len());

            for entry in &stage_entries {
                let tool = ctx.tools.get(&entry.tool).ok_or_else(|| PipelineError::UnknownTool {
                    stage,
                    tool: entry.tool.clone(),
                })?;
                let compiled = compiler::compile(
                    stage,
                    &entry.tool,
                    &tool.definition,
                    &entry.tool_profile,
                    &tool.params,
                    self.settings.token_policy,
                )?;

                let mut outcome = EntryOutcome {
                    stage,
                    tool: entry.tool.clone(),
                    tool_profile: entry.tool_profile.clone(),
                    container: ctx.container_name(&entry.tool),
                    command: compiled.command.trim_end().to_string(),
                    status: EntryStatus::Failed,
                };

                match launcher::launch(&self.runtime, ctx, stage, entry, &compiled, &self.settings) {
                    Ok(status) => {
                        outcome.status = status;
                        entries.push(outcome);
                    }
                    Err(e) => {
                        entries.push(outcome);
                        return Err(e);
                    }
                }
            }
        }

        Ok(())
    }
}

fn skip_run_every(ctx: &RunContext) -> usize {
    for entry in &ctx.stages.run_every {
        info!(
            "runevery: {} ({}) is not scheduled by a single run, skipped",
            entry.tool, entry.tool_profile
        );
    }
    ctx.stages.run_every.len()
}

/// Write `<log_dir>/<run_id>_summary.json` and return its path.
pub fn write_summary(log_dir: &Path, summary: &RunSummary) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;
    let path = log_dir.join(format!("{}_summary.json", summary.run_id));
    let json = serde_json::to_string_pretty(summary).context("failed to serialize run summary")?;
    std::fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Catalogs, PipelineProfile, StageEntry, TokenPolicy, ToolDefinition};
    use crate::docker::{ContainerCommand, ContainerResult};
    use crate::pipeline::resolver::resolve;
    use crate::pipeline::types::RunRequest;
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    /// Records every invocation and fails `run` for the named container prefix.
    #[derive(Default)]
    struct RecordingRuntime {
        fail_container: Option<&'static str>,
        calls: RefCell<Vec<Vec<String>>>,
    }

    impl RecordingRuntime {
        fn runs(&self) -> Vec<Vec<String>> {
            self.calls
                .borrow()
                .iter()
                .filter(|a| a[0] == "run" && a.contains(&"--net=host".to_string()))
                .cloned()
                .collect()
        }
    }

    impl ContainerRuntime for RecordingRuntime {
        fn execute(&self, cmd: &ContainerCommand) -> anyhow::Result<ContainerResult> {
            self.calls.borrow_mut().push(cmd.args.clone());
            if let Some(prefix) = self.fail_container
                && cmd
                    .args
                    .iter()
                    .any(|a| a.starts_with(&format!("{prefix}_")))
            {
                return Ok(ContainerResult::failed(128, "fatal: repository not found"));
            }
            Ok(ContainerResult::ok(""))
        }
    }

    fn tool(image: &str, exec: &str) -> ToolDefinition {
        ToolDefinition {
            image: image.into(),
            description: None,
            commands: BTreeMap::from([("exec".to_string(), exec.to_string())]),
            profiles: BTreeMap::from([("default".to_string(), String::new())]),
            parameters: BTreeMap::new(),
        }
    }

    fn catalogs() -> Catalogs {
        let mut cats = Catalogs::default();
        cats.tools.insert("git".into(), tool("example/git:1", "git clone repo"));
        cats.tools.insert("lint".into(), tool("example/lint:1", "lint-cli src"));
        cats.tools.insert("upload".into(), tool("example/upload:1", "upload reports"));
        cats.pipelines.insert(
            "quick".into(),
            PipelineProfile {
                startup: vec![StageEntry::new("git", "default")],
                pipeline: vec![StageEntry::new("lint", "default")],
                final_stage: vec![StageEntry::new("upload", "default")],
                run_every: vec![StageEntry::new("lint", "default")],
                ..PipelineProfile::default()
            },
        );
        cats
    }

    fn context(dry_run: bool) -> RunContext {
        let request = RunRequest {
            profile: "quick".into(),
            app_name: "shop".into(),
            dry_run,
            ..RunRequest::default()
        };
        resolve(request, &catalogs(), TokenPolicy::Lenient).unwrap()
    }

    #[test]
    fn stages_run_in_order_and_finish_done() {
        let orch = Orchestrator::new(RecordingRuntime::default(), Settings::default());
        let mut ctx = context(false);
        let outcome = orch.run(&mut ctx);

        assert!(outcome.error.is_none());
        assert_eq!(outcome.summary.state, RunState::Done);
        let stages: Vec<Stage> = outcome.summary.entries.iter().map(|e| e.stage).collect();
        assert_eq!(stages, vec![Stage::Startup, Stage::Pipeline, Stage::Final]);
        assert_eq!(outcome.summary.skipped_run_every, 1);

        let runs = orch.runtime().runs();
        assert_eq!(runs.len(), 3);
        assert!(runs[0].contains(&"example/git:1".to_string()));
        assert!(runs[2].contains(&"example/upload:1".to_string()));
        assert_eq!(outcome.summary.volume, Some(ctx.volume_name()));
    }

    #[test]
    fn runtime_sequence_starts_with_sync_and_storage() {
        let orch = Orchestrator::new(RecordingRuntime::default(), Settings::default());
        let mut ctx = context(false);
        orch.run(&mut ctx);
        let calls = orch.runtime().calls.borrow();
        assert_eq!(calls[0][0], "images");
        assert_eq!(calls.iter().filter(|c| c[0] == "pull").count(), 3);
        assert!(calls.iter().any(|c| c[..2] == ["volume", "create"]));
    }

    #[test]
    fn startup_failure_stops_later_stages() {
        let rt = RecordingRuntime {
            fail_container: Some("git"),
            ..RecordingRuntime::default()
        };
        let orch = Orchestrator::new(rt, Settings::default());
        let mut ctx = context(false);
        let outcome = orch.run(&mut ctx);

        assert_eq!(outcome.summary.state, RunState::Aborted);
        assert_eq!(orch.runtime().runs().len(), 1);
        assert_eq!(outcome.summary.entries.len(), 1);
        assert_eq!(outcome.summary.entries[0].status, EntryStatus::Failed);
        let err = outcome.into_result().unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ContainerLaunchFailure { stage: Stage::Startup, .. }
        ));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn dry_run_never_invokes_runtime_but_compiles_identically() {
        let orch = Orchestrator::new(RecordingRuntime::default(), Settings::default());
        let mut dry = context(true);
        let dry_outcome = orch.run(&mut dry);
        assert!(orch.runtime().calls.borrow().is_empty());
        assert!(dry_outcome.summary.entries.iter().all(|e| e.status == EntryStatus::DryRun));
        assert!(dry_outcome.summary.volume.is_none());

        let mut live = context(false);
        let live_outcome = orch.run(&mut live);
        let commands = |o: &RunOutcome| -> Vec<String> {
            o.summary.entries.iter().map(|e| e.command.clone()).collect()
        };
        assert_eq!(commands(&dry_outcome), commands(&live_outcome));
    }

    #[test]
    fn context_missing_a_tool_aborts_instead_of_panicking() {
        let orch = Orchestrator::new(RecordingRuntime::default(), Settings::default());
        let mut ctx = context(false);
        ctx.tools.remove("lint");
        let outcome = orch.run(&mut ctx);

        assert_eq!(outcome.summary.state, RunState::Aborted);
        assert_eq!(orch.runtime().runs().len(), 1);
        assert!(matches!(
            outcome.error,
            Some(PipelineError::UnknownTool { stage: Stage::Pipeline, ref tool }) if tool == "lint"
        ));
    }

    #[test]
    fn image_sync_can_be_disabled() {
        let settings = Settings {
            sync_images: false,
            ..Settings::default()
        };
        let orch = Orchestrator::new(RecordingRuntime::default(), settings);
        let mut ctx = context(false);
        orch.run(&mut ctx);
        let calls = orch.runtime().calls.borrow();
        assert!(calls.iter().all(|c| c[0] != "images" && c[0] != "pull"));
    }

    #[test]
    fn summary_is_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(RecordingRuntime::default(), Settings::default());
        let mut ctx = context(true);
        let outcome = orch.run(&mut ctx);
        let path = write_summary(dir.path(), &outcome.summary).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            format!("{}_summary.json", ctx.run_id)
        );
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["state"], "done");
        assert_eq!(json["entries"][0]["status"], "dry-run");
        assert_eq!(json["profile"], "quick");
    }
}
