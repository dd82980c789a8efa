use std::time::Duration;

use tracing::{debug, info, warn};

use super::compiler::CompiledCommand;
use super::types::{EntryStatus, MountSource, RunContext, Stage};
use crate::config::{Settings, StageEntry};
use crate::docker::{ContainerCommand, ContainerRuntime};
use crate::error::{PipelineError, Result};

const REMOVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Build the `docker run` argument vector for one stage entry.
pub fn container_args(
    ctx: &RunContext,
    entry: &StageEntry,
    image: &str,
    mount: &MountSource,
    compiled: &CompiledCommand,
    settings: &Settings,
) -> Vec<String> {
    let root = settings.mount_root();
    let mut args = vec!["run".into(), "-v".into(), format!("{mount}:{root}/")];

    if !ctx.request.keep {
        args.push("--rm".into());
    }
    if let Some(source) = &ctx.request.source {
        args.push("-v".into());
        args.push(format!("{}:{root}/source", source.display()));
    }
    if let Some(report) = &ctx.request.report {
        args.push("-v".into());
        args.push(format!("{}:{root}/reports", report.display()));
    }

    args.extend([
        "--net=host".into(),
        "--name".into(),
        ctx.container_name(&entry.tool),
        image.to_string(),
    ]);
    args.extend(compiled.tokens());
    args
}

/// Run one compiled stage entry to completion.
///
/// On a dry run the invocation is only logged. A live launch is recorded in
/// `ctx.launched` once the runtime has started it, whatever its exit status.
pub fn launch<R>(
    runtime: &R,
    ctx: &mut RunContext,
    stage: Stage,
    entry: &StageEntry,
    compiled: &CompiledCommand,
    settings: &Settings,
) -> Result<EntryStatus>
where
    R: ContainerRuntime + ?Sized,
{
    let image = ctx
        .tools
        .get(&entry.tool)
        .map(|t| t.definition.image.clone())
        .ok_or_else(|| PipelineError::UnknownTool {
            stage,
            tool: entry.tool.clone(),
        })?;
    let mount = ctx
        .mount
        .clone()
        .unwrap_or_else(|| MountSource::Volume(ctx.volume_name()));
    let container = ctx.container_name(&entry.tool);
    let cmd = ContainerCommand::new(
        container_args(ctx, entry, &image, &mount, compiled, settings),
        settings.timeout(),
    );

    if ctx.request.dry_run {
        info!("[dry run] {stage}: {} {}", settings.docker_binary, cmd.display());
        ctx.log.record(&format!("[dry run] {}", cmd.display()), "");
        return Ok(EntryStatus::DryRun);
    }

    info!("{stage}: launching {container} ({image})");
    debug!("{} {}", settings.docker_binary, cmd.display());

    let result = runtime
        .execute(&cmd)
        .map_err(|e| PipelineError::ContainerLaunchFailure {
            stage,
            tool: entry.tool.clone(),
            container: container.clone(),
            exit_code: None,
            timed_out: false,
            stderr: e.to_string(),
        })?;

    ctx.launched.push(container.clone());
    ctx.log.record_result(&cmd.display(), &result);

    if result.timed_out {
        force_remove(runtime, ctx, &container, settings);
    }

    if !result.success {
        return Err(PipelineError::ContainerLaunchFailure {
            stage,
            tool: entry.tool.clone(),
            container,
            exit_code: result.exit_code,
            timed_out: result.timed_out,
            stderr: result.stderr.trim().to_string(),
        });
    }

    info!("{stage}: {container} finished");
    Ok(EntryStatus::Launched)
}

/// Killing the client on timeout leaves the container running in the
/// daemon, so it is removed explicitly.
fn force_remove<R>(runtime: &R, ctx: &mut RunContext, container: &str, settings: &Settings)
where
    R: ContainerRuntime + ?Sized,
{
    let rm = ContainerCommand::new(
        vec!["rm".into(), "-f".into(), container.to_string()],
        REMOVE_TIMEOUT,
    );
    warn!("{container} timed out, removing it");
    match runtime.execute(&rm) {
        Ok(result) => {
            ctx.log.record_result(&rm.display(), &result);
            if !result.success {
                warn!(
                    "failed to remove {container} ({}); remove it with `{} rm -f {container}`",
                    result.failure_reason(),
                    settings.docker_binary
                );
            }
        }
        Err(e) => warn!(
            "failed to remove {container} ({e}); remove it with `{} rm -f {container}`",
            settings.docker_binary
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineProfile, ToolDefinition};
    use crate::docker::ContainerResult;
    use crate::logging::DetailedLog;
    use crate::pipeline::params::BoundParameters;
    use crate::pipeline::types::{ResolvedTool, RunRequest};
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use uuid::Uuid;

    struct FakeRuntime {
        result: ContainerResult,
        calls: RefCell<Vec<ContainerCommand>>,
    }

    impl FakeRuntime {
        fn returning(result: ContainerResult) -> Self {
            Self {
                result,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl ContainerRuntime for FakeRuntime {
        fn execute(&self, cmd: &ContainerCommand) -> anyhow::Result<ContainerResult> {
            self.calls.borrow_mut().push(cmd.clone());
            Ok(self.result.clone())
        }
    }

    struct Unstartable;

    impl ContainerRuntime for Unstartable {
        fn execute(&self, _cmd: &ContainerCommand) -> anyhow::Result<ContainerResult> {
            anyhow::bail!("No such file or directory")
        }
    }

    fn context(request: RunRequest) -> RunContext {
        let definition = ToolDefinition {
            image: "example/lint:1.0".into(),
            description: None,
            commands: BTreeMap::new(),
            profiles: BTreeMap::from([("default".to_string(), "--strict".to_string())]),
            parameters: BTreeMap::new(),
        };
        RunContext {
            run_id: Uuid::nil(),
            request,
            stages: PipelineProfile::default(),
            tools: BTreeMap::from([(
                "lint".to_string(),
                ResolvedTool {
                    definition,
                    params: BoundParameters::default(),
                },
            )]),
            mount: Some(MountSource::Volume(format!("data_{}", Uuid::nil()))),
            volume: None,
            launched: Vec::new(),
            log: DetailedLog::discard(),
        }
    }

    fn compiled(command: &str) -> CompiledCommand {
        CompiledCommand {
            command: command.into(),
            unresolved_tokens: Vec::new(),
            unresolved_params: Vec::new(),
        }
    }

    #[test]
    fn args_follow_run_layout() {
        let ctx = context(RunRequest::default());
        let entry = StageEntry::new("lint", "default");
        let mount = ctx.mount.clone().unwrap();
        let args = container_args(
            &ctx,
            &entry,
            "example/lint:1.0",
            &mount,
            &compiled("lint-cli out.json --strict "),
            &Settings::default(),
        );
        let id = Uuid::nil();
        let expected: Vec<String> = [
            "run".to_string(),
            "-v".into(),
            format!("data_{id}:/opt/appsecpipeline/"),
            "--rm".into(),
            "--net=host".into(),
            "--name".into(),
            format!("lint_{id}"),
            "example/lint:1.0".into(),
            "lint-cli".into(),
            "out.json".into(),
            "--strict".into(),
        ]
        .into();
        assert_eq!(args, expected);
    }

    #[test]
    fn keep_source_and_report_change_mounts() {
        let ctx = context(RunRequest {
            keep: true,
            source: Some(PathBuf::from("/home/dev/app")),
            report: Some(PathBuf::from("/tmp/reports")),
            ..RunRequest::default()
        });
        let mount = MountSource::HostPath(PathBuf::from("/srv/run"));
        let args = container_args(
            &ctx,
            &StageEntry::new("lint", "default"),
            "example/lint:1.0",
            &mount,
            &compiled("lint"),
            &Settings::default(),
        );
        assert_eq!(args[2], "/srv/run:/opt/appsecpipeline/");
        assert!(!args.contains(&"--rm".to_string()));
        assert_eq!(args[3..7], [
            "-v".to_string(),
            "/home/dev/app:/opt/appsecpipeline/source".into(),
            "-v".into(),
            "/tmp/reports:/opt/appsecpipeline/reports".into(),
        ]);
    }

    #[test]
    fn dry_run_never_calls_runtime() {
        let rt = FakeRuntime::returning(ContainerResult::ok(""));
        let mut ctx = context(RunRequest {
            dry_run: true,
            ..RunRequest::default()
        });
        let status = launch(
            &rt,
            &mut ctx,
            Stage::Pipeline,
            &StageEntry::new("lint", "default"),
            &compiled("lint"),
            &Settings::default(),
        )
        .unwrap();
        assert_eq!(status, EntryStatus::DryRun);
        assert!(rt.calls.borrow().is_empty());
        assert!(ctx.launched.is_empty());
    }

    #[test]
    fn live_launch_uses_configured_timeout() {
        let rt = FakeRuntime::returning(ContainerResult::ok("done"));
        let mut ctx = context(RunRequest::default());
        let settings = Settings {
            docker_timeout: 42,
            ..Settings::default()
        };
        let status = launch(
            &rt,
            &mut ctx,
            Stage::Pipeline,
            &StageEntry::new("lint", "default"),
            &compiled("lint"),
            &settings,
        )
        .unwrap();
        assert_eq!(status, EntryStatus::Launched);
        assert_eq!(rt.calls.borrow()[0].timeout.as_secs(), 42);
        assert_eq!(ctx.launched, vec![format!("lint_{}", Uuid::nil())]);
    }

    #[test]
    fn non_zero_exit_carries_stage_and_stderr() {
        let rt = FakeRuntime::returning(ContainerResult::failed(2, "bad flag\n"));
        let mut ctx = context(RunRequest::default());
        let err = launch(
            &rt,
            &mut ctx,
            Stage::Startup,
            &StageEntry::new("lint", "default"),
            &compiled("lint"),
            &Settings::default(),
        )
        .unwrap_err();
        match err {
            PipelineError::ContainerLaunchFailure {
                stage,
                tool,
                exit_code,
                stderr,
                ..
            } => {
                assert_eq!(stage, Stage::Startup);
                assert_eq!(tool, "lint");
                assert_eq!(exit_code, Some(2));
                assert_eq!(stderr, "bad flag");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(ctx.launched.len(), 1);
    }

    #[test]
    fn spawn_error_is_a_launch_failure() {
        let mut ctx = context(RunRequest::default());
        let err = launch(
            &Unstartable,
            &mut ctx,
            Stage::Final,
            &StageEntry::new("lint", "default"),
            &compiled("lint"),
            &Settings::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ContainerLaunchFailure { exit_code: None, .. }
        ));
        assert!(ctx.launched.is_empty());
    }

    #[test]
    fn timed_out_container_is_force_removed() {
        let rt = FakeRuntime::returning(ContainerResult {
            timed_out: true,
            ..ContainerResult::default()
        });
        let mut ctx = context(RunRequest::default());
        let err = launch(
            &rt,
            &mut ctx,
            Stage::Pipeline,
            &StageEntry::new("lint", "default"),
            &compiled("lint"),
            &Settings::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ContainerLaunchFailure { timed_out: true, .. }
        ));
        let calls = rt.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[1].args,
            vec!["rm".to_string(), "-f".into(), format!("lint_{}", Uuid::nil())]
        );
    }

    #[test]
    fn ordinary_failure_needs_no_removal() {
        let rt = FakeRuntime::returning(ContainerResult::failed(1, "boom"));
        let mut ctx = context(RunRequest::default());
        launch(
            &rt,
            &mut ctx,
            Stage::Pipeline,
            &StageEntry::new("lint", "default"),
            &compiled("lint"),
            &Settings::default(),
        )
        .unwrap_err();
        assert_eq!(rt.calls.borrow().len(), 1);
    }

    #[test]
    fn timeout_is_reported() {
        let rt = FakeRuntime::returning(ContainerResult {
            timed_out: true,
            ..ContainerResult::default()
        });
        let mut ctx = context(RunRequest::default());
        let err = launch(
            &rt,
            &mut ctx,
            Stage::Pipeline,
            &StageEntry::new("lint", "default"),
            &compiled("lint"),
            &Settings::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
