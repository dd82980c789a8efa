use tracing::{debug, info};

use super::types::{MountSource, RunContext, StorageStrategy};
use crate::config::Settings;
use crate::docker::{ContainerCommand, ContainerRuntime};
use crate::error::{PipelineError, Result};

/// Decide where the run's shared data lives and get it ready.
///
/// An external path is used as is. Otherwise a `data_<run_id>` volume is
/// created and handed to the service user with a one-shot helper
/// container. A dry run plans the volume without touching the runtime.
pub fn prepare_storage<R>(ctx: &mut RunContext, runtime: &R, settings: &Settings) -> Result<MountSource>
where
    R: ContainerRuntime + ?Sized,
{
    if let StorageStrategy::External(path) = &ctx.request.storage {
        info!("using external path {} for run data", path.display());
        let mount = MountSource::HostPath(path.clone());
        ctx.mount = Some(mount.clone());
        return Ok(mount);
    }

    let volume = ctx.volume_name();
    let mount = MountSource::Volume(volume.clone());
    ctx.mount = Some(mount.clone());

    let create = ContainerCommand::new(
        vec!["volume".into(), "create".into(), volume.clone()],
        settings.timeout(),
    );
    let chown = permission_fix(ctx, settings);

    if ctx.request.dry_run {
        info!("[dry run] would create volume {volume}");
        ctx.log.record(&format!("[dry run] {}", create.display()), "");
        ctx.log.record(&format!("[dry run] {}", chown.display()), "");
        return Ok(mount);
    }

    info!("creating volume {volume}");
    let result = runtime
        .execute(&create)
        .map_err(|e| create_failure(&volume, e.to_string()))?;
    ctx.log.record_result(&create.display(), &result);
    if !result.success {
        return Err(create_failure(&volume, result.failure_reason()));
    }
    ctx.volume = Some(volume.clone());

    debug!("setting ownership of {volume} to {}", settings.service_user);
    let result = runtime
        .execute(&chown)
        .map_err(|e| chown_failure(&volume, e.to_string()))?;
    ctx.log.record_result(&chown.display(), &result);
    if !result.success {
        return Err(chown_failure(&volume, result.failure_reason()));
    }

    Ok(mount)
}

fn permission_fix(ctx: &RunContext, settings: &Settings) -> ContainerCommand {
    let root = settings.mount_root();
    ContainerCommand::new(
        vec![
            "run".into(),
            "-v".into(),
            format!("{}:{root}/", ctx.volume_name()),
            "--name".into(),
            format!("set-perms_{}", ctx.run_id),
            "--user=root".into(),
            "--rm".into(),
            "--entrypoint".into(),
            "chown".into(),
            settings.helper_image.clone(),
            "-R".into(),
            settings.service_user.clone(),
            root.to_string(),
        ],
        settings.timeout(),
    )
}

fn create_failure(volume: &str, reason: String) -> PipelineError {
    PipelineError::VolumeCreateFailure {
        volume: volume.to_string(),
        reason,
    }
}

fn chown_failure(volume: &str, reason: String) -> PipelineError {
    PipelineError::PermissionFixFailure {
        volume: volume.to_string(),
        reason,
    }
}
