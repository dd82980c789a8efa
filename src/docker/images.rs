use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{debug, info};

use super::runtime::ContainerRuntime;
use super::types::ContainerCommand;
use crate::error::{PipelineError, Result};
use crate::logging::DetailedLog;

/// Add the implicit `:latest` tag so catalog references compare equal to
/// what `docker images` prints.
pub fn normalize_image(image: &str) -> String {
    let image = image.trim();
    if image.contains('@') {
        return image.to_string();
    }
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    if last_segment.contains(':') {
        image.to_string()
    } else {
        format!("{image}:latest")
    }
}

/// Parse `docker images --format {{.Repository}}:{{.Tag}}` output.
pub fn parse_image_list(stdout: &str) -> BTreeSet<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.contains("<none>"))
        .map(normalize_image)
        .collect()
}

/// Images in `needed` that are not in `available`, in sorted order.
pub fn missing_images(needed: &BTreeSet<String>, available: &BTreeSet<String>) -> Vec<String> {
    needed
        .iter()
        .filter(|image| !available.contains(&normalize_image(image)))
        .cloned()
        .collect()
}

/// Make sure every needed image is present locally, pulling what is missing.
/// Returns the images that were pulled.
pub fn sync_images<R>(
    runtime: &R,
    needed: &BTreeSet<String>,
    timeout: Duration,
    log: &mut DetailedLog,
) -> Result<Vec<String>>
where
    R: ContainerRuntime + ?Sized,
{
    info!("ensuring {} tool images are available", needed.len());

    let list = ContainerCommand::new(
        vec![
            "images".into(),
            "--format".into(),
            "{{.Repository}}:{{.Tag}}".into(),
        ],
        timeout,
    );
    let listing = runtime
        .execute(&list)
        .map_err(|e| sync_failure("<image list>", e.to_string()))?;
    log.record_result(&list.display(), &listing);
    if !listing.success {
        return Err(sync_failure("<image list>", listing.failure_reason()));
    }

    let available = parse_image_list(&listing.stdout);
    let missing = missing_images(needed, &available);
    if missing.is_empty() {
        info!("no images to pull");
        return Ok(missing);
    }

    for image in &missing {
        info!("pulling image {image}; this may take a while");
        let pull = ContainerCommand::new(vec!["pull".into(), image.clone()], timeout);
        let result = runtime
            .execute(&pull)
            .map_err(|e| sync_failure(image, e.to_string()))?;
        log.record_result(&pull.display(), &result);
        if !result.success {
            return Err(sync_failure(image, result.failure_reason()));
        }
        debug!("pulled {image}");
    }

    info!("pulled {} missing images", missing.len());
    Ok(missing)
}

fn sync_failure(image: &str, reason: String) -> PipelineError {
    PipelineError::ImageSyncFailure {
        image: image.to_string(),
        reason,
    }
}
