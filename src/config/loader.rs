use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::types::{Catalogs, PipelineProfile, Settings, ToolDefinition};
use crate::error::{PipelineError, Result};
use crate::pipeline::Stage;

pub const SETTINGS_FILE: &str = "secpipe.yaml";

/// Load `secpipe.yaml` from the given directory, or defaults if absent.
pub fn load_settings(dir: &Path) -> anyhow::Result<Settings> {
    let path = dir.join(SETTINGS_FILE);
    if !path.exists() {
        debug!("no {} in {}, using defaults", SETTINGS_FILE, dir.display());
        return Ok(Settings::default());
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let settings: Settings = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(settings)
}

/// Verify that both catalog files exist before anything else happens.
pub fn check_catalog_files(dir: &Path, settings: &Settings) -> Result<()> {
    for name in [&settings.pipeline_catalog, &settings.tool_catalog] {
        let path = dir.join(name);
        if !path.is_file() {
            return Err(PipelineError::DependencyMissing(format!(
                "catalog file {} not found",
                path.display()
            )));
        }
    }
    Ok(())
}

/// Load and validate both catalogs, applying `<app>-pipeline.yaml` and
/// `<app>-tool.yaml` overlays from the same directory when present.
pub fn load_catalogs(dir: &Path, settings: &Settings, app_name: Option<&str>) -> Result<Catalogs> {
    let pipeline_path = dir.join(&settings.pipeline_catalog);
    let tool_path = dir.join(&settings.tool_catalog);

    let mut pipelines: BTreeMap<String, PipelineProfile> = read_catalog(&pipeline_path)?;
    let mut tools: BTreeMap<String, ToolDefinition> = read_catalog(&tool_path)?;

    if let Some(app) = app_name.map(str::trim).filter(|a| !a.is_empty()) {
        let overlay = dir.join(format!("{app}-pipeline.yaml"));
        if overlay.is_file() {
            let extra: BTreeMap<String, PipelineProfile> = read_catalog(&overlay)?;
            info!("applying {} pipeline overrides from {}", extra.len(), overlay.display());
            pipelines.extend(extra);
        }
        let overlay = dir.join(format!("{app}-tool.yaml"));
        if overlay.is_file() {
            let extra: BTreeMap<String, ToolDefinition> = read_catalog(&overlay)?;
            info!("applying {} tool overrides from {}", extra.len(), overlay.display());
            tools.extend(extra);
        }
    }

    validate_tools(&tool_path, &tools)?;
    validate_pipelines(&pipeline_path, &pipelines)?;

    debug!(
        "loaded {} pipeline profiles and {} tools",
        pipelines.len(),
        tools.len()
    );
    Ok(Catalogs { pipelines, tools })
}

fn read_catalog<T: DeserializeOwned>(path: &Path) -> Result<BTreeMap<String, T>> {
    let contents = std::fs::read_to_string(path).map_err(|e| invalid(path, e.to_string()))?;
    if contents.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_yaml::from_str(&contents).map_err(|e| invalid(path, e.to_string()))
}

fn validate_tools(path: &Path, tools: &BTreeMap<String, ToolDefinition>) -> Result<()> {
    for (name, tool) in tools {
        if name.trim().is_empty() {
            return Err(invalid(path, "tool with a blank name".to_string()));
        }
        if tool.image.trim().is_empty() {
            return Err(invalid(path, format!("tool `{name}` has no image")));
        }
        if tool.profiles.is_empty() {
            return Err(invalid(path, format!("tool `{name}` declares no profiles")));
        }
    }
    Ok(())
}

fn validate_pipelines(path: &Path, pipelines: &BTreeMap<String, PipelineProfile>) -> Result<()> {
    for (name, profile) in pipelines {
        for stage in Stage::ALL {
            for entry in profile.entries(stage) {
                if entry.tool.trim().is_empty() || entry.tool_profile.trim().is_empty() {
                    return Err(invalid(
                        path,
                        format!("profile `{name}` has a blank entry in its {stage} stage"),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn invalid(path: &Path, reason: String) -> PipelineError {
    PipelineError::CatalogInvalid {
        path: PathBuf::from(path),
        reason,
    }
}
