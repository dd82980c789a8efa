use std::collections::BTreeMap;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::compiler;
use super::params::{self, RawParameter};
use super::types::{ResolvedTool, RunContext, RunRequest, Stage};
use crate::config::{Catalogs, TokenPolicy};
use crate::error::{PipelineError, Result};
use crate::logging::DetailedLog;

/// Validate `request` against the catalogs and build the run's context.
///
/// Either every stage entry resolves or nothing does; no container is
/// touched here. Under [`TokenPolicy::Strict`] each entry is also
/// test-compiled so unresolvable `{tokens}` fail now rather than mid-run.
pub fn resolve(request: RunRequest, catalogs: &Catalogs, policy: TokenPolicy) -> Result<RunContext> {
    if request.profile.trim().is_empty() {
        return Err(PipelineError::MissingField("profile"));
    }
    if request.app_name.trim().is_empty() {
        return Err(PipelineError::MissingField("app-name"));
    }

    let profile = catalogs
        .pipelines
        .get(&request.profile)
        .ok_or_else(|| PipelineError::UnknownProfile(request.profile.clone()))?;

    if profile.pipeline.is_empty() {
        return Err(PipelineError::EmptyPipeline(request.profile.clone()));
    }

    let mut stages = profile.clone();
    let mut overridden = 0usize;
    let mut order: Vec<&str> = Vec::new();

    for stage in Stage::ALL {
        for entry in stages.entries_mut(stage) {
            let tool = catalogs
                .tools
                .get(&entry.tool)
                .ok_or_else(|| PipelineError::UnknownTool {
                    stage,
                    tool: entry.tool.clone(),
                })?;

            if let Some(name) = request.tool_profile.as_deref()
                && tool.has_profile(name)
                && entry.tool_profile != name
            {
                debug!(
                    "{stage}: {} profile {} -> {name} (override)",
                    entry.tool, entry.tool_profile
                );
                entry.tool_profile = name.to_string();
                overridden += 1;
            }

            if !tool.has_profile(&entry.tool_profile) {
                return Err(PipelineError::UnknownToolProfile {
                    stage,
                    tool: entry.tool.clone(),
                    profile: entry.tool_profile.clone(),
                });
            }
            debug!("{stage}: {} with profile {}", entry.tool, entry.tool_profile);
        }
    }

    if let Some(name) = request.tool_profile.as_deref()
        && overridden == 0
    {
        warn!("tool profile override `{name}` matched no stage entry");
    }

    for stage in Stage::ALL {
        for entry in profile.entries(stage) {
            if !order.contains(&entry.tool.as_str()) {
                order.push(&entry.tool);
            }
        }
    }

    let raw = params::parse_raw(&request.params)?;
    let mut tools = BTreeMap::new();
    for name in &order {
        let definition = &catalogs.tools[*name];
        let bound = params::bind(name, &definition.parameters, &raw)?;
        debug!("{name}: bound parameters [{bound}]");
        tools.insert(
            name.to_string(),
            ResolvedTool {
                definition: definition.clone(),
                params: bound,
            },
        );
    }
    warn_unused(&raw, &tools);

    if policy == TokenPolicy::Strict {
        for stage in Stage::ALL {
            for entry in stages.entries(stage) {
                let tool = &tools[&entry.tool];
                compiler::compile(
                    stage,
                    &entry.tool,
                    &tool.definition,
                    &entry.tool_profile,
                    &tool.params,
                    policy,
                )?;
            }
        }
    }

    info!(
        "resolved profile `{}` for `{}`: {} startup, {} pipeline, {} final, {} runevery entries",
        request.profile,
        request.app_name,
        stages.startup.len(),
        stages.pipeline.len(),
        stages.final_stage.len(),
        stages.run_every.len(),
    );

    Ok(RunContext {
        run_id: Uuid::new_v4(),
        request,
        stages,
        tools,
        mount: None,
        volume: None,
        launched: Vec::new(),
        log: DetailedLog::discard(),
    })
}

fn warn_unused(raw: &[RawParameter], tools: &BTreeMap<String, ResolvedTool>) {
    for param in raw {
        let used = tools
            .values()
            .any(|t| t.definition.parameters.contains_key(&param.name));
        if !used {
            warn!("parameter `{}` is not declared by any tool in this run", param.name);
        }
    }
}
