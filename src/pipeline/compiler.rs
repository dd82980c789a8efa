//! Expanding a tool's phase templates into one flat command string.
//!
//! Phases are emitted in a fixed order: `pre`, `exec`, `report`, the
//! selected profile template, then `post` behind ` && `. Each template goes
//! through two passes:
//!
//! 1. `{name}` placeholders are replaced by the tool's `commands[name]`,
//!    recursively. `{timestamp}` is the compile instant in nanoseconds.
//! 2. Words containing `$NAME` take the value of the bound parameter
//!    `NAME`. Text around the reference is kept (`$LOC/src` -> `/app/src`).
//!
//! Anything that cannot be resolved is left in place and reported on the
//! returned [`CompiledCommand`].

use chrono::{DateTime, Utc};
use tracing::warn;

use super::params::BoundParameters;
use super::types::Stage;
use crate::config::{TokenPolicy, ToolDefinition};
use crate::error::{PipelineError, Result};

pub const TIMESTAMP_TOKEN: &str = "timestamp";

/// Placeholders nested deeper than this are treated as unresolved.
pub const MAX_TOKEN_DEPTH: usize = 8;

const LEADING_PHASES: [&str; 3] = ["pre", "exec", "report"];
const POST_PHASE: &str = "post";
const POST_SEPARATOR: &str = " && ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledCommand {
    pub command: String,
    /// `{token}` names that were left unexpanded.
    pub unresolved_tokens: Vec<String>,
    /// `$NAME` references with no bound parameter.
    pub unresolved_params: Vec<String>,
}

impl CompiledCommand {
    /// The command split on whitespace, as handed to the runtime.
    pub fn tokens(&self) -> Vec<String> {
        self.command.split_whitespace().map(String::from).collect()
    }
}

/// Compile using the current time for `{timestamp}`.
pub fn compile(
    stage: Stage,
    tool_name: &str,
    tool: &ToolDefinition,
    profile: &str,
    params: &BoundParameters,
    policy: TokenPolicy,
) -> Result<CompiledCommand> {
    compile_at(stage, tool_name, tool, profile, params, policy, Utc::now())
}

/// Compile with an explicit instant. Same inputs, same output.
pub fn compile_at(
    stage: Stage,
    tool_name: &str,
    tool: &ToolDefinition,
    profile: &str,
    params: &BoundParameters,
    policy: TokenPolicy,
    now: DateTime<Utc>,
) -> Result<CompiledCommand> {
    let template = tool
        .profiles
        .get(profile)
        .ok_or_else(|| PipelineError::UnknownToolProfile {
            stage,
            tool: tool_name.to_string(),
            profile: profile.to_string(),
        })?;

    let mut renderer = Renderer {
        tool,
        params,
        timestamp: timestamp(now),
        unresolved_tokens: Vec::new(),
        unresolved_params: Vec::new(),
    };

    let mut command = String::new();
    for phase in LEADING_PHASES {
        if let Some(text) = tool.command(phase) {
            command.push_str(&renderer.render(text));
            command.push(' ');
        }
    }
    command.push_str(&renderer.render(template));
    command.push(' ');
    if let Some(text) = tool.command(POST_PHASE) {
        command.push_str(POST_SEPARATOR);
        command.push_str(&renderer.render(text));
        command.push(' ');
    }

    let Renderer {
        unresolved_tokens,
        unresolved_params,
        ..
    } = renderer;

    if let Some(token) = unresolved_tokens.first() {
        if policy == TokenPolicy::Strict {
            return Err(PipelineError::UnresolvedToken {
                tool: tool_name.to_string(),
                token: token.clone(),
            });
        }
        for token in &unresolved_tokens {
            warn!("{tool_name}: no substitution for {{{token}}}, left as is");
        }
    }
    for name in &unresolved_params {
        warn!("{tool_name}: no parameter bound for ${name}, left as is");
    }

    Ok(CompiledCommand {
        command,
        unresolved_tokens,
        unresolved_params,
    })
}

fn timestamp(now: DateTime<Utc>) -> String {
    now.timestamp_nanos_opt()
        .map_or_else(|| now.timestamp().to_string(), |n| n.to_string())
}

struct Renderer<'a> {
    tool: &'a ToolDefinition,
    params: &'a BoundParameters,
    timestamp: String,
    unresolved_tokens: Vec<String>,
    unresolved_params: Vec<String>,
}

impl Renderer<'_> {
    fn render(&mut self, template: &str) -> String {
        let expanded = self.expand_tokens(template, 0);
        self.substitute_params(&expanded)
    }

    fn expand_tokens(&mut self, template: &str, depth: usize) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];

            // `${VAR}` belongs to the shell, not to us.
            let name = after.find('}').map(|close| &after[..close]);
            match name {
                Some(name) if is_token_name(name) && !out.ends_with('$') => {
                    match self.lookup(name, depth) {
                        Some(value) => out.push_str(&value),
                        None => {
                            out.push('{');
                            out.push_str(name);
                            out.push('}');
                            note(&mut self.unresolved_tokens, name);
                        }
                    }
                    rest = &after[name.len() + 1..];
                }
                _ => {
                    out.push('{');
                    rest = after;
                }
            }
        }

        out.push_str(rest);
        out
    }

    fn lookup(&mut self, name: &str, depth: usize) -> Option<String> {
        if name == TIMESTAMP_TOKEN {
            return Some(self.timestamp.clone());
        }
        if depth >= MAX_TOKEN_DEPTH {
            return None;
        }
        let tool = self.tool;
        let value = tool.commands.get(name)?;
        Some(self.expand_tokens(value, depth + 1))
    }

    fn substitute_params(&mut self, text: &str) -> String {
        text.split(' ')
            .map(|word| self.substitute_word(word))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn substitute_word(&mut self, word: &str) -> String {
        let mut out = String::with_capacity(word.len());
        let mut rest = word;

        while let Some(dollar) = rest.find('$') {
            out.push_str(&rest[..dollar]);
            let body = &rest[dollar + 1..];
            let end = body
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(body.len());
            let name = &body[..end];

            match self.params.get(name) {
                _ if name.is_empty() => out.push('$'),
                Some(value) => out.push_str(value),
                None => {
                    note(&mut self.unresolved_params, name);
                    out.push('$');
                    out.push_str(name);
                }
            }
            rest = &body[end..];
        }

        out.push_str(rest);
        out
    }
}

fn is_token_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn note(list: &mut Vec<String>, name: &str) {
    if !list.iter().any(|n| n == name) {
        list.push(name.to_string());
    }
}
