//! Binding user supplied `NAME=value` tokens to a tool's declared parameters.

use std::collections::BTreeMap;
use std::fmt;

use crate::config::ParameterSpec;
use crate::error::{PipelineError, Result};

/// A user supplied `NAME=value` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawParameter {
    pub name: String,
    pub value: String,
}

/// Split the raw parameter string with shell quoting rules, so values may
/// contain spaces when quoted: `MSG='two words' DEPTH=3`.
pub fn parse_raw(raw: &str) -> Result<Vec<RawParameter>> {
    let words =
        shell_words::split(raw).map_err(|_| PipelineError::MalformedParameter(raw.to_string()))?;

    words
        .into_iter()
        .map(|word| match word.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => Ok(RawParameter {
                name: name.trim().to_string(),
                value: value.to_string(),
            }),
            _ => Err(PipelineError::MalformedParameter(word)),
        })
        .collect()
}

/// Parameters matched to one tool, in first-match order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundParameters {
    entries: Vec<(String, String)>,
}

impl BoundParameters {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, name: &str, value: &str) {
        if !self.contains(name) {
            self.entries.push((name.to_string(), value.to_string()));
        }
    }
}

impl fmt::Display for BoundParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words: Vec<String> = self.iter().map(|(n, v)| format!("{n}={v}")).collect();
        f.write_str(&shell_words::join(words))
    }
}

/// Match raw parameters to the names `tool` declares.
///
/// Names match exactly. The first occurrence of a name wins. Declared
/// defaults fill anything the user left out; a required parameter with no
/// value and no default is an error. Raw parameters the tool does not
/// declare are ignored here.
pub fn bind(
    tool: &str,
    declared: &BTreeMap<String, ParameterSpec>,
    raw: &[RawParameter],
) -> Result<BoundParameters> {
    let mut bound = BoundParameters::default();

    for param in raw {
        let Some(spec) = declared.get(&param.name) else {
            continue;
        };
        if bound.contains(&param.name) {
            continue;
        }
        check_type(tool, &param.name, spec, &param.value)?;
        bound.push(&param.name, &param.value);
    }

    for (name, spec) in declared {
        if bound.contains(name) {
            continue;
        }
        match &spec.default {
            Some(default) => {
                check_type(tool, name, spec, default)?;
                bound.push(name, default);
            }
            None if spec.required => {
                return Err(PipelineError::MissingParameter {
                    tool: tool.to_string(),
                    name: name.clone(),
                });
            }
            None => {}
        }
    }

    Ok(bound)
}

fn check_type(tool: &str, name: &str, spec: &ParameterSpec, value: &str) -> Result<()> {
    if spec.kind.accepts(value) {
        Ok(())
    } else {
        Err(PipelineError::InvalidParameter {
            tool: tool.to_string(),
            name: name.to_string(),
            expected: spec.kind.as_str(),
            value: value.to_string(),
        })
    }
}
