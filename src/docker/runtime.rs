use anyhow::Result;
use tracing::trace;

use super::run::spawn;
use super::types::{ContainerCommand, ContainerResult, OutputLine};

/// The seam between the pipeline and the container engine.
///
/// Every runtime call the pipeline makes (image listing, pulls, volume
/// creation, tool containers) goes through `execute`, so tests can swap in
/// a recording fake.
pub trait ContainerRuntime {
    /// Run one invocation to completion. `Err` means it could not be
    /// started at all; a non-zero exit comes back as an unsuccessful result.
    fn execute(&self, cmd: &ContainerCommand) -> Result<ContainerResult>;
}

/// Drives a docker-compatible CLI as a subprocess.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl ContainerRuntime for DockerCli {
    fn execute(&self, cmd: &ContainerCommand) -> Result<ContainerResult> {
        let rx = spawn(&self.binary, cmd.clone())?;

        for line in rx {
            match line {
                OutputLine::Stdout(s) => trace!(target: "secpipe::container", "{s}"),
                OutputLine::Stderr(s) => trace!(target: "secpipe::container", "stderr: {s}"),
                OutputLine::Done(result) => return Ok(result),
            }
        }

        anyhow::bail!("`{}` exited without reporting a result", self.binary)
    }
}
