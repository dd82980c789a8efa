use std::process::{Command, Stdio};

use crate::error::{PipelineError, Result};

/// Verify that the runtime binary exists and its daemon answers.
pub fn ensure_available(binary: &str) -> Result<()> {
    let status = Command::new(binary)
        .args(["version", "--format", "{{.Server.Version}}"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| {
            PipelineError::DependencyMissing(format!(
                "failed to invoke `{binary}` ({e}); is it installed and on PATH?"
            ))
        })?;

    if !status.success() {
        return Err(PipelineError::DependencyMissing(format!(
            "`{binary}` daemon is not running ({status})"
        )));
    }
    Ok(())
}
