use std::time::Duration;

/// Describes a single runtime invocation. `args` is the full argument list
/// passed to the runtime binary (callers assemble it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerCommand {
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl ContainerCommand {
    pub fn new(args: Vec<String>, timeout: Duration) -> Self {
        Self { args, timeout }
    }

    /// Shell-quoted rendering for logs, e.g. `run -v data_x:/opt/... img`.
    pub fn display(&self) -> String {
        shell_words::join(&self.args)
    }
}

/// Outcome of a runtime invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ContainerResult {
    /// A successful result with the given stdout; handy for fakes.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: Some(exit_code),
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    /// Best single-line explanation of a failure for error messages.
    pub fn failure_reason(&self) -> String {
        if self.timed_out {
            return "timed out".to_string();
        }
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match self.exit_code {
            Some(code) => format!("exit {code}"),
            None => "terminated without an exit status".to_string(),
        }
    }
}

/// Streamed output from a running invocation.
#[derive(Debug)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
    Done(ContainerResult),
}
