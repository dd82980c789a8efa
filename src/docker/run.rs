use std::io::BufRead;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use super::types::{ContainerCommand, ContainerResult, OutputLine};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Spawn the runtime binary and return a channel that streams its output.
///
/// The caller receives [`OutputLine::Stdout`]/[`Stderr`] as they arrive,
/// followed by exactly one [`OutputLine::Done`] carrying the final result.
/// The child is killed once `cmd.timeout` elapses.
pub fn spawn(binary: &str, cmd: ContainerCommand) -> Result<Receiver<OutputLine>> {
    let mut child = Command::new(binary)
        .args(&cmd.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn `{binary}`"))?;

    let stdout = child.stdout.take().context("child stdout was not piped")?;
    let stderr = child.stderr.take().context("child stderr was not piped")?;

    let (tx, rx) = mpsc::channel();

    std::thread::spawn(move || {
        orchestrate(child, stdout, stderr, tx, cmd.timeout);
    });

    Ok(rx)
}

/// Read one stream line by line into `buf`, forwarding each line.
///
/// Bytes that are not valid UTF-8 are replaced rather than ending the read,
/// so the pipe is always drained to EOF.
fn pump<R, F>(reader: R, tx: Sender<OutputLine>, wrap: F) -> std::thread::JoinHandle<String>
where
    R: std::io::Read + Send + 'static,
    F: Fn(String) -> OutputLine + Send + 'static,
{
    std::thread::spawn(move || {
        let mut reader = std::io::BufReader::new(reader);
        let mut buf = String::new();
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw) {
                Ok(0) => break,
                Ok(_) => {
                    if raw.last() == Some(&b'\n') {
                        raw.pop();
                    }
                    if raw.last() == Some(&b'\r') {
                        raw.pop();
                    }
                    let line = String::from_utf8_lossy(&raw).into_owned();
                    buf.push_str(&line);
                    buf.push('\n');
                    // Receiver may be dropped; ignore send errors.
                    let _ = tx.send(wrap(line));
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    let _ = std::io::copy(&mut reader, &mut std::io::sink());
                    break;
                }
            }
        }
        buf
    })
}

fn orchestrate(
    mut child: std::process::Child,
    stdout: std::process::ChildStdout,
    stderr: std::process::ChildStderr,
    tx: Sender<OutputLine>,
    timeout: Duration,
) {
    let stdout_handle = pump(stdout, tx.clone(), OutputLine::Stdout);
    let stderr_handle = pump(stderr, tx.clone(), OutputLine::Stderr);

    // --- poll loop ---------------------------------------------------------
    let start = Instant::now();
    let mut timed_out = false;

    let exit_status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {}
            Err(_) => break None,
        }

        if start.elapsed() > timeout {
            timed_out = true;
            let _ = child.kill();
            let _ = child.wait();
            break None;
        }

        std::thread::sleep(POLL_INTERVAL);
    };

    // --- finalize ----------------------------------------------------------
    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();

    let exit_code = exit_status.and_then(|s| s.code());

    let _ = tx.send(OutputLine::Done(ContainerResult {
        success: exit_code == Some(0),
        exit_code,
        stdout,
        stderr,
        timed_out,
    }));
}
