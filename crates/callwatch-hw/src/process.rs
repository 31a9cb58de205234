//! External command execution with a hard timeout.
//!
//! Every desktop tool (hyprctl, grim, osascript, screencapture) goes through
//! [`run_with_timeout`], so a hung compositor can never stall the loop.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("{program}: {source}")]
    Io {
        program: String,
        source: std::io::Error,
    },
}

/// Run `program` with `args`, returning its stdout.
///
/// The child is killed if it outlives `timeout`. Stdout and stderr are drained
/// on helper threads so a large payload (a PNG on stdout) cannot fill the
/// pipe and wedge the child.
pub fn run_with_timeout(program: &str, args: &[&str], timeout: Duration) -> Result<Vec<u8>, CommandError> {
    let io_err = |source| CommandError::Io {
        program: program.to_string(),
        source,
    };

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| CommandError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if started.elapsed() >= timeout => {
                let _ = child.kill();
                let _ = child.wait();
                tracing::debug!(program, ?timeout, "command killed after timeout");
                return Err(CommandError::Timeout {
                    program: program.to_string(),
                    timeout,
                });
            }
            Ok(None) => std::thread::sleep(POLL_INTERVAL),
            Err(e) => {
                let _ = child.kill();
                return Err(io_err(e));
            }
        }
    };

    let stdout = join(stdout).map_err(io_err)?;
    let stderr = join(stderr).map_err(io_err)?;

    if !status.success() {
        return Err(CommandError::Failed {
            program: program.to_string(),
            status,
            stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
        });
    }
    Ok(stdout)
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> std::thread::JoinHandle<std::io::Result<Vec<u8>>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf)?;
        Ok(buf)
    })
}

fn join(handle: Option<std::thread::JoinHandle<std::io::Result<Vec<u8>>>>) -> std::io::Result<Vec<u8>> {
    match handle {
        Some(h) => h
            .join()
            .unwrap_or_else(|_| Err(std::io::Error::other("pipe reader panicked"))),
        None => Ok(Vec::new()),
    }
}
