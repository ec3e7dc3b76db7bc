// runner.rs — Subprocess seam for the nft binary.
//
// The adapter never shells out directly; it goes through NftRunner so the
// test suite can script every interaction. SystemRunner is the production
// implementation, classifying process failures into the adapter error
// taxonomy.

use std::io::Write;
use std::process::{Command, Stdio};

use aegis_backend::AdapterError;

/// Captured result of one nft invocation.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub status_ok: bool,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status_ok: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            status_ok: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Runs nft commands. Implemented by SystemRunner in production and by
/// scripted fakes in tests.
pub trait NftRunner: Send + Sync {
    /// Run `nft <args>`, feeding `stdin` to the process when given.
    fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<RunOutput, AdapterError>;
}

/// Production runner invoking the real `nft` binary.
#[derive(Debug, Default)]
pub struct SystemRunner;

impl NftRunner for SystemRunner {
    fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<RunOutput, AdapterError> {
        let mut command = Command::new("nft");
        command
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(classify_spawn_error)?;

        if let Some(input) = stdin {
            // Take stdin so the pipe closes when we are done writing.
            let mut pipe = child
                .stdin
                .take()
                .ok_or_else(|| AdapterError::System("could not open nft stdin".to_string()))?;
            pipe.write_all(input.as_bytes())
                .map_err(|e| AdapterError::System(format!("writing to nft stdin: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| AdapterError::System(format!("waiting for nft: {}", e)))?;

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            tracing::debug!(args = ?args, %stderr, "nft invocation failed");
        }
        Ok(RunOutput {
            status_ok: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
        })
    }
}

fn classify_spawn_error(err: std::io::Error) -> AdapterError {
    match err.kind() {
        std::io::ErrorKind::NotFound => {
            AdapterError::Unavailable("nft binary not found".to_string())
        }
        std::io::ErrorKind::PermissionDenied => {
            AdapterError::Permission("cannot execute nft".to_string())
        }
        _ => AdapterError::System(format!("spawning nft: {}", err)),
    }
}

/// Map a failed invocation's stderr to the error taxonomy.
pub(crate) fn classify_failure(stderr: &str) -> AdapterError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("operation not permitted") || lower.contains("permission denied") {
        AdapterError::Permission(stderr.trim().to_string())
    } else if lower.contains("resource temporarily unavailable") || lower.contains("device or resource busy")
    {
        AdapterError::Transient(stderr.trim().to_string())
    } else if lower.contains("syntax error") || lower.contains("unexpected") || lower.contains("invalid")
    {
        AdapterError::Syntax(stderr.trim().to_string())
    } else {
        AdapterError::System(stderr.trim().to_string())
    }
}
