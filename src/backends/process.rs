//! Local runtimes driven as child processes.
//!
//! Two shapes are supported: a long-lived child that answers one JSON object
//! per line on stdout for every JSON request line on stdin, and a one-shot
//! command that takes its input on stdin and exits.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::error::BackendError;

/// A persistent child speaking newline-delimited JSON.
///
/// Any failed exchange leaves the stream out of sync (a late reply may still
/// be in the pipe), so every later request fails until the child is replaced.
pub struct JsonLineProcess {
    name: String,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    in_sync: bool,
}

impl JsonLineProcess {
    pub fn spawn(
        executable: &str,
        args: &[String],
        envs: &[(String, String)],
    ) -> Result<Self, BackendError> {
        let mut child = Command::new(executable)
            .args(args)
            .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::RequestFailed {
                backend: executable.to_string(),
                reason: format!("failed to start: {e}"),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| BackendError::RequestFailed {
            backend: executable.to_string(),
            reason: "stdin not captured".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| BackendError::RequestFailed {
            backend: executable.to_string(),
            reason: "stdout not captured".into(),
        })?;

        tracing::debug!(executable, pid = ?child.id(), "Runtime process started");
        Ok(Self {
            name: executable.to_string(),
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            in_sync: true,
        })
    }

    /// Send one request and wait for one response line.
    pub async fn request<Req, Resp>(
        &mut self,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp, BackendError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        if !self.in_sync {
            return Err(BackendError::RequestFailed {
                backend: self.name.clone(),
                reason: "process out of sync after an earlier failed request".into(),
            });
        }
        let mut line = serde_json::to_string(request)?;
        line.push('\n');

        let Self {
            name,
            stdin,
            stdout,
            in_sync,
            ..
        } = self;
        *in_sync = false;
        let exchange = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await?;
            stdout.next_line().await
        };

        let reply = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| BackendError::Timeout {
                backend: name.clone(),
                timeout,
            })??;

        let reply = reply.ok_or_else(|| BackendError::InvalidResponse {
            backend: name.clone(),
            reason: "process closed its output".into(),
        })?;

        let parsed = serde_json::from_str(&reply).map_err(|e| BackendError::InvalidResponse {
            backend: name.clone(),
            reason: format!("{e}: {reply}"),
        })?;
        *in_sync = true;
        Ok(parsed)
    }

    /// False once a request has failed; the child must be restarted.
    pub fn is_in_sync(&self) -> bool {
        self.in_sync
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Close stdin and give the child a moment to exit before killing it.
    pub async fn shutdown(mut self) {
        drop(self.stdin);
        if tokio::time::timeout(Duration::from_secs(2), self.child.wait())
            .await
            .is_err()
        {
            let _ = self.child.kill().await;
        }
        tracing::debug!(executable = %self.name, "Runtime process stopped");
    }
}

/// Run a command to completion, feeding `input` on stdin.
pub async fn run_once(
    executable: &str,
    args: &[String],
    envs: &[(String, String)],
    input: &[u8],
    timeout: Duration,
) -> Result<(), BackendError> {
    let mut child = Command::new(executable)
        .args(args)
        .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BackendError::RequestFailed {
            backend: executable.to_string(),
            reason: format!("failed to start: {e}"),
        })?;

    let stdin = child.stdin.take();
    let exchange = async move {
        if let Some(mut stdin) = stdin {
            stdin.write_all(input).await?;
            stdin.shutdown().await?;
        }
        child.wait_with_output().await
    };

    let output = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| BackendError::Timeout {
            backend: executable.to_string(),
            timeout,
        })??;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(BackendError::RequestFailed {
            backend: executable.to_string(),
            reason: format!("exited with {}: {}", output.status, stderr.trim()),
        })
    }
}

/// `--flag value` pair for a path argument.
pub(crate) fn path_arg(flag: &str, path: &Path) -> [String; 2] {
    [flag.to_string(), path.display().to_string()]
}
