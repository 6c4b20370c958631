use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use log::debug;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::PlaygroundError;

/// Captured result of a finished child process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    /// Best diagnostic text: stderr if it has anything, else stdout, else the
    /// exit code.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match self.exit_code {
            Some(code) => format!("process exited with code {}", code),
            None => "process terminated by signal".to_string(),
        }
    }
}

/// Runs `cmd` to completion, optionally feeding `stdin`, bounded by
/// `timeout`. The child is killed if the timeout elapses.
pub async fn run_process(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    what: &str,
) -> Result<ProcessOutput, PlaygroundError> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            PlaygroundError::ExecutionError(format!("{} not found. Is it installed and on PATH?", program))
        } else {
            PlaygroundError::ExecutionError(format!("Failed to spawn {}: {}", program, e))
        }
    })?;

    let input = stdin.map(|bytes| bytes.to_vec());
    let pipe = child.stdin.take();

    let completion = async move {
        if let (Some(input), Some(mut pipe)) = (input, pipe) {
            // The child may exit without reading everything
            if let Err(e) = pipe.write_all(&input).await {
                if e.kind() != ErrorKind::BrokenPipe {
                    return Err(e);
                }
            }
            drop(pipe);
        }
        child.wait_with_output().await
    };

    let output = tokio::time::timeout(timeout, completion)
        .await
        .map_err(|_| {
            PlaygroundError::Timeout(format!("{} exceeded {}ms", what, timeout.as_millis()))
        })??;

    debug!("{} finished with {:?}", what, output.status);

    Ok(ProcessOutput {
        success: output.status.success(),
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_stdout_and_stdin() {
        let cmd = Command::new("cat");
        let output = run_process(cmd, Some(b"hello\nworld\n"), Duration::from_secs(5), "cat")
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(output.stdout, "hello\nworld\n");
    }

    #[tokio::test]
    async fn test_failure_keeps_stderr() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo broken >&2; exit 3");
        let output = run_process(cmd, None, Duration::from_secs(5), "sh").await.unwrap();
        assert!(!output.success);
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.diagnostic(), "broken");
    }

    #[tokio::test]
    async fn test_timeout() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let err = run_process(cmd, None, Duration::from_millis(100), "sleep")
            .await
            .unwrap_err();
        match err {
            PlaygroundError::Timeout(msg) => assert_eq!(msg, "sleep exceeded 100ms"),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program() {
        let cmd = Command::new("definitely-not-a-real-program-7f3a");
        let err = run_process(cmd, None, Duration::from_secs(1), "missing")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"), "{}", err);
    }

    #[test]
    fn test_diagnostic_fallbacks() {
        let out = ProcessOutput {
            success: false,
            exit_code: Some(1),
            stdout: "  Program.cs(3,5): error CS1002: ; expected\n".into(),
            stderr: "   ".into(),
        };
        assert_eq!(out.diagnostic(), "Program.cs(3,5): error CS1002: ; expected");

        let empty = ProcessOutput {
            exit_code: Some(2),
            ..ProcessOutput::default()
        };
        assert_eq!(empty.diagnostic(), "process exited with code 2");
    }
}
