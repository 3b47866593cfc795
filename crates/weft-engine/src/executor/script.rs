use std::io::ErrorKind;
use std::process::Stdio;

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::traits::{ScriptOutput, ScriptRunner};

/// Runs SCRIPT steps as child processes.
///
/// The step input is written to stdin as JSON. The child is killed if the
/// run future is dropped, which is how step timeouts stop a script.
#[derive(Debug, Clone, Default)]
pub struct ProcessScriptRunner {
    interpreter: Option<String>,
}

impl ProcessScriptRunner {
    /// `interpreter` (e.g. `bash`) is invoked with the script path as its
    /// first argument; without one the path is executed directly.
    pub fn new(interpreter: Option<String>) -> Self {
        Self { interpreter }
    }
}

impl ScriptRunner for ProcessScriptRunner {
    fn run(
        &self,
        path: &str,
        args: &[String],
        input: serde_json::Value,
    ) -> BoxFuture<'_, Result<ScriptOutput>> {
        let path = path.to_string();
        let args = args.to_vec();
        let input_bytes = serde_json::to_vec(&input).unwrap_or_default();

        Box::pin(async move {
            let mut cmd = match &self.interpreter {
                Some(interpreter) => {
                    let mut c = tokio::process::Command::new(interpreter);
                    c.arg(&path);
                    c
                }
                None => tokio::process::Command::new(&path),
            };
            cmd.args(&args);

            debug!(path = %path, interpreter = ?self.interpreter, "Launching script");
            let output = run_child(cmd, &path, input_bytes).await?;
            debug!(path = %path, exit_code = output.exit_code, "Script finished");
            Ok(output)
        })
    }
}

/// Spawn `cmd` with piped stdio, feed `input` on stdin, and collect its
/// output. The child is killed if the returned future is dropped.
pub(crate) async fn run_child(
    mut cmd: tokio::process::Command,
    label: &str,
    input: Vec<u8>,
) -> Result<ScriptOutput> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => WeftError::Script {
            path: label.to_string(),
            code: -1,
            stderr: format!("script not found or not executable: {}", e),
        },
        _ => WeftError::Io(e),
    })?;

    // Feed stdin from its own task so a child that writes before
    // reading cannot deadlock against us.
    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            stdin.write_all(&input).await.ok();
        });
    }

    let output = child.wait_with_output().await?;
    Ok(ScriptOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}
