//! Example tool handlers wired into the `ToolExecutor` at startup. Real
//! skills registries are out of scope per spec §1 — these exist to give
//! the binary something to dispatch against.

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

use conduit_agent::brain::ToolSpec;
use conduit_agent::executor::ToolHandler;
use conduit_agent::tool_error::{ErrorKind, ToolError};

/// `ToolSpec`s for the handlers registered in `main.rs`, advertised to the
/// Brain alongside every request.
pub fn tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "echo".to_string(),
            description: "Echoes the given text back unmodified.".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"],
            }),
        },
        ToolSpec {
            name: "shell_exec".to_string(),
            description: "Runs a shell command and returns its combined stdout/stderr.".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": { "command": { "type": "string" } },
                "required": ["command"],
            }),
        },
    ]
}

/// Echoes its `text` input back, unmodified. Useful for exercising the
/// tool-call loop without any side effects.
pub struct EchoTool;

#[async_trait]
impl ToolHandler for EchoTool {
    fn handler_group(&self) -> &str {
        "echo"
    }

    async fn execute(&self, input: serde_json::Value, _session_key: &str) -> Result<String, ToolError> {
        let text = input.get("text").and_then(|v| v.as_str()).unwrap_or_default();
        Ok(text.to_string())
    }
}

/// Runs a single shell command with a hard timeout.
pub struct ShellExecTool {
    pub timeout_secs: u64,
}

impl Default for ShellExecTool {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

#[async_trait]
impl ToolHandler for ShellExecTool {
    fn handler_group(&self) -> &str {
        "shell"
    }

    async fn execute(&self, input: serde_json::Value, _session_key: &str) -> Result<String, ToolError> {
        let Some(cmd) = input.get("command").and_then(|v| v.as_str()) else {
            return Err(ToolError::new(
                "shell_exec",
                ErrorKind::Validation,
                "missing required field 'command'",
            ));
        };

        let run = Command::new("sh").arg("-c").arg(cmd).output();
        let output = match timeout(Duration::from_secs(self.timeout_secs), run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ToolError::new("shell_exec", ErrorKind::Permanent, e.to_string())),
            Err(_) => {
                return Err(ToolError::new(
                    "shell_exec",
                    ErrorKind::Timeout,
                    format!("command did not finish within {}s", self.timeout_secs),
                ))
            }
        };

        let mut rendered = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.stderr.is_empty() {
            rendered.push_str("\n[stderr]\n");
            rendered.push_str(&String::from_utf8_lossy(&output.stderr));
        }
        Ok(rendered)
    }
}
