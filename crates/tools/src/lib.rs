//! Tool executor for termpilot.
//!
//! The model has a single tool, `shell`. A call runs a command in the
//! working directory, or applies a patch when the command is
//! `["apply_patch", "<patch>"]`. Whether the user is asked first depends on
//! the approval policy.

pub mod approval;
pub mod args;
pub mod exec;
pub mod handler;
pub mod patch;

use termpilot_core::ToolDefinition;

pub use approval::{CommandKind, SafetyAssessment, assess_command_safety, classify_command};
pub use args::{ExecInput, parse_exec_arguments};
pub use handler::{DENIED_OUTPUT, ExecOutcome, ExecSession, handle_exec_command};
pub use patch::{apply_patch, parse_patch};

/// Function names the model may use for the shell tool.
pub const SHELL_TOOL_NAMES: [&str; 2] = ["shell", "container.exec"];

/// The definition of the `shell` tool sent with every request.
pub fn shell_tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: "shell".into(),
        description: "Runs a shell command, and returns its output.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "cmd": {
                    "type": "array",
                    "items": { "type": "string" }
                },
                "workdir": {
                    "type": "string",
                    "description": "The working directory for the command."
                },
                "timeout": {
                    "type": "number",
                    "description": "The maximum time to wait for the command to complete in milliseconds."
                }
            },
            "required": ["cmd"],
            "additionalProperties": false
        }),
    }
}
