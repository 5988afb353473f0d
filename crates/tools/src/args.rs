//! Arguments of a `shell` function call.

use serde::Deserialize;
use serde_json::Value;
use termpilot_core::ApplyPatchCommand;

/// A parsed `shell` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecInput {
    pub cmd: Vec<String>,
    pub workdir: Option<String>,
    /// Milliseconds; `None` uses the configured default.
    pub timeout_ms: Option<u64>,
}

impl ExecInput {
    pub fn new(cmd: Vec<String>) -> Self {
        Self {
            cmd,
            workdir: None,
            timeout_ms: None,
        }
    }

    /// `["apply_patch", "<patch>"]` is a patch, not a process.
    pub fn apply_patch(&self) -> Option<ApplyPatchCommand> {
        match self.cmd.as_slice() {
            [program, patch] if program == "apply_patch" => Some(ApplyPatchCommand {
                patch: patch.clone(),
            }),
            _ => None,
        }
    }

    /// The command as one line, for display and logs.
    pub fn display(&self) -> String {
        match self.cmd.as_slice() {
            [shell, flag, script] if shell == "bash" && flag == "-lc" => script.clone(),
            _ => self.cmd.join(" "),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CommandArg {
    Argv(Vec<String>),
    Line(String),
}

#[derive(Deserialize)]
struct RawExecArgs {
    #[serde(default)]
    cmd: Option<CommandArg>,
    #[serde(default)]
    command: Option<CommandArg>,
    #[serde(default)]
    workdir: Option<String>,
    #[serde(default)]
    timeout: Option<Value>,
}

/// Parse the raw JSON arguments of a `shell` call.
///
/// `cmd` (or `command`) may be an argv array or a single command line; a
/// command line runs through `bash -lc`. Returns `None` when the arguments do
/// not describe a command.
pub fn parse_exec_arguments(raw: &str) -> Option<ExecInput> {
    let args: RawExecArgs = serde_json::from_str(raw).ok()?;
    let cmd = match args.cmd.or(args.command)? {
        CommandArg::Argv(argv) => argv,
        CommandArg::Line(line) if line.trim().is_empty() => return None,
        CommandArg::Line(line) => vec!["bash".into(), "-lc".into(), line],
    };
    if cmd.first().is_none_or(|program| program.trim().is_empty()) {
        return None;
    }

    let timeout_ms = args.timeout.as_ref().and_then(|t| match t {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    });

    Some(ExecInput {
        cmd,
        workdir: args.workdir.filter(|w| !w.trim().is_empty()),
        timeout_ms,
    })
}
