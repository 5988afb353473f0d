//! Deciding whether a command may run without asking the user.

use std::path::{Component, Path, PathBuf};

use termpilot_core::{ApplyPatchCommand, ApprovalPolicy};
use tracing::trace;

use crate::patch::{PatchAction, parse_patch};

/// Commands that only read.
const READ_ONLY_COMMANDS: &[&str] = &[
    "ls", "dir", "cat", "head", "tail", "echo", "pwd", "date", "whoami", "wc", "grep", "rg",
    "find", "which", "tree", "stat", "file",
];

/// Rough classification of a command, used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    ReadOnly,
    Edit,
    Execute,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "read",
            Self::Edit => "edit",
            Self::Execute => "execute",
        }
    }
}

pub fn classify_command(cmd: &[String], apply_patch: Option<&ApplyPatchCommand>) -> CommandKind {
    if apply_patch.is_some() {
        return CommandKind::Edit;
    }
    // `bash -lc "<script>"` is classified by the script's first word.
    let program = match cmd {
        [shell, flag, script] if shell == "bash" && flag == "-lc" => {
            script.split_whitespace().next().unwrap_or_default()
        }
        _ => cmd.first().map(String::as_str).unwrap_or_default(),
    };
    let base = Path::new(program)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(program);
    if READ_ONLY_COMMANDS.contains(&base) {
        CommandKind::ReadOnly
    } else {
        CommandKind::Execute
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyAssessment {
    AutoApprove { reason: String },
    AskUser,
}

/// `workdir` is where the command would run; under `auto-edit` a patch is
/// approved only when every path it touches lands inside `root`, the
/// configured working directory.
pub fn assess_command_safety(
    cmd: &[String],
    apply_patch: Option<&ApplyPatchCommand>,
    policy: ApprovalPolicy,
    workdir: &Path,
    root: &Path,
) -> SafetyAssessment {
    match policy {
        ApprovalPolicy::Suggest => SafetyAssessment::AskUser,
        ApprovalPolicy::FullAuto => SafetyAssessment::AutoApprove {
            reason: "full-auto approval policy".into(),
        },
        ApprovalPolicy::AutoEdit => match apply_patch {
            Some(patch) if patch_stays_inside(patch, workdir, root) => SafetyAssessment::AutoApprove {
                reason: "patch only touches files inside the working directory".into(),
            },
            Some(_) => SafetyAssessment::AskUser,
            None => {
                trace!(command = ?cmd, "auto-edit does not cover commands");
                SafetyAssessment::AskUser
            }
        },
    }
}

fn patch_stays_inside(patch: &ApplyPatchCommand, workdir: &Path, root: &Path) -> bool {
    let Ok(actions) = parse_patch(&patch.patch) else {
        return false;
    };
    let root = normalize(root);
    actions.iter().all(|action| {
        let mut paths = vec![action.path()];
        if let PatchAction::Update {
            move_to: Some(dest), ..
        } = action
        {
            paths.push(dest.as_str());
        }
        paths
            .into_iter()
            .all(|p| normalize(&workdir.join(p)).starts_with(&root))
    })
}

/// Lexical normalization; `..` above the root is kept so it fails `starts_with`.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn patch_for(path: &str) -> ApplyPatchCommand {
        ApplyPatchCommand {
            patch: format!("*** Begin Patch\n*** Add File: {path}\n+x\n*** End Patch"),
        }
    }

    #[test]
    fn classification() {
        assert_eq!(classify_command(&argv(&["ls", "-la"]), None), CommandKind::ReadOnly);
        assert_eq!(
            classify_command(&argv(&["bash", "-lc", "cat a.txt | wc -l"]), None),
            CommandKind::ReadOnly
        );
        assert_eq!(classify_command(&argv(&["rm", "-rf", "x"]), None), CommandKind::Execute);
        let patch = patch_for("a.txt");
        assert_eq!(
            classify_command(&argv(&["apply_patch"]), Some(&patch)),
            CommandKind::Edit
        );
    }

    #[test]
    fn suggest_always_asks() {
        let patch = patch_for("a.txt");
        assert_eq!(
            assess_command_safety(&argv(&["ls"]), None, ApprovalPolicy::Suggest, Path::new("/w"), Path::new("/w")),
            SafetyAssessment::AskUser
        );
        assert_eq!(
            assess_command_safety(&[], Some(&patch), ApprovalPolicy::Suggest, Path::new("/w"), Path::new("/w")),
            SafetyAssessment::AskUser
        );
    }

    #[test]
    fn auto_edit_approves_patches_inside_workdir_only() {
        let inside = patch_for("src/lib.rs");
        let escaping = patch_for("../outside.rs");
        let absolute = patch_for("/etc/passwd");
        let workdir = Path::new("/work/project");

        assert!(matches!(
            assess_command_safety(&[], Some(&inside), ApprovalPolicy::AutoEdit, workdir, workdir),
            SafetyAssessment::AutoApprove { .. }
        ));
        assert_eq!(
            assess_command_safety(&[], Some(&escaping), ApprovalPolicy::AutoEdit, workdir, workdir),
            SafetyAssessment::AskUser
        );
        assert_eq!(
            assess_command_safety(&[], Some(&absolute), ApprovalPolicy::AutoEdit, workdir, workdir),
            SafetyAssessment::AskUser
        );
        assert_eq!(
            assess_command_safety(&argv(&["make"]), None, ApprovalPolicy::AutoEdit, workdir, workdir),
            SafetyAssessment::AskUser
        );
    }

    #[test]
    fn auto_edit_checks_patches_against_the_configured_root() {
        let patch = patch_for("notes.txt");
        let root = Path::new("/work/project");

        assert!(matches!(
            assess_command_safety(
                &[],
                Some(&patch),
                ApprovalPolicy::AutoEdit,
                Path::new("/work/project/docs"),
                root
            ),
            SafetyAssessment::AutoApprove { .. }
        ));
        assert_eq!(
            assess_command_safety(&[], Some(&patch), ApprovalPolicy::AutoEdit, Path::new("/tmp"), root),
            SafetyAssessment::AskUser
        );
        assert_eq!(
            assess_command_safety(
                &[],
                Some(&patch),
                ApprovalPolicy::AutoEdit,
                Path::new("/work/project/../other"),
                root
            ),
            SafetyAssessment::AskUser
        );
    }

    #[test]
    fn full_auto_approves_everything() {
        assert!(matches!(
            assess_command_safety(
                &argv(&["rm", "-rf", "build"]),
                None,
                ApprovalPolicy::FullAuto,
                Path::new("/w"),
                Path::new("/w")
            ),
            SafetyAssessment::AutoApprove { .. }
        ));
    }
}
