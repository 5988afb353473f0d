//! The `apply_patch` tool.
//!
//! Patches use the envelope format models are trained on:
//!
//! ```text
//! *** Begin Patch
//! *** Add File: path/new.rs
//! +line
//! *** Delete File: path/old.rs
//! *** Update File: path/lib.rs
//! *** Move to: path/renamed.rs
//! @@ fn context()
//!  unchanged
//! -removed
//! +added
//! *** End Patch
//! ```
//!
//! Actions apply in order and are not rolled back: a failing action leaves
//! the earlier ones on disk.

use std::path::Path;

use termpilot_core::ToolError;
use tracing::debug;

const BEGIN_PATCH: &str = "*** Begin Patch";
const END_PATCH: &str = "*** End Patch";
const ADD_FILE: &str = "*** Add File: ";
const DELETE_FILE: &str = "*** Delete File: ";
const UPDATE_FILE: &str = "*** Update File: ";
const MOVE_TO: &str = "*** Move to: ";
const END_OF_FILE: &str = "*** End of File";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchAction {
    Add {
        path: String,
        contents: String,
    },
    Delete {
        path: String,
    },
    Update {
        path: String,
        move_to: Option<String>,
        chunks: Vec<UpdateChunk>,
    },
}

impl PatchAction {
    pub fn path(&self) -> &str {
        match self {
            Self::Add { path, .. } | Self::Delete { path } | Self::Update { path, .. } => path,
        }
    }
}

/// One `@@` hunk of an update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateChunk {
    /// Text after `@@`, used to locate the hunk.
    pub change_context: Option<String>,
    pub old_lines: Vec<String>,
    pub new_lines: Vec<String>,
    /// The hunk must match at the end of the file.
    pub is_end_of_file: bool,
}

impl UpdateChunk {
    fn is_empty(&self) -> bool {
        self.old_lines.is_empty() && self.new_lines.is_empty()
    }
}

fn invalid(message: impl Into<String>) -> ToolError {
    ToolError::InvalidPatch(message.into())
}

pub fn parse_patch(patch: &str) -> Result<Vec<PatchAction>, ToolError> {
    let lines: Vec<&str> = patch.trim().lines().collect();
    match (lines.first(), lines.last()) {
        (Some(first), _) if first.trim() != BEGIN_PATCH => {
            return Err(invalid(format!("the first line must be '{BEGIN_PATCH}'")));
        }
        (_, Some(last)) if lines.len() < 2 || last.trim() != END_PATCH => {
            return Err(invalid(format!("the last line must be '{END_PATCH}'")));
        }
        (None, _) | (_, None) => return Err(invalid("empty patch")),
        _ => {}
    }

    let body = &lines[1..lines.len() - 1];
    let mut actions = Vec::new();
    let mut i = 0;
    while i < body.len() {
        let line = body[i].trim_end();
        if let Some(path) = line.strip_prefix(ADD_FILE) {
            i += 1;
            let mut contents = String::new();
            while i < body.len() && !body[i].starts_with("*** ") {
                let Some(added) = body[i].strip_prefix('+') else {
                    return Err(invalid(format!(
                        "'{}' in added file {path} does not start with '+'",
                        body[i]
                    )));
                };
                contents.push_str(added);
                contents.push('\n');
                i += 1;
            }
            actions.push(PatchAction::Add {
                path: path.trim().to_string(),
                contents,
            });
        } else if let Some(path) = line.strip_prefix(DELETE_FILE) {
            actions.push(PatchAction::Delete {
                path: path.trim().to_string(),
            });
            i += 1;
        } else if let Some(path) = line.strip_prefix(UPDATE_FILE) {
            i += 1;
            let move_to = match body.get(i).and_then(|l| l.trim_end().strip_prefix(MOVE_TO)) {
                Some(dest) => {
                    i += 1;
                    Some(dest.trim().to_string())
                }
                None => None,
            };
            let (chunks, next) = parse_chunks(path, body, i)?;
            i = next;
            actions.push(PatchAction::Update {
                path: path.trim().to_string(),
                move_to,
                chunks,
            });
        } else if line.trim().is_empty() {
            i += 1;
        } else {
            return Err(invalid(format!(
                "'{line}' is not a valid file header; expected Add File, Delete File or Update File"
            )));
        }
    }

    if actions.is_empty() {
        return Err(invalid("patch contains no file operations"));
    }
    Ok(actions)
}

fn parse_chunks(
    path: &str,
    body: &[&str],
    mut i: usize,
) -> Result<(Vec<UpdateChunk>, usize), ToolError> {
    let mut chunks = Vec::new();
    let mut current = UpdateChunk::default();
    let mut seen_header = false;

    while i < body.len() {
        let line = body[i];
        if line.starts_with("*** ") && line.trim_end() != END_OF_FILE {
            break;
        }
        if line.trim_end() == END_OF_FILE {
            current.is_end_of_file = true;
        } else if let Some(context) = line.strip_prefix("@@") {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            let context = context.trim();
            current.change_context = (!context.is_empty()).then(|| context.to_string());
            seen_header = true;
        } else if let Some(removed) = line.strip_prefix('-') {
            current.old_lines.push(removed.to_string());
        } else if let Some(added) = line.strip_prefix('+') {
            current.new_lines.push(added.to_string());
        } else if let Some(context) = line.strip_prefix(' ') {
            current.old_lines.push(context.to_string());
            current.new_lines.push(context.to_string());
        } else if line.is_empty() {
            current.old_lines.push(String::new());
            current.new_lines.push(String::new());
        } else if !seen_header {
            return Err(invalid(format!("update of {path} must start with '@@'")));
        } else {
            return Err(invalid(format!(
                "unexpected line '{line}' in update of {path}; hunk lines start with ' ', '+' or '-'"
            )));
        }
        i += 1;
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    if chunks.is_empty() {
        return Err(invalid(format!("update of {path} has no hunks")));
    }
    Ok((chunks, i))
}

/// Apply `patch` relative to `cwd`, returning the summary of touched files.
pub fn apply_patch(patch: &str, cwd: &Path) -> Result<String, ToolError> {
    let actions = parse_patch(patch)?;

    let mut added = Vec::new();
    let mut modified = Vec::new();
    let mut deleted = Vec::new();

    for action in actions {
        match action {
            PatchAction::Add { path, contents } => {
                write_file(&cwd.join(&path), &path, &contents)?;
                added.push(path);
            }
            PatchAction::Delete { path } => {
                std::fs::remove_file(cwd.join(&path)).map_err(|e| {
                    ToolError::PatchFailed(format!("Failed to delete file {path}: {e}"))
                })?;
                deleted.push(path);
            }
            PatchAction::Update {
                path,
                move_to,
                chunks,
            } => {
                let source = cwd.join(&path);
                let original = std::fs::read_to_string(&source).map_err(|e| {
                    ToolError::PatchFailed(format!("Failed to read file to update {path}: {e}"))
                })?;
                let updated = derive_new_contents(&original, &path, &chunks)?;
                match move_to {
                    Some(dest) => {
                        let target = cwd.join(&dest);
                        write_file(&target, &dest, &updated)?;
                        if target != source {
                            std::fs::remove_file(&source).map_err(|e| {
                                ToolError::PatchFailed(format!(
                                    "Failed to remove original {path}: {e}"
                                ))
                            })?;
                        }
                        modified.push(dest);
                    }
                    None => {
                        write_file(&source, &path, &updated)?;
                        modified.push(path);
                    }
                }
            }
        }
    }

    debug!(
        added = added.len(),
        modified = modified.len(),
        deleted = deleted.len(),
        "Applied patch"
    );

    let mut summary = String::from("Success. Updated the following files:\n");
    for (marker, paths) in [("A", &added), ("M", &modified), ("D", &deleted)] {
        for path in paths {
            summary.push_str(&format!("{marker} {path}\n"));
        }
    }
    Ok(summary)
}

fn write_file(target: &Path, display: &str, contents: &str) -> Result<(), ToolError> {
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            ToolError::PatchFailed(format!("Failed to create parent directories for {display}: {e}"))
        })?;
    }
    std::fs::write(target, contents)
        .map_err(|e| ToolError::PatchFailed(format!("Failed to write file {display}: {e}")))
}

fn derive_new_contents(
    original: &str,
    path: &str,
    chunks: &[UpdateChunk],
) -> Result<String, ToolError> {
    let mut lines: Vec<String> = original.split('\n').map(str::to_string).collect();
    if lines.last().is_some_and(String::is_empty) {
        lines.pop();
    }

    let mut replacements: Vec<(usize, usize, Vec<String>)> = Vec::new();
    let mut cursor = 0;
    for chunk in chunks {
        if let Some(context) = &chunk.change_context {
            let Some(found) = seek_sequence(&lines, std::slice::from_ref(context), cursor, false)
            else {
                return Err(ToolError::PatchFailed(format!(
                    "Failed to find context '{context}' in {path}"
                )));
            };
            cursor = found + 1;
        }

        if chunk.old_lines.is_empty() {
            replacements.push((lines.len(), 0, chunk.new_lines.clone()));
            continue;
        }

        let mut old = chunk.old_lines.as_slice();
        let mut new = chunk.new_lines.as_slice();
        let mut found = seek_sequence(&lines, old, cursor, chunk.is_end_of_file);
        // A trailing blank context line often stands for the end of the file.
        if found.is_none() && old.last().is_some_and(String::is_empty) {
            old = &old[..old.len() - 1];
            if new.last().is_some_and(String::is_empty) {
                new = &new[..new.len() - 1];
            }
            found = seek_sequence(&lines, old, cursor, chunk.is_end_of_file);
        }

        match found {
            Some(start) => {
                replacements.push((start, old.len(), new.to_vec()));
                cursor = start + old.len();
            }
            None => {
                return Err(ToolError::PatchFailed(format!(
                    "Failed to find expected lines in {path}:\n{}",
                    chunk.old_lines.join("\n")
                )));
            }
        }
    }

    replacements.sort_by_key(|(start, _, _)| *start);
    for (start, len, new) in replacements.into_iter().rev() {
        lines.splice(start..start + len, new);
    }

    let mut contents = lines.join("\n");
    contents.push('\n');
    Ok(contents)
}

fn exact(s: &str) -> &str {
    s
}

/// Find `pattern` in `lines` at or after `start`, tolerating whitespace
/// differences in progressively looser passes.
fn seek_sequence(lines: &[String], pattern: &[String], start: usize, eof: bool) -> Option<usize> {
    if pattern.is_empty() {
        return Some(start);
    }
    if pattern.len() > lines.len() {
        return None;
    }
    let last = lines.len() - pattern.len();
    let from = if eof { last } else { start.min(last + 1) };

    let passes: [fn(&str) -> &str; 3] = [exact, str::trim_end, str::trim];
    for normalize in passes {
        for i in from..=last {
            if pattern
                .iter()
                .enumerate()
                .all(|(j, p)| normalize(&lines[i + j]) == normalize(p))
            {
                return Some(i);
            }
        }
    }
    None
}
