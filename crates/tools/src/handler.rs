//! Running one `shell` call end to end: approval, confirmation, execution.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use termpilot_config::ExecConfig;
use termpilot_core::{
    ApplyPatchCommand, ApprovalPolicy, CommandConfirmation, ConfirmationHandler,
    ConversationItem, ExecMetadata, ReviewDecision,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::approval::{SafetyAssessment, assess_command_safety, classify_command};
use crate::args::ExecInput;
use crate::exec::{ExecOptions, exec};
use crate::patch::apply_patch;

pub const DENIED_OUTPUT: &str = "aborted: command denied by user";

const DEFAULT_DENY_MESSAGE: &str =
    "Don't run that command. Stop and wait for further instructions from the user.";

const EXPLAIN_OUTPUT: &str = "command not run: the user asked for an explanation";

const EXPLAIN_MESSAGE: &str = "Before running anything, explain what the command you just proposed does and why it is needed.";

/// Execution settings plus what the user approved during this session.
pub struct ExecSession {
    config: ExecConfig,
    approved: Mutex<HashSet<Vec<String>>>,
}

impl ExecSession {
    pub fn new(config: ExecConfig) -> Self {
        Self {
            config,
            approved: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    fn is_approved(&self, cmd: &[String]) -> bool {
        self.approved
            .lock()
            .map(|set| set.contains(cmd))
            .unwrap_or(false)
    }

    fn remember(&self, cmd: &[String]) {
        if let Ok(mut set) = self.approved.lock() {
            set.insert(cmd.to_vec());
        }
    }
}

/// What a `shell` call produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutcome {
    pub output: String,
    pub metadata: ExecMetadata,
    /// Items to add to the conversation next to the call's output.
    pub additional_items: Vec<ConversationItem>,
}

impl ExecOutcome {
    fn new(output: impl Into<String>, exit_code: i32, duration: Duration) -> Self {
        Self {
            output: output.into(),
            metadata: ExecMetadata {
                exit_code,
                duration_seconds: duration.as_secs_f64(),
            },
            additional_items: Vec::new(),
        }
    }

    pub fn aborted() -> Self {
        Self::new("aborted", 1, Duration::ZERO)
    }
}

pub async fn handle_exec_command(
    input: ExecInput,
    session: &ExecSession,
    policy: ApprovalPolicy,
    confirmer: &dyn ConfirmationHandler,
    cancel: &CancellationToken,
) -> ExecOutcome {
    let patch = input.apply_patch();
    let workdir = resolve_workdir(session.config(), input.workdir.as_deref());
    let kind = classify_command(&input.cmd, patch.as_ref());
    debug!(command = %input.display(), kind = kind.as_str(), policy = %policy, "Handling shell call");

    let root = session.config().resolved_workdir();
    let pre_approved = session.is_approved(&input.cmd)
        || matches!(
            assess_command_safety(&input.cmd, patch.as_ref(), policy, &workdir, &root),
            SafetyAssessment::AutoApprove { .. }
        );

    if !pre_approved {
        let confirmation = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ExecOutcome::aborted(),
            confirmation = confirmer.confirm(&input.cmd, patch.as_ref()) => confirmation,
        };
        if let Some(outcome) = apply_decision(&input, session, confirmation) {
            return outcome;
        }
    }

    if cancel.is_cancelled() {
        return ExecOutcome::aborted();
    }

    match patch {
        Some(patch) => run_patch(&patch, &workdir),
        None => {
            let options = ExecOptions {
                workdir,
                timeout: input
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| Duration::from_millis(session.config().timeout_ms)),
                ..ExecOptions::from_config(session.config())
            };
            let result = exec(&input.cmd, &options, cancel).await;
            ExecOutcome::new(result.output, result.exit_code, result.duration)
        }
    }
}

/// `None` means the command may run.
fn apply_decision(
    input: &ExecInput,
    session: &ExecSession,
    confirmation: CommandConfirmation,
) -> Option<ExecOutcome> {
    match confirmation.decision {
        ReviewDecision::Approve => None,
        ReviewDecision::ApproveForSession => {
            session.remember(&input.cmd);
            None
        }
        ReviewDecision::Deny => {
            info!(command = %input.display(), "Command denied by user");
            let message = confirmation
                .custom_deny_message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_DENY_MESSAGE.to_string());
            let mut outcome = ExecOutcome::new(DENIED_OUTPUT, 1, Duration::ZERO);
            outcome
                .additional_items
                .push(ConversationItem::user_text(message));
            Some(outcome)
        }
        ReviewDecision::Explain => {
            let mut outcome = ExecOutcome::new(EXPLAIN_OUTPUT, 1, Duration::ZERO);
            outcome
                .additional_items
                .push(ConversationItem::user_text(EXPLAIN_MESSAGE));
            Some(outcome)
        }
    }
}

fn run_patch(patch: &ApplyPatchCommand, workdir: &Path) -> ExecOutcome {
    let started = Instant::now();
    match apply_patch(&patch.patch, workdir) {
        Ok(summary) => ExecOutcome::new(summary, 0, started.elapsed()),
        Err(e) => ExecOutcome::new(e.to_string(), 1, started.elapsed()),
    }
}

fn resolve_workdir(config: &ExecConfig, requested: Option<&str>) -> PathBuf {
    let base = config.resolved_workdir();
    match requested {
        Some(dir) => base.join(dir),
        None => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Answer {
        confirmation: CommandConfirmation,
        calls: AtomicUsize,
    }

    impl Answer {
        fn new(confirmation: CommandConfirmation) -> Self {
            Self {
                confirmation,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConfirmationHandler for Answer {
        async fn confirm(
            &self,
            _command: &[String],
            _apply_patch: Option<&ApplyPatchCommand>,
        ) -> CommandConfirmation {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.confirmation.clone()
        }
    }

    /// Never answers.
    struct Hang;

    #[async_trait]
    impl ConfirmationHandler for Hang {
        async fn confirm(
            &self,
            _command: &[String],
            _apply_patch: Option<&ApplyPatchCommand>,
        ) -> CommandConfirmation {
            std::future::pending().await
        }
    }

    fn session_in(dir: &Path) -> ExecSession {
        ExecSession::new(ExecConfig {
            workdir: Some(dir.to_path_buf()),
            ..ExecConfig::default()
        })
    }

    fn touch_cmd(name: &str) -> ExecInput {
        ExecInput::new(vec!["touch".into(), name.into()])
    }

    #[tokio::test]
    async fn suggest_asks_and_deny_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path());
        let confirmer = Answer::new(CommandConfirmation::new(ReviewDecision::Deny));

        let outcome = handle_exec_command(
            touch_cmd("marker"),
            &session,
            ApprovalPolicy::Suggest,
            &confirmer,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(confirmer.calls(), 1);
        assert_eq!(outcome.output, DENIED_OUTPUT);
        assert_eq!(outcome.metadata.exit_code, 1);
        assert_eq!(outcome.additional_items.len(), 1);
        assert!(!dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn custom_deny_message_is_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let confirmer = Answer::new(CommandConfirmation::deny_with("use cargo test instead"));
        let outcome = handle_exec_command(
            touch_cmd("marker"),
            &session_in(dir.path()),
            ApprovalPolicy::Suggest,
            &confirmer,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(
            outcome.additional_items[0].text().as_deref(),
            Some("use cargo test instead")
        );
    }

    #[tokio::test]
    async fn explain_does_not_run() {
        let dir = tempfile::tempdir().unwrap();
        let confirmer = Answer::new(CommandConfirmation::new(ReviewDecision::Explain));
        let outcome = handle_exec_command(
            touch_cmd("marker"),
            &session_in(dir.path()),
            ApprovalPolicy::Suggest,
            &confirmer,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome.output, EXPLAIN_OUTPUT);
        assert!(!dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn approve_runs_in_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let confirmer = Answer::new(CommandConfirmation::new(ReviewDecision::Approve));
        let outcome = handle_exec_command(
            touch_cmd("marker"),
            &session_in(dir.path()),
            ApprovalPolicy::Suggest,
            &confirmer,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome.metadata.exit_code, 0);
        assert!(dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn approve_for_session_asks_once() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path());
        let confirmer = Answer::new(CommandConfirmation::new(ReviewDecision::ApproveForSession));

        for _ in 0..2 {
            handle_exec_command(
                touch_cmd("marker"),
                &session,
                ApprovalPolicy::Suggest,
                &confirmer,
                &CancellationToken::new(),
            )
            .await;
        }
        assert_eq!(confirmer.calls(), 1);
    }

    #[tokio::test]
    async fn full_auto_skips_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let confirmer = Answer::new(CommandConfirmation::new(ReviewDecision::Deny));
        let outcome = handle_exec_command(
            touch_cmd("marker"),
            &session_in(dir.path()),
            ApprovalPolicy::FullAuto,
            &confirmer,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(confirmer.calls(), 0);
        assert_eq!(outcome.metadata.exit_code, 0);
    }

    #[tokio::test]
    async fn auto_edit_applies_patch_in_process() {
        let dir = tempfile::tempdir().unwrap();
        let confirmer = Answer::new(CommandConfirmation::new(ReviewDecision::Deny));
        let input = ExecInput::new(vec![
            "apply_patch".into(),
            "*** Begin Patch\n*** Add File: notes.txt\n+hi\n*** End Patch".into(),
        ]);

        let outcome = handle_exec_command(
            input,
            &session_in(dir.path()),
            ApprovalPolicy::AutoEdit,
            &confirmer,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(confirmer.calls(), 0);
        assert_eq!(outcome.output, "Success. Updated the following files:\nA notes.txt\n");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("notes.txt")).unwrap(),
            "hi\n"
        );
    }

    #[tokio::test]
    async fn auto_edit_asks_when_requested_workdir_is_outside_the_project() {
        let project = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let confirmer = Answer::new(CommandConfirmation::new(ReviewDecision::Deny));
        let mut input = ExecInput::new(vec![
            "apply_patch".into(),
            "*** Begin Patch\n*** Add File: planted.txt\n+x\n*** End Patch".into(),
        ]);
        input.workdir = Some(elsewhere.path().to_string_lossy().into_owned());

        let outcome = handle_exec_command(
            input,
            &session_in(project.path()),
            ApprovalPolicy::AutoEdit,
            &confirmer,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(confirmer.calls(), 1);
        assert_eq!(outcome.output, DENIED_OUTPUT);
        assert!(!elsewhere.path().join("planted.txt").exists());
    }

    #[tokio::test]
    async fn cancel_while_waiting_for_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = handle_exec_command(
            touch_cmd("marker"),
            &session_in(dir.path()),
            ApprovalPolicy::Suggest,
            &Hang,
            &cancel,
        )
        .await;

        assert_eq!(outcome, ExecOutcome::aborted());
        assert!(!dir.path().join("marker").exists());
    }
}
