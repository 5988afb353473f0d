//! Approval policy and the user-confirmation contract.
//!
//! The tool executor decides per command whether it may run straight away or
//! needs the user. When it needs the user it awaits a [`ConfirmationHandler`],
//! which the UI implements.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// How much the agent may do without asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalPolicy {
    /// Ask before every command and every patch.
    #[default]
    Suggest,
    /// Apply patches inside the working directory without asking; ask for commands.
    AutoEdit,
    /// Run everything without asking.
    FullAuto,
}

impl ApprovalPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Suggest => "suggest",
            Self::AutoEdit => "auto-edit",
            Self::FullAuto => "full-auto",
        }
    }
}

impl fmt::Display for ApprovalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "suggest" => Ok(Self::Suggest),
            "auto-edit" => Ok(Self::AutoEdit),
            "full-auto" => Ok(Self::FullAuto),
            other => Err(format!(
                "unknown approval policy '{other}' (expected suggest, auto-edit or full-auto)"
            )),
        }
    }
}

/// A patch the model asked to apply, in `*** Begin Patch` format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyPatchCommand {
    pub patch: String,
}

/// The user's answer to a confirmation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    /// Run this one command.
    Approve,
    /// Run it, and stop asking about the same command for the rest of the session.
    ApproveForSession,
    /// Do not run it.
    Deny,
    /// Do not run it; ask the model to explain what it would do.
    Explain,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandConfirmation {
    pub decision: ReviewDecision,
    /// Replaces the default stop message sent back to the model on denial.
    pub custom_deny_message: Option<String>,
}

impl CommandConfirmation {
    pub fn new(decision: ReviewDecision) -> Self {
        Self {
            decision,
            custom_deny_message: None,
        }
    }

    pub fn deny_with(message: impl Into<String>) -> Self {
        Self {
            decision: ReviewDecision::Deny,
            custom_deny_message: Some(message.into()),
        }
    }
}

/// Asks the user whether a command may run.
#[async_trait]
pub trait ConfirmationHandler: Send + Sync {
    /// `command` is the argv as it will be executed; `apply_patch` is set when
    /// the command is a patch.
    async fn confirm(
        &self,
        command: &[String],
        apply_patch: Option<&ApplyPatchCommand>,
    ) -> CommandConfirmation;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_policy_serde_is_kebab_case() {
        let json = serde_json::to_string(&ApprovalPolicy::AutoEdit).unwrap();
        assert_eq!(json, "\"auto-edit\"");
        let parsed: ApprovalPolicy = serde_json::from_str("\"full-auto\"").unwrap();
        assert_eq!(parsed, ApprovalPolicy::FullAuto);
    }

    #[test]
    fn approval_policy_from_str_accepts_underscores() {
        assert_eq!("full_auto".parse::<ApprovalPolicy>().unwrap(), ApprovalPolicy::FullAuto);
        assert!("yolo".parse::<ApprovalPolicy>().is_err());
        assert_eq!(ApprovalPolicy::default(), ApprovalPolicy::Suggest);
    }

    #[test]
    fn deny_with_sets_message() {
        let confirmation = CommandConfirmation::deny_with("use cargo instead");
        assert_eq!(confirmation.decision, ReviewDecision::Deny);
        assert_eq!(confirmation.custom_deny_message.as_deref(), Some("use cargo instead"));
    }
}
