//! `termpilot chat`: interactive or single-message sessions.

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use termpilot_agent::{AgentEvent, AgentLoop, AgentSink};
use termpilot_config::AppConfig;
use termpilot_core::{
    ApplyPatchCommand, ApprovalPolicy, CommandConfirmation, ConfirmationHandler, ConversationItem,
    Error, ProviderKind, ReviewDecision, Role,
};
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Lines of command output shown in the terminal.
const OUTPUT_PREVIEW_LINES: usize = 20;

pub struct ChatArgs {
    pub message: Option<String>,
    pub provider: Option<ProviderKind>,
    pub model: Option<String>,
    pub approval_mode: Option<ApprovalPolicy>,
    pub workdir: Option<PathBuf>,
    pub json: bool,
}

/// Stdin lines, shared by the prompt and the confirmation handler.
type Lines = Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>;

pub async fn run(args: ChatArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    if let Some(provider) = args.provider {
        config.provider = provider;
    }
    if let Some(model) = args.model {
        config.model = model;
    }
    if let Some(policy) = args.approval_mode {
        config.approval_policy = policy;
    }
    if let Some(workdir) = args.workdir {
        config.exec.workdir = Some(workdir);
    }

    if config.provider == ProviderKind::OpenAi && !config.has_api_key() {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    export OPENAI_API_KEY='sk-...'");
        eprintln!("    export TERMPILOT_API_KEY='sk-...'");
        eprintln!();
        eprintln!("  Or add it to your config file:");
        eprintln!("    {}", AppConfig::config_path().display());
        eprintln!();
        eprintln!("  Local backends need no key: --provider ollama or --provider huggingface");
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let lines: Lines = Arc::new(tokio::sync::Mutex::new(spawn_stdin_reader()));
    let sink = Arc::new(TerminalSink::new(args.json));
    let confirmer = Arc::new(StdinConfirmer::new(lines.clone()));
    let agent = Arc::new(AgentLoop::new(config.clone(), sink.clone(), confirmer));

    if let Some(message) = args.message {
        let result = run_turn(&agent, &sink, message).await;
        agent.terminate();
        return result.map_err(Into::into);
    }

    println!();
    println!("  ╔══════════════════════════════════════════════╗");
    println!("  ║        termpilot, interactive session        ║");
    println!("  ╚══════════════════════════════════════════════╝");
    println!();
    println!("  Provider:  {}", config.provider);
    println!("  Model:     {}", config.model);
    println!("  Approval:  {}", config.approval_policy);
    println!("  Workdir:   {}", config.exec.resolved_workdir().display());
    println!();
    println!("  Type your message and press Enter.");
    println!("  Ctrl+C interrupts the agent; /clear starts over; 'exit' quits.");
    println!();

    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = async { lines.lock().await.recv().await } => line,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit" | "/exit" | "/quit" | ":q") {
            break;
        }
        if line == "/clear" {
            sink.clear_response_id();
            println!("  Conversation cleared.");
            continue;
        }

        if let Err(e) = run_turn(&agent, &sink, line.to_string()).await {
            eprintln!("  [Error] {e}");
        }
        println!();
    }

    agent.terminate();
    println!();
    println!("  Goodbye!");
    println!();
    Ok(())
}

/// Run one turn on its own task so Ctrl+C can cancel it.
async fn run_turn(agent: &Arc<AgentLoop>, sink: &TerminalSink, text: String) -> Result<(), Error> {
    let previous = sink.last_response_id();
    tracing::debug!(previous_response_id = ?previous, "Starting chat turn");
    let task_agent = agent.clone();
    let mut handle = tokio::spawn(async move {
        task_agent
            .run(vec![ConversationItem::user_text(text)], previous)
            .await
    });

    tokio::select! {
        joined = &mut handle => {
            return joined.map_err(|e| Error::Internal(e.to_string()))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::debug!("Ctrl+C, cancelling the turn");
            agent.cancel();
            eprintln!("  Interrupted.");
        }
    }
    handle.await.map_err(|e| Error::Internal(e.to_string()))?
}

fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let mut lines = BufReader::new(io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// Prints finished items, or every event as JSON with `--json`.
pub struct TerminalSink {
    json: bool,
    last_response_id: Mutex<String>,
}

impl TerminalSink {
    pub fn new(json: bool) -> Self {
        Self {
            json,
            last_response_id: Mutex::new(String::new()),
        }
    }

    pub fn last_response_id(&self) -> Option<String> {
        let id = self
            .last_response_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        (!id.is_empty()).then(|| id.clone())
    }

    pub fn clear_response_id(&self) {
        self.on_last_response_id("");
    }

    fn emit_json(&self, event: AgentEvent) {
        let line = serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "event": event,
        });
        println!("{line}");
    }
}

impl AgentSink for TerminalSink {
    fn on_item(&self, item: ConversationItem) {
        if self.json {
            self.emit_json(AgentEvent::Item { item });
        } else if let Some(text) = render_item(&item) {
            println!("{text}");
        }
    }

    fn on_loading(&self, loading: bool) {
        if self.json {
            self.emit_json(AgentEvent::Loading { loading });
        } else if loading {
            eprintln!("  ...");
        }
    }

    fn on_last_response_id(&self, response_id: &str) {
        *self
            .last_response_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = response_id.to_string();
        if self.json {
            self.emit_json(AgentEvent::LastResponseId {
                response_id: response_id.to_string(),
            });
        }
    }

    fn on_delta(&self, item_id: &str, delta: &str) {
        if self.json {
            self.emit_json(AgentEvent::Delta {
                item_id: item_id.to_string(),
                delta: delta.to_string(),
            });
        }
    }
}

/// Terminal rendering of a finished item. The user's own messages are not
/// echoed.
pub fn render_item(item: &ConversationItem) -> Option<String> {
    match item {
        ConversationItem::Message { role, .. } => {
            let text = item.text()?;
            match role {
                Role::User => None,
                Role::Assistant => Some(
                    text.lines()
                        .map(|line| format!("  Assistant > {line}"))
                        .collect::<Vec<_>>()
                        .join("\n"),
                ),
                Role::System => Some(format!("  {text}")),
            }
        }
        ConversationItem::FunctionCallOutput {
            output, metadata, ..
        } => {
            let header = match metadata {
                Some(m) => format!(
                    "  command output (exit {}, {:.1}s):",
                    m.exit_code, m.duration_seconds
                ),
                None => "  command output:".to_string(),
            };
            let total = output.lines().count();
            let mut shown: Vec<String> = output
                .lines()
                .take(OUTPUT_PREVIEW_LINES)
                .map(|line| format!("    {line}"))
                .collect();
            if total > OUTPUT_PREVIEW_LINES {
                shown.push(format!("    ... ({} more lines)", total - OUTPUT_PREVIEW_LINES));
            }
            shown.insert(0, header);
            Some(shown.join("\n"))
        }
        ConversationItem::Reasoning {
            summary,
            duration_ms,
            ..
        } => {
            let took = duration_ms
                .map(|ms| format!(" ({:.1}s)", ms as f64 / 1000.0))
                .unwrap_or_default();
            Some(format!("  thinking{took}: {}", summary.join(" ")))
        }
        ConversationItem::FunctionCall { .. } => None,
    }
}

/// Asks on the terminal before a command runs.
pub struct StdinConfirmer {
    lines: Lines,
}

impl StdinConfirmer {
    pub fn new(lines: Lines) -> Self {
        Self { lines }
    }
}

#[async_trait]
impl ConfirmationHandler for StdinConfirmer {
    async fn confirm(
        &self,
        command: &[String],
        apply_patch: Option<&ApplyPatchCommand>,
    ) -> CommandConfirmation {
        println!();
        match apply_patch {
            Some(patch) => {
                println!("  The agent wants to apply this patch:");
                for line in patch.patch.lines() {
                    println!("    {line}");
                }
            }
            None => println!("  The agent wants to run: {}", command.join(" ")),
        }
        print!("  Allow? [y]es / [a]lways / [n]o / [e]xplain, or type a reason to refuse: ");
        // Unflushed stdout only delays the prompt.
        let _ = std::io::stdout().flush();

        match self.lines.lock().await.recv().await {
            Some(answer) => parse_review_answer(&answer),
            None => CommandConfirmation::new(ReviewDecision::Deny),
        }
    }
}

/// Map a typed answer to a decision. Anything unrecognized refuses the
/// command and is passed to the model as the reason.
pub fn parse_review_answer(answer: &str) -> CommandConfirmation {
    let answer = answer.trim();
    match answer.to_ascii_lowercase().as_str() {
        "" | "y" | "yes" => CommandConfirmation::new(ReviewDecision::Approve),
        "a" | "always" => CommandConfirmation::new(ReviewDecision::ApproveForSession),
        "n" | "no" => CommandConfirmation::new(ReviewDecision::Deny),
        "e" | "explain" => CommandConfirmation::new(ReviewDecision::Explain),
        _ => CommandConfirmation::deny_with(answer),
    }
}
