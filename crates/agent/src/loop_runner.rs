//! The turn loop.
//!
//! One call to [`AgentLoop::run`] is one user turn: the input goes to the
//! provider, the streamed output is delivered to the sink, and every function
//! call the model issues is executed and answered in a follow-up request,
//! until a response arrives without calls.
//!
//! Cancellation is cooperative. Each run belongs to a *generation*; `cancel`
//! bumps the generation, aborts the live stream and the running command, and
//! every piece of asynchronous work checks its generation before acting.
//! Items are delivered with a short delay so that a cancel issued right after
//! an item was produced can still suppress it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use termpilot_config::AppConfig;
use termpilot_core::{
    ApprovalPolicy, ConfirmationHandler, ConversationItem, Error, Provider, ProviderError,
    ProviderKind, ResponseRequest, ResponseStream, StreamingEvent,
};
use termpilot_providers::{create_provider, provider_options};
use termpilot_tools::{
    ExecSession, SHELL_TOOL_NAMES, handle_exec_command, parse_exec_arguments,
    shell_tool_definition,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::catalog::ModelCatalog;
use crate::retry::{FailureClass, is_network_or_server, messages, rate_limit_backoff};
use crate::sink::AgentSink;

/// Delay before a staged item is delivered.
const STAGE_DELAY: Duration = Duration::from_millis(10);

/// Delay before the end-of-turn flush.
const FLUSH_DELAY: Duration = Duration::from_millis(30);

const DEFAULT_INSTRUCTIONS: &str = r#"You are termpilot, a command-line coding assistant that uses language models to work with a local codebase. You are precise, helpful and safe.

You can:
- Receive requests from the user, context about the project, and files.
- Reply, and call functions to run shell commands and edit code.
- Apply patches, run commands, and handle approvals.
- Work inside a sandboxed workspace with git support.

You are an agent: keep going until the user's request is fully resolved, and only end your turn when you are sure the problem is solved. If you are unsure about a file's contents or the structure of the code, use your tools to read files and gather the relevant information. Do NOT guess.

Solve the user's task by editing and testing code files in the current session. The repositories are already checked out in your working directory.

While working on the task:
- Working on repositories in the current environment is allowed, even if they are proprietary.
- Analyzing code for vulnerabilities is allowed.
- Showing user code and tool call details is allowed.
- Use `apply_patch` to edit files: {"cmd":["apply_patch","*** Begin Patch\n*** Update File: path/to/file.py\n@@ def example():\n-  pass\n+  return 123\n*** End Patch"]}
- If the task requires writing or modifying files:
    - Fix the problem at its root rather than applying surface-level patches.
    - Avoid unneeded complexity.
    - Update documentation as needed.
    - Keep changes consistent with the style of the existing codebase.
    - NEVER add copyright or license headers unless asked to.
    - When done, check your changes with `git status`.
- If the task does not require writing or modifying files, answer in a friendly tone, like a knowledgeable remote teammate."#;

/// Builds an uninitialized adapter for a backend.
pub type ProviderFactory = Arc<dyn Fn(ProviderKind, &AppConfig) -> Box<dyn Provider> + Send + Sync>;

/// Mutable state shared by runs, `cancel` and the delivery timers.
#[derive(Debug)]
struct LoopState {
    generation: u64,
    cancelled: bool,
    terminated: bool,
    /// Generation of the run in progress, if any.
    active_run: Option<u64>,
    /// Call ids issued since the last turn that finished without a cancel.
    pending_aborts: Vec<String>,
    /// Cancels the current turn's tool execution and backoff sleeps.
    exec_abort: CancellationToken,
    /// Aborts the stream being consumed.
    current_stream: Option<CancellationToken>,
    /// Call ids already executed this session.
    processed_calls: HashSet<String>,
}

fn lock(state: &Mutex<LoopState>) -> MutexGuard<'_, LoopState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn is_current(state: &Mutex<LoopState>, hard_abort: &CancellationToken, generation: u64) -> bool {
    let s = lock(state);
    s.generation == generation && !s.cancelled && !hard_abort.is_cancelled()
}

pub struct AgentLoop {
    config: AppConfig,
    model: String,
    instructions: Option<String>,
    approval_policy: ApprovalPolicy,
    provider_kind: ProviderKind,
    factory: ProviderFactory,
    provider: tokio::sync::Mutex<Option<Arc<dyn Provider>>>,
    sink: Arc<dyn AgentSink>,
    confirmer: Arc<dyn ConfirmationHandler>,
    state: Arc<Mutex<LoopState>>,
    /// Fires on `terminate`; every per-turn token is a child of it.
    hard_abort: CancellationToken,
    catalog: ModelCatalog,
    exec_session: ExecSession,
}

impl AgentLoop {
    /// Create a loop for the provider, model and approval policy in `config`.
    /// Nothing is contacted until the first `run`.
    pub fn new(
        config: AppConfig,
        sink: Arc<dyn AgentSink>,
        confirmer: Arc<dyn ConfirmationHandler>,
    ) -> Self {
        let hard_abort = CancellationToken::new();
        let state = LoopState {
            generation: 0,
            cancelled: false,
            terminated: false,
            active_run: None,
            pending_aborts: Vec::new(),
            exec_abort: hard_abort.child_token(),
            current_stream: None,
            processed_calls: HashSet::new(),
        };
        Self {
            model: config.model.clone(),
            instructions: config.instructions.clone(),
            approval_policy: config.approval_policy,
            provider_kind: config.provider,
            factory: Arc::new(|kind: ProviderKind, config: &AppConfig| create_provider(kind, config)),
            provider: tokio::sync::Mutex::new(None),
            sink,
            confirmer,
            state: Arc::new(Mutex::new(state)),
            hard_abort,
            catalog: ModelCatalog::new(Duration::from_millis(config.retry.model_list_timeout_ms)),
            exec_session: ExecSession::new(config.exec.clone()),
            config,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_approval_policy(mut self, policy: ApprovalPolicy) -> Self {
        self.approval_policy = policy;
        self
    }

    pub fn with_provider_kind(mut self, kind: ProviderKind) -> Self {
        self.provider_kind = kind;
        self
    }

    /// Replace how the adapter is built, e.g. with a scripted one in tests.
    pub fn with_provider_factory(
        mut self,
        factory: impl Fn(ProviderKind, &AppConfig) -> Box<dyn Provider> + Send + Sync + 'static,
    ) -> Self {
        self.factory = Arc::new(factory);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn provider_kind(&self) -> ProviderKind {
        self.provider_kind
    }

    pub fn approval_policy(&self) -> ApprovalPolicy {
        self.approval_policy
    }

    pub fn generation(&self) -> u64 {
        lock(&self.state).generation
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).active_run.is_some()
    }

    pub fn is_terminated(&self) -> bool {
        lock(&self.state).terminated
    }

    /// Call ids that will be answered with `aborted` on the next run.
    pub fn pending_aborts(&self) -> Vec<String> {
        lock(&self.state).pending_aborts.clone()
    }

    /// Run one user turn.
    ///
    /// Backend and network failures end the turn with a system message and
    /// `Ok(())`. Only unclassified failures, and use after `terminate`, are
    /// returned as errors.
    pub async fn run(
        &self,
        input: Vec<ConversationItem>,
        previous_response_id: Option<String>,
    ) -> Result<(), Error> {
        if self.is_terminated() {
            return Err(Error::Terminated);
        }

        let provider = match self.ensure_provider().await {
            Ok(provider) => provider,
            Err(e) => {
                warn!(provider = %self.provider_kind, error = %e, "Provider initialization failed");
                self.sink.on_item(ConversationItem::system_text(messages::init_failed(
                    self.provider_kind.as_str(),
                    &e,
                )));
                self.sink.on_loading(false);
                return Ok(());
            }
        };

        let (generation, turn_abort) = {
            let mut s = lock(&self.state);
            s.generation += 1;
            s.cancelled = false;
            s.current_stream = None;
            s.exec_abort = self.hard_abort.child_token();
            s.active_run = Some(s.generation);
            (s.generation, s.exec_abort.clone())
        };
        info!(generation, model = %self.model, provider = %self.provider_kind, "Starting turn");

        let stager = Stager::new(generation, self.state.clone(), self.hard_abort.clone(), self.sink.clone());
        let turn = Turn {
            generation,
            abort: turn_abort,
            stager,
            started: Instant::now(),
        };

        let outcome = self
            .run_turn(&turn, provider, input, previous_response_id)
            .await;
        let result = match outcome {
            Ok(()) => Ok(()),
            Err(Error::Provider(err)) => self.absorb_failure(&turn, err),
            Err(other) => Err(other),
        };

        let mut s = lock(&self.state);
        if s.active_run == Some(generation) {
            s.active_run = None;
        }
        result
    }

    /// Stop the run in progress. A no-op when idle apart from the generation
    /// bump.
    pub fn cancel(&self) {
        if self.is_terminated() {
            return;
        }
        self.cancel_inner();
    }

    /// Cancel and refuse every later `run`.
    pub fn terminate(&self) {
        {
            let mut s = lock(&self.state);
            if s.terminated {
                return;
            }
            s.terminated = true;
        }
        info!("Terminating agent loop");
        self.hard_abort.cancel();
        self.cancel_inner();
    }

    fn cancel_inner(&self) {
        let clear_response_id = {
            let mut s = lock(&self.state);
            s.generation += 1;
            if s.active_run.is_none() {
                debug!(generation = s.generation, "Cancel while idle");
                return;
            }
            s.cancelled = true;
            if let Some(stream) = s.current_stream.take() {
                stream.cancel();
            }
            s.exec_abort.cancel();
            s.exec_abort = self.hard_abort.child_token();
            debug!(
                generation = s.generation,
                pending_aborts = s.pending_aborts.len(),
                "Cancelled run"
            );
            s.pending_aborts.is_empty()
        };

        // Unanswered calls must be answered against the same response, so the
        // id is only dropped when there are none.
        if clear_response_id {
            self.sink.on_last_response_id("");
        }
        self.sink.on_loading(false);
    }

    async fn ensure_provider(&self) -> Result<Arc<dyn Provider>, ProviderError> {
        let mut slot = self.provider.lock().await;
        if let Some(provider) = slot.as_ref() {
            return Ok(provider.clone());
        }

        let mut provider = (self.factory)(self.provider_kind, &self.config);
        provider
            .initialize(provider_options(self.provider_kind, &self.config))
            .await?;
        debug!(provider = %self.provider_kind, "Provider initialized");

        let provider: Arc<dyn Provider> = Arc::from(provider);
        *slot = Some(provider.clone());
        Ok(provider)
    }

    fn merged_instructions(&self) -> String {
        [Some(DEFAULT_INSTRUCTIONS), self.instructions.as_deref()]
            .into_iter()
            .flatten()
            .filter(|part| !part.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn is_current(&self, generation: u64) -> bool {
        is_current(&self.state, &self.hard_abort, generation)
    }

    async fn run_turn(
        &self,
        turn: &Turn,
        provider: Arc<dyn Provider>,
        input: Vec<ConversationItem>,
        previous_response_id: Option<String>,
    ) -> Result<(), Error> {
        let mut last_response_id = previous_response_id.filter(|id| !id.is_empty());

        // Calls left unanswered by a cancelled run are answered first.
        let mut turn_input: Vec<ConversationItem> = {
            let mut s = lock(&self.state);
            s.pending_aborts
                .drain(..)
                .map(ConversationItem::aborted_output)
                .collect()
        };
        if !turn_input.is_empty() {
            debug!(count = turn_input.len(), "Answering aborted calls");
        }
        turn_input.extend(input);

        self.sink.on_loading(true);

        if !self.catalog.is_supported(provider.as_ref(), &self.model).await {
            warn!(model = %self.model, provider = %self.provider_kind, "Model not offered by provider");
            self.end_turn(
                turn,
                messages::unsupported_model(&self.model, self.provider_kind.as_str()),
            );
            return Ok(());
        }

        let instructions = self.merged_instructions();
        trace!(chars = instructions.len(), "Merged instructions");

        while !turn_input.is_empty() {
            if !self.is_current(turn.generation) {
                return Ok(());
            }
            for item in &turn_input {
                turn.stager.stage(item.clone());
            }

            let request = ResponseRequest {
                model: self.model.clone(),
                instructions: instructions.clone(),
                input: std::mem::take(&mut turn_input),
                previous_response_id: last_response_id.clone(),
                tools: vec![shell_tool_definition()],
            };
            let Some(mut stream) = self.open_stream(turn, provider.as_ref(), request).await? else {
                return Ok(());
            };

            {
                let mut s = lock(&self.state);
                if s.generation != turn.generation || s.cancelled || self.hard_abort.is_cancelled() {
                    stream.abort();
                    return Ok(());
                }
                s.current_stream = Some(stream.abort_handle());
            }

            let mut output = TurnOutput::default();
            let consumed = self
                .consume_stream(turn, &mut stream, &mut output, &mut last_response_id)
                .await;
            lock(&self.state).current_stream = None;
            drop(stream);

            if !self.is_current(turn.generation) {
                return Ok(());
            }
            consumed?;

            for call in output.calls {
                if !self.is_current(turn.generation) {
                    return Ok(());
                }
                let items = self.handle_function_call(turn, &call).await;
                turn_input.extend(items);
            }
            trace!(count = turn_input.len(), "Next request input");
        }

        tokio::time::sleep(FLUSH_DELAY).await;
        turn.stager.flush();

        let still_active = {
            let mut s = lock(&self.state);
            let active = s.active_run == Some(turn.generation);
            if active {
                s.pending_aborts.clear();
            }
            active
        };
        if still_active {
            self.sink.on_loading(false);
        }
        Ok(())
    }

    /// Open a response stream, retrying transient failures and rate limits.
    /// `Ok(None)` means the turn is over: it was cancelled, or a system
    /// message explaining the failure was delivered.
    async fn open_stream(
        &self,
        turn: &Turn,
        provider: &dyn Provider,
        request: ResponseRequest,
    ) -> Result<Option<ResponseStream>, Error> {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let base_wait = Duration::from_millis(self.config.retry.rate_limit_wait_ms);

        for attempt in 1..=max_attempts {
            let opened = tokio::select! {
                biased;
                _ = turn.abort.cancelled() => return Ok(None),
                opened = provider.create_streaming_response(request.clone()) => opened,
            };
            let err = match opened {
                Ok(stream) => return Ok(Some(stream)),
                Err(err) => err,
            };

            match FailureClass::of(&err) {
                FailureClass::Transient if attempt < max_attempts => {
                    warn!(attempt, max_attempts, error = %err, "LLM request failed, retrying");
                }
                FailureClass::RateLimited { suggested } if attempt < max_attempts => {
                    let delay = suggested.unwrap_or_else(|| rate_limit_backoff(base_wait, attempt));
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Rate limit exceeded, backing off"
                    );
                    tokio::select! {
                        _ = turn.abort.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                FailureClass::RateLimited { .. } => {
                    self.end_turn(turn, messages::rate_limited(&err));
                    return Ok(None);
                }
                FailureClass::ContextTooLong => {
                    self.end_turn(turn, messages::CONTEXT_TOO_LONG.to_string());
                    return Ok(None);
                }
                FailureClass::Client => {
                    warn!(error = %err, "Provider rejected the request");
                    self.end_turn(turn, messages::client_error(&err));
                    return Ok(None);
                }
                FailureClass::Transient | FailureClass::Unclassified => return Err(err.into()),
            }
        }
        // Every attempt ends in a return or a retry; the last one never retries.
        Ok(None)
    }

    async fn consume_stream(
        &self,
        turn: &Turn,
        stream: &mut ResponseStream,
        output: &mut TurnOutput,
        last_response_id: &mut Option<String>,
    ) -> Result<(), Error> {
        while let Some(event) = stream.next_event().await {
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    if !self.is_current(turn.generation) {
                        return Ok(());
                    }
                    return Err(err.into());
                }
            };

            match event {
                StreamingEvent::OutputItemStart { .. } => {}
                StreamingEvent::OutputItemDelta { item_id, delta } => {
                    if self.is_current(turn.generation) {
                        self.sink.on_delta(&item_id, &delta);
                    }
                }
                StreamingEvent::OutputItemDone { item } => {
                    self.absorb_output_item(turn, output, item);
                }
                StreamingEvent::Completed { response } => {
                    debug!(response_id = %response.id, status = ?response.status, items = response.output.len(), "Response completed");
                    for item in response.output {
                        self.absorb_output_item(turn, output, item);
                    }
                    if self.is_current(turn.generation) {
                        self.sink.on_last_response_id(&response.id);
                    }
                    *last_response_id = Some(response.id);
                }
            }
        }
        Ok(())
    }

    /// Route one finished output item. Function calls are collected for
    /// execution and never delivered; everything else is staged. An item seen
    /// both as a streamed `done` and in the `completed` batch counts once.
    fn absorb_output_item(&self, turn: &Turn, output: &mut TurnOutput, mut item: ConversationItem) {
        if !self.is_current(turn.generation) {
            return;
        }

        if let ConversationItem::FunctionCall { id, call_id, .. } = &item {
            let call_id = if call_id.is_empty() { id.clone() } else { call_id.clone() };
            if !output.seen.insert(call_id.clone()) {
                return;
            }
            let already_processed = {
                let mut s = lock(&self.state);
                if !s.pending_aborts.contains(&call_id) {
                    s.pending_aborts.push(call_id.clone());
                }
                s.processed_calls.contains(&call_id)
            };
            if already_processed {
                debug!(call_id = %call_id, "Skipping function call that was already handled");
                return;
            }
            output.calls.push(item);
            return;
        }

        if !output.seen.insert(item.id().to_string()) {
            return;
        }
        if let ConversationItem::Reasoning { duration_ms, .. } = &mut item {
            *duration_ms = Some(turn.started.elapsed().as_millis() as u64);
        }
        turn.stager.stage(item);
    }

    async fn handle_function_call(&self, turn: &Turn, call: &ConversationItem) -> Vec<ConversationItem> {
        let ConversationItem::FunctionCall {
            id,
            call_id,
            name,
            arguments,
        } = call
        else {
            return Vec::new();
        };
        let call_id = if call_id.is_empty() { id.as_str() } else { call_id.as_str() };

        if !self.is_current(turn.generation) {
            return Vec::new();
        }
        lock(&self.state).processed_calls.insert(call_id.to_string());
        debug!(name = %name, call_id = %call_id, arguments = %arguments, "Handling function call");

        let Some(input) = parse_exec_arguments(arguments) else {
            return vec![ConversationItem::function_call_output(
                call_id,
                format!("invalid arguments: {arguments}"),
                None,
            )];
        };

        if !SHELL_TOOL_NAMES.contains(&name.as_str()) {
            warn!(name = %name, "Model called an unknown function");
            return vec![ConversationItem::function_call_output(call_id, "no function found", None)];
        }

        let outcome = handle_exec_command(
            input,
            &self.exec_session,
            self.approval_policy,
            self.confirmer.as_ref(),
            &turn.abort,
        )
        .await;

        let mut items = vec![ConversationItem::function_call_output(
            call_id,
            outcome.output,
            Some(outcome.metadata),
        )];
        items.extend(outcome.additional_items);
        items
    }

    /// Deliver a system message after everything already staged and stop
    /// loading.
    fn end_turn(&self, turn: &Turn, message: String) {
        turn.stager.stage(ConversationItem::system_text(message));
        turn.stager.flush();
        if self.is_current(turn.generation) {
            self.sink.on_loading(false);
        }
    }

    /// Turn stream-level failures into a system message; anything else goes
    /// back to the caller.
    fn absorb_failure(&self, turn: &Turn, err: ProviderError) -> Result<(), Error> {
        if matches!(err, ProviderError::StreamInterrupted(_)) {
            warn!(error = %err, "Stream closed prematurely");
            self.end_turn(turn, messages::PREMATURE_CLOSE.to_string());
            return Ok(());
        }
        if is_network_or_server(&err) {
            warn!(error = %err, "Network or server failure");
            self.end_turn(turn, messages::NETWORK.to_string());
            return Ok(());
        }
        self.sink.on_loading(false);
        Err(Error::Provider(err))
    }
}

/// Per-run context threaded through the turn.
struct Turn {
    generation: u64,
    /// This run's tool-execution token.
    abort: CancellationToken,
    stager: Stager,
    started: Instant,
}

#[derive(Default)]
struct TurnOutput {
    calls: Vec<ConversationItem>,
    /// Item ids and call ids already routed for the current response.
    seen: HashSet<String>,
}

/// Delayed, generation-gated delivery of items to the sink.
struct Stager {
    generation: u64,
    state: Arc<Mutex<LoopState>>,
    hard_abort: CancellationToken,
    sink: Arc<dyn AgentSink>,
    slots: Arc<Mutex<Vec<Option<ConversationItem>>>>,
}

impl Stager {
    fn new(
        generation: u64,
        state: Arc<Mutex<LoopState>>,
        hard_abort: CancellationToken,
        sink: Arc<dyn AgentSink>,
    ) -> Self {
        Self {
            generation,
            state,
            hard_abort,
            sink,
            slots: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn stage(&self, item: ConversationItem) {
        if lock(&self.state).generation != self.generation {
            return;
        }
        let index = {
            let mut slots = lock_slots(&self.slots);
            slots.push(Some(item));
            slots.len() - 1
        };

        let generation = self.generation;
        let state = self.state.clone();
        let hard_abort = self.hard_abort.clone();
        let sink = self.sink.clone();
        let slots = self.slots.clone();
        tokio::spawn(async move {
            tokio::time::sleep(STAGE_DELAY).await;
            if is_current(&state, &hard_abort, generation) {
                deliver(&slots, sink.as_ref(), Some(index));
            }
        });
    }

    /// Deliver everything not yet delivered, if the run is still current.
    fn flush(&self) {
        if is_current(&self.state, &self.hard_abort, self.generation) {
            deliver(&self.slots, self.sink.as_ref(), None);
        }
    }
}

fn lock_slots(
    slots: &Mutex<Vec<Option<ConversationItem>>>,
) -> MutexGuard<'_, Vec<Option<ConversationItem>>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Deliver pending slots in order, up to and including `through`.
fn deliver(slots: &Mutex<Vec<Option<ConversationItem>>>, sink: &dyn AgentSink, through: Option<usize>) {
    let mut slots = lock_slots(slots);
    let end = through.map_or(slots.len(), |index| (index + 1).min(slots.len()));
    for slot in slots[..end].iter_mut() {
        if let Some(item) = slot.take() {
            sink.on_item(item);
        }
    }
}
