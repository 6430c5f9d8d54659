// Run worker
//
// Claims runs and drives each one through a single step of its state
// machine: assemble context, open an iteration, call the model, persist the
// assistant message, and dispatch on the stop reason. Tool fan-out happens
// in the same transaction as the pending_tools transition. The pool is
// bounded by a semaphore; claim batches never exceed the free slots, so the
// database yields no more work than this instance can start.

use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use agentpg_core::{
    tool_uses, AgentDefinition, ContentBlock, EngineConfig, ErrorType, IterationResult, Message,
    MessageRole, NewMessage, NewToolExecution, Run, RunMode, RunState, RunUpdates, ToolDefinition,
};
use agentpg_storage::{NewCompactionEvent, NotifyChannel, Store, StoreError};
use tokio_util::sync::CancellationToken;

use crate::backoff::RetryPolicy;
use crate::compaction::Compactor;
use crate::llm::{LlmClient, LlmError, LlmOutcome, LlmRequest};

/// Bounded in-place retries for transient LLM errors; after these the run
/// stays claimed and waits for rescue.
const LLM_RETRY_ATTEMPTS: i32 = 3;

/// How a handler step ended when it could not transition the run itself
enum HandlerError {
    /// Transition the run to failed with this classification
    Fail { error_type: ErrorType, message: String },

    /// Leave the run claimed; cleanup rescues it after the stuck timeout
    LeaveClaimed(String),
}

pub struct RunWorker {
    store: Arc<dyn Store>,
    llm: Arc<dyn LlmClient>,
    compactor: Option<Arc<dyn Compactor>>,
    instance_id: Uuid,
    config: EngineConfig,
    shutdown_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
}

impl RunWorker {
    pub fn new(
        store: Arc<dyn Store>,
        llm: Arc<dyn LlmClient>,
        compactor: Option<Arc<dyn Compactor>>,
        instance_id: Uuid,
        config: EngineConfig,
        shutdown_rx: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_runs));
        Self {
            store,
            llm,
            compactor,
            instance_id,
            config,
            shutdown_rx,
            cancel,
            semaphore,
        }
    }

    /// Permits currently in use; the client's drain loop watches this.
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrent_runs - self.semaphore.available_permits()
    }

    pub fn semaphore(&self) -> Arc<Semaphore> {
        Arc::clone(&self.semaphore)
    }

    pub async fn run(mut self) {
        let mut events = self.store.subscribe(NotifyChannel::RunState);
        let mut ticker = tokio::time::interval(self.config.run_poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                event = events.recv() => {
                    // Lagged receivers just fall back to the poll cadence
                    if event.is_err() {
                        continue;
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *self.shutdown_rx.borrow() {
                break;
            }

            let available = self.semaphore.available_permits();
            if available == 0 {
                continue;
            }
            let batch = self.config.claim_batch_size.min(available);

            let claimed = match self.store.claim_runs(self.instance_id, batch, None).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!("claiming runs failed: {}", e);
                    continue;
                }
            };

            for run in claimed {
                let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                    // Free slots were counted above; a race here just means
                    // the run waits for the next poll on another instance
                    break;
                };

                let store = Arc::clone(&self.store);
                let llm = Arc::clone(&self.llm);
                let compactor = self.compactor.clone();
                let config = self.config.clone();
                let cancel = self.cancel.child_token();

                tokio::spawn(async move {
                    let run_id = run.id;
                    let handler = RunHandler {
                        store: Arc::clone(&store),
                        llm,
                        compactor,
                        config,
                        cancel,
                    };

                    let outcome = std::panic::AssertUnwindSafe(handler.step(run))
                        .catch_unwind()
                        .await;

                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(HandlerError::Fail { error_type, message })) => {
                            fail_run(&store, run_id, error_type, message).await;
                        }
                        Ok(Err(HandlerError::LeaveClaimed(reason))) => {
                            warn!(%run_id, "run left claimed for rescue: {}", reason);
                        }
                        Err(_) => {
                            error!(%run_id, "run handler panicked");
                            fail_run(
                                &store,
                                run_id,
                                ErrorType::Internal,
                                "run handler panicked".to_string(),
                            )
                            .await;
                        }
                    }
                    drop(permit);
                });
            }
        }
        debug!(instance_id = %self.instance_id, "run worker stopped");
    }
}

/// Transition a run to failed, tolerating a concurrent transition having won.
async fn fail_run(store: &Arc<dyn Store>, run_id: Uuid, error_type: ErrorType, message: String) {
    let updates = RunUpdates {
        error_message: Some(message),
        error_type: Some(error_type),
        ..Default::default()
    };
    match store.update_run_state(run_id, RunState::Failed, updates).await {
        Ok(_) => {}
        Err(StoreError::InvalidTransition { .. }) => {
            debug!(%run_id, "fail transition lost to a concurrent one");
        }
        Err(e) => error!(%run_id, "failing run failed: {}", e),
    }
}

struct RunHandler {
    store: Arc<dyn Store>,
    llm: Arc<dyn LlmClient>,
    compactor: Option<Arc<dyn Compactor>>,
    config: EngineConfig,
    cancel: CancellationToken,
}

impl RunHandler {
    /// Drive one claimed run through one iteration.
    #[instrument(skip(self, run), fields(run_id = %run.id, agent = %run.agent_name))]
    async fn step(&self, run: Run) -> Result<(), HandlerError> {
        let agent = self
            .store
            .get_agent(&run.agent_name)
            .await
            .map_err(store_leave)?
            .ok_or_else(|| HandlerError::Fail {
                error_type: ErrorType::Internal,
                message: format!("agent '{}' is not registered", run.agent_name),
            })?;

        let mut context = self.load_context(&run).await?;

        if self.maybe_compact(&run, &agent, &context).await? {
            context = self.load_context(&run).await?;
        }

        let iteration = self
            .store
            .create_iteration(
                run.id,
                run.run_mode == RunMode::Streaming,
                context.iter().map(|m| m.id).collect(),
            )
            .await
            .map_err(store_leave)?;

        let request = LlmRequest {
            model: agent.model.clone(),
            system_prompt: agent.system_prompt.clone(),
            tools: self.tool_definitions(&agent).await,
            messages: context,
            max_tokens: agent.max_tokens,
            temperature: agent.temperature,
            run_mode: run.run_mode,
        };

        let outcome = match self.invoke_with_retry(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let (error_type, handler_error) = classify_llm_error(e);
                let _ = self
                    .store
                    .record_iteration_error(
                        iteration.id,
                        error_type,
                        &handler_error_message(&handler_error),
                    )
                    .await;
                return Err(handler_error);
            }
        };

        // Persist the assistant message, then close the iteration
        let message = self
            .store
            .insert_message(NewMessage::assistant(
                run.session_id,
                run.id,
                outcome.content.clone(),
                Some(outcome.usage),
            ))
            .await
            .map_err(store_leave)?;

        let uses = tool_uses(&outcome.content);
        self.store
            .complete_iteration(
                iteration.id,
                IterationResult {
                    response_message_id: message.id,
                    stop_reason: outcome.stop_reason.clone(),
                    has_tool_use: !uses.is_empty(),
                    tool_execution_count: uses.len() as i32,
                    usage: outcome.usage,
                },
            )
            .await
            .map_err(store_leave)?;

        self.dispatch(&run, iteration.id, outcome).await
    }

    /// Root runs see the whole depth-0 conversation; nested runs see only
    /// their own sub-dialog.
    async fn load_context(&self, run: &Run) -> Result<Vec<Message>, HandlerError> {
        let context = if run.depth == 0 {
            self.store.list_root_context(run.session_id).await
        } else {
            self.store.list_run_messages(run.id).await
        }
        .map_err(store_leave)?;
        Ok(context)
    }

    async fn tool_definitions(&self, agent: &AgentDefinition) -> Vec<ToolDefinition> {
        let fleet_tools = self
            .store
            .list_fleet_tools(self.config.instance_ttl)
            .await
            .unwrap_or_default();

        let mut definitions = Vec::with_capacity(agent.tools.len());
        for name in &agent.tools {
            // Agent-as-tool entries synthesize a one-field prompt schema
            if let Ok(Some(inner)) = self.store.get_agent(name).await {
                definitions.push(ToolDefinition::new(
                    inner.name.clone(),
                    format!("Delegate a task to the '{}' agent", inner.name),
                    serde_json::json!({
                        "type": "object",
                        "properties": {
                            "prompt": { "type": "string", "description": "Task for the agent" }
                        },
                        "required": ["prompt"]
                    }),
                ));
            } else if let Some(def) = fleet_tools.iter().find(|t| &t.name == name) {
                definitions.push(def.clone());
            }
        }
        definitions
    }

    async fn invoke_with_retry(&self, request: LlmRequest) -> Result<LlmOutcome, LlmError> {
        let policy = RetryPolicy::exponential()
            .with_max_interval(std::time::Duration::from_secs(10))
            .with_jitter(0.1);

        let mut attempt = 1;
        loop {
            match self.llm.invoke(&self.cancel, request.clone()).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.retryable() && attempt < LLM_RETRY_ATTEMPTS => {
                    let delay = policy.delay_for_attempt(attempt + 1);
                    warn!("transient LLM error (attempt {}): {}", attempt, e);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Err(LlmError::Cancelled),
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Apply the stop reason to the run state machine.
    async fn dispatch(
        &self,
        run: &Run,
        iteration_id: Uuid,
        outcome: LlmOutcome,
    ) -> Result<(), HandlerError> {
        let usage = outcome.usage;
        let next_state = outcome.stop_reason.next_run_state();

        let result = match next_state {
            RunState::PendingTools => {
                let params = self.tool_execution_params(run, iteration_id, &outcome).await?;
                self.store
                    .create_tool_executions_and_update_run_state(
                        params,
                        run.id,
                        RunState::PendingTools,
                        RunUpdates {
                            usage_delta: Some(usage),
                            increment_tool_iterations: true,
                            ..Default::default()
                        },
                    )
                    .await
                    .map(|_| ())
            }
            RunState::Failed => {
                // Stop reason refusal
                self.store
                    .update_run_state(
                        run.id,
                        RunState::Failed,
                        RunUpdates {
                            error_message: Some("model refused the request".into()),
                            error_type: Some(ErrorType::Refusal),
                            usage_delta: Some(usage),
                            ..Default::default()
                        },
                    )
                    .await
                    .map(|_| ())
            }
            state => self
                .store
                .update_run_state(
                    run.id,
                    state,
                    RunUpdates {
                        usage_delta: Some(usage),
                        ..Default::default()
                    },
                )
                .await
                .map(|_| ()),
        };

        match result {
            Ok(()) => Ok(()),
            Err(StoreError::InvalidTransition { .. }) => {
                // The run was cancelled (or otherwise moved) underneath us
                debug!(run_id = %run.id, "dispatch lost to a concurrent transition");
                Ok(())
            }
            Err(e) => Err(store_leave(e)),
        }
    }

    async fn tool_execution_params(
        &self,
        run: &Run,
        iteration_id: Uuid,
        outcome: &LlmOutcome,
    ) -> Result<Vec<NewToolExecution>, HandlerError> {
        let uses = tool_uses(&outcome.content);
        if uses.is_empty() {
            return Err(HandlerError::Fail {
                error_type: ErrorType::Api,
                message: "stop reason tool_use with no tool_use blocks".into(),
            });
        }

        let mut params = Vec::with_capacity(uses.len());
        for tool_use in uses {
            let is_agent = self
                .store
                .get_agent(tool_use.name)
                .await
                .map_err(store_leave)?
                .is_some();
            params.push(NewToolExecution {
                run_id: run.id,
                iteration_id,
                tool_use_id: tool_use.id.to_string(),
                tool_name: tool_use.name.to_string(),
                tool_input: tool_use.input.clone(),
                is_agent_tool: is_agent,
                agent_name: is_agent.then(|| tool_use.name.to_string()),
                max_attempts: self.config.max_tool_attempts,
            });
        }
        Ok(params)
    }

    /// Compact the session when configured and past the trigger. Returns
    /// whether a compaction happened. Compaction failures never fail the
    /// run.
    async fn maybe_compact(
        &self,
        run: &Run,
        agent: &AgentDefinition,
        context: &[Message],
    ) -> Result<bool, HandlerError> {
        let Some(compactor) = &self.compactor else {
            return Ok(false);
        };
        if !agent.auto_compaction || run.depth != 0 {
            return Ok(false);
        }

        let tokens = self
            .store
            .session_token_count(run.session_id)
            .await
            .map_err(store_leave)?;
        if tokens <= self.config.compaction_trigger {
            return Ok(false);
        }

        let outcome = match compactor
            .compact(&self.cancel, context, self.config.compaction_trigger)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(run_id = %run.id, "compaction failed, continuing uncompacted: {}", e);
                return Ok(false);
            }
        };

        let summary = self
            .store
            .insert_message(NewMessage {
                session_id: run.session_id,
                run_id: None,
                role: MessageRole::System,
                content: vec![ContentBlock::text(outcome.summary.clone())],
                usage: None,
                preserved: true,
                summary: true,
            })
            .await
            .map_err(store_leave)?;

        let preserved: std::collections::HashSet<Uuid> =
            outcome.preserved_message_ids.iter().copied().collect();
        let archived: Vec<Uuid> = context
            .iter()
            .filter(|m| !m.preserved && !preserved.contains(&m.id))
            .map(|m| m.id)
            .collect();
        self.store
            .archive_messages(&archived)
            .await
            .map_err(store_leave)?;

        self.store
            .record_compaction_event(NewCompactionEvent {
                session_id: run.session_id,
                preserved_message_ids: outcome.preserved_message_ids,
                summary_message_id: Some(summary.id),
                strategy: outcome.strategy,
                duration_ms: outcome.duration.as_millis() as i64,
            })
            .await
            .map_err(store_leave)?;
        self.store
            .increment_session_compaction(run.session_id)
            .await
            .map_err(store_leave)?;

        debug!(run_id = %run.id, archived = archived.len(), "compacted session");
        Ok(true)
    }
}

/// Storage errors inside a handler leave the run claimed: the row is still
/// bound to this instance and rescue will reclaim it if we never recover.
fn store_leave(e: StoreError) -> HandlerError {
    HandlerError::LeaveClaimed(e.to_string())
}

fn classify_llm_error(e: LlmError) -> (ErrorType, HandlerError) {
    match e {
        LlmError::Refusal(message) => (
            ErrorType::Refusal,
            HandlerError::Fail {
                error_type: ErrorType::Refusal,
                message,
            },
        ),
        LlmError::InvalidRequest(message) => (
            ErrorType::Api,
            HandlerError::Fail {
                error_type: ErrorType::Api,
                message,
            },
        ),
        LlmError::Cancelled => (
            ErrorType::Cancelled,
            HandlerError::LeaveClaimed("LLM invocation cancelled".into()),
        ),
        // Transient errors that outlived the in-place retry budget
        e => (ErrorType::Api, HandlerError::LeaveClaimed(e.to_string())),
    }
}

fn handler_error_message(error: &HandlerError) -> String {
    match error {
        HandlerError::Fail { message, .. } => message.clone(),
        HandlerError::LeaveClaimed(message) => message.clone(),
    }
}
