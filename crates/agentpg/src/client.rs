// Client orchestrator
//
// Owns the store, the collaborator seams, the per-instance registries, and
// the background services. start/stop are idempotent; stop drains in-flight
// handlers within the configured grace period, then cancels what is left
// (those rows stay claimed and are rescued after the stuck timeout).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use agentpg_core::{
    AgentDefinition, EngineConfig, EngineError, ErrorType, Message, NewInstance, NewRun,
    NewSession, Result, Run, RunState, Session, StopReason, TokenUsage,
};
use agentpg_storage::{Notification, NotifyChannel, PostgresStore, Store};
use agentpg_worker::{
    CleanupCallbacks, CleanupService, Compactor, HeartbeatService, LeaderElector, LlmClient,
    RunWorker, Tool, ToolRegistry, ToolWorker,
};

/// Options for creating a session
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Tenant scope; "default" when unset
    pub tenant: Option<String>,

    /// Unique identifier within the tenant; generated when unset
    pub identifier: Option<String>,

    pub parent_session_id: Option<Uuid>,
    pub metadata: HashMap<String, String>,
}

/// Terminal result of a synchronous run
#[derive(Debug, Clone)]
pub struct Response {
    pub run_id: Uuid,
    pub state: RunState,

    /// The run's final assistant message, if any
    pub message: Option<Message>,

    /// Stop reason of the final iteration
    pub stop_reason: Option<StopReason>,

    pub usage: TokenUsage,
    pub error_message: Option<String>,
    pub error_type: Option<ErrorType>,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    cancel: CancellationToken,
    leadership_rx: watch::Receiver<bool>,
    run_semaphore: Arc<Semaphore>,
    tool_semaphore: Arc<Semaphore>,
    handles: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct Registrations {
    agents: Vec<AgentDefinition>,
    tools: ToolRegistry,
}

/// The public façade of the engine
///
/// # Example
///
/// ```ignore
/// let client = Client::connect("postgres://localhost/agentpg", llm, config).await?;
/// client.register_agent(AgentDefinition::new("chat", "claude-sonnet-4-5"))?;
/// client.start().await?;
///
/// let session = client.new_session(SessionOptions::default()).await?;
/// let response = client
///     .run_sync(&CancellationToken::new(), session.id, "chat", "hello", None)
///     .await?;
/// ```
pub struct Client {
    store: Arc<dyn Store>,
    llm: Arc<dyn LlmClient>,
    compactor: Option<Arc<dyn Compactor>>,
    config: EngineConfig,
    instance_id: Uuid,
    registrations: RwLock<Registrations>,
    running: RwLock<Option<Running>>,
}

impl Client {
    /// Create a client over any store implementation.
    pub fn new(
        store: Arc<dyn Store>,
        llm: Arc<dyn LlmClient>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            llm,
            compactor: None,
            config,
            instance_id: Uuid::now_v7(),
            registrations: RwLock::new(Registrations::default()),
            running: RwLock::new(None),
        })
    }

    /// Connect to PostgreSQL, run migrations, and start the notification
    /// listener.
    pub async fn connect(
        database_url: &str,
        llm: Arc<dyn LlmClient>,
        config: EngineConfig,
    ) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await
            .map_err(|e| EngineError::storage(e.to_string()))?;
        let store = PostgresStore::new(pool);
        store.migrate().await.map_err(EngineError::from)?;
        store.start_listener().await.map_err(EngineError::from)?;
        Self::new(Arc::new(store), llm, config)
    }

    pub fn with_compactor(mut self, compactor: Arc<dyn Compactor>) -> Self {
        self.compactor = Some(compactor);
        self
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Whether this instance currently holds the cleanup leader lease.
    pub fn is_leader(&self) -> bool {
        self.running
            .read()
            .unwrap()
            .as_ref()
            .is_some_and(|r| *r.leadership_rx.borrow())
    }

    fn is_running(&self) -> bool {
        self.running.read().unwrap().is_some()
    }

    // =========================================================================
    // Registration (before start)
    // =========================================================================

    /// Declare an agent this instance can run. Must be called before
    /// [`Client::start`].
    pub fn register_agent(&self, definition: AgentDefinition) -> Result<()> {
        if self.is_running() {
            return Err(EngineError::validation(
                "register_agent must be called before start",
            ));
        }
        self.registrations.write().unwrap().agents.push(definition);
        Ok(())
    }

    /// Register a locally executable tool. Must be called before
    /// [`Client::start`].
    pub fn register_tool(&self, tool: impl Tool + 'static) -> Result<()> {
        if self.is_running() {
            return Err(EngineError::validation(
                "register_tool must be called before start",
            ));
        }
        self.registrations.write().unwrap().tools.register(tool);
        Ok(())
    }

    /// Upsert an agent definition globally and link it to this instance.
    pub async fn get_or_create_agent(&self, definition: AgentDefinition) -> Result<AgentDefinition> {
        self.store.upsert_agent(&definition).await?;
        self.store
            .link_instance_agent(self.instance_id, &definition.name)
            .await?;
        self.store
            .get_agent(&definition.name)
            .await?
            .ok_or_else(|| EngineError::internal("agent vanished between upsert and read"))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Register the instance and start heartbeat, elector, cleanup, and the
    /// worker pools. Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        self.config.validate()?;

        let mut instance = NewInstance::new(
            self.instance_id,
            self.config.max_concurrent_runs as i32,
            self.config.max_concurrent_tools as i32,
        );
        if let Some(name) = &self.config.instance_name {
            instance = instance.with_name(name.clone());
        }
        self.store.register_instance(instance.clone()).await?;

        // Publish this instance's capabilities
        let (agents, tool_definitions, registry) = {
            let registrations = self.registrations.read().unwrap();
            (
                registrations.agents.clone(),
                registrations.tools.definitions(),
                registrations.tools.clone(),
            )
        };
        for agent in &agents {
            self.store.upsert_agent(agent).await?;
            self.store
                .link_instance_agent(self.instance_id, &agent.name)
                .await?;
        }
        for definition in &tool_definitions {
            self.store.upsert_tool(definition).await?;
            self.store
                .link_instance_tool(self.instance_id, &definition.name)
                .await?;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        let heartbeat = HeartbeatService::new(
            Arc::clone(&self.store),
            instance,
            self.config.heartbeat_interval,
            shutdown_rx.clone(),
        );
        handles.push(tokio::spawn(heartbeat.run()));

        let (elector, leadership_rx) = LeaderElector::new(
            Arc::clone(&self.store),
            self.instance_id,
            self.config.leader_ttl,
            self.config.election_period,
            self.config.reelection_delay,
            shutdown_rx.clone(),
        );
        handles.push(tokio::spawn(elector.run()));

        let cleanup = CleanupService::new(
            Arc::clone(&self.store),
            self.config.clone(),
            leadership_rx.clone(),
            shutdown_rx.clone(),
        )
        .with_callbacks(CleanupCallbacks::default());
        handles.push(tokio::spawn(cleanup.run()));

        let run_worker = RunWorker::new(
            Arc::clone(&self.store),
            Arc::clone(&self.llm),
            self.compactor.clone(),
            self.instance_id,
            self.config.clone(),
            shutdown_rx.clone(),
            cancel.child_token(),
        );
        let run_semaphore = run_worker.semaphore();
        handles.push(tokio::spawn(run_worker.run()));

        let tool_worker = ToolWorker::new(
            Arc::clone(&self.store),
            registry,
            self.instance_id,
            self.config.clone(),
            shutdown_rx.clone(),
            cancel.child_token(),
        );
        let tool_semaphore = tool_worker.semaphore();
        handles.push(tokio::spawn(tool_worker.run()));

        *self.running.write().unwrap() = Some(Running {
            shutdown_tx,
            cancel,
            leadership_rx,
            run_semaphore,
            tool_semaphore,
            handles,
        });

        info!(instance_id = %self.instance_id, "client started");
        Ok(())
    }

    /// Drain in-flight work within the grace period, stop the services, and
    /// deregister the instance. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.write().unwrap().take() else {
            return Ok(());
        };

        let _ = running.shutdown_tx.send(true);

        // Drain the pools; whatever survives the grace period is cancelled
        // and left claimed for rescue
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        loop {
            let runs_free = running.run_semaphore.available_permits();
            let tools_free = running.tool_semaphore.available_permits();
            if runs_free == self.config.max_concurrent_runs
                && tools_free == self.config.max_concurrent_tools
            {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    in_flight_runs = self.config.max_concurrent_runs - runs_free,
                    in_flight_tools = self.config.max_concurrent_tools - tools_free,
                    "shutdown grace elapsed, cancelling in-flight handlers"
                );
                running.cancel.cancel();
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        for handle in running.handles {
            let _ = handle.await;
        }

        self.store.deregister_instance(self.instance_id).await?;
        info!(instance_id = %self.instance_id, "client stopped");
        Ok(())
    }

    // =========================================================================
    // Sessions and runs
    // =========================================================================

    pub async fn new_session(&self, options: SessionOptions) -> Result<Session> {
        let mut new = NewSession::new(
            options.tenant.unwrap_or_else(|| "default".to_string()),
            options
                .identifier
                .unwrap_or_else(|| Uuid::now_v7().to_string()),
        )
        .with_metadata(options.metadata);

        if let Some(parent_id) = options.parent_session_id {
            let parent = self.store.get_session(parent_id).await?;
            new = new.with_parent(&parent);
        }

        Ok(self.store.create_session(new).await?)
    }

    /// Create a run and return immediately.
    pub async fn run_async(
        &self,
        session_id: Uuid,
        agent_name: &str,
        prompt: &str,
        variables: Option<HashMap<String, String>>,
    ) -> Result<Uuid> {
        // Unknown agents fail synchronously, never in the background
        if self.store.get_agent(agent_name).await?.is_none() {
            return Err(EngineError::validation(format!(
                "agent '{}' is not registered",
                agent_name
            )));
        }
        self.store.get_session(session_id).await?;

        let run = self
            .store
            .create_run(NewRun {
                created_by_instance_id: Some(self.instance_id),
                metadata: variables.unwrap_or_default(),
                ..NewRun::new(session_id, agent_name, prompt)
            })
            .await?;
        debug!(run_id = %run.id, agent = agent_name, "run created");
        Ok(run.id)
    }

    /// Create a run and block until it reaches a terminal state.
    ///
    /// Cancelling `cancel` cancels the run and returns
    /// [`EngineError::Cancelled`].
    pub async fn run_sync(
        &self,
        cancel: &CancellationToken,
        session_id: Uuid,
        agent_name: &str,
        prompt: &str,
        variables: Option<HashMap<String, String>>,
    ) -> Result<Response> {
        // Subscribe before creating the run so no transition is missed
        let mut events = self.store.subscribe(NotifyChannel::RunState);
        let run_id = self
            .run_async(session_id, agent_name, prompt, variables)
            .await?;

        let mut ticker = tokio::time::interval(self.config.run_poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = self.cancel_run(run_id).await {
                        debug!(%run_id, "cancel on caller abort failed: {}", e);
                    }
                    return Err(EngineError::Cancelled);
                }
                event = events.recv() => {
                    match event {
                        Ok(Notification::RunState { run_id: id, state })
                            if id == run_id && state.is_terminal() => {}
                        Ok(_) => continue,
                        // Lagged: fall through to a poll
                        Err(_) => {}
                    }
                }
                _ = ticker.tick() => {}
            }

            let run = self.store.get_run(run_id).await?;
            if run.is_terminal() {
                return self.build_response(run).await;
            }
        }
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Run> {
        Ok(self.store.get_run(run_id).await?)
    }

    /// Explicit cancellation: the run goes to cancelled and its non-terminal
    /// tool executions to skipped.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<Run> {
        Ok(self.store.cancel_run(run_id).await?)
    }

    async fn build_response(&self, run: Run) -> Result<Response> {
        let stop_reason = match run.current_iteration_id {
            Some(iteration_id) => self
                .store
                .get_iteration(iteration_id)
                .await
                .ok()
                .and_then(|i| i.stop_reason),
            None => None,
        };

        let message = self
            .store
            .list_run_messages(run.id)
            .await?
            .into_iter()
            .filter(|m| m.role == agentpg_core::MessageRole::Assistant)
            .filter(|m| !m.content.is_empty())
            .next_back();

        Ok(Response {
            run_id: run.id,
            state: run.state,
            message,
            stop_reason,
            usage: run.usage,
            error_message: run.error_message,
            error_type: run.error_type,
        })
    }
}
