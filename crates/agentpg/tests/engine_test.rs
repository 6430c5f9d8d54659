//! End-to-end engine tests against MemoryStore and a scripted LLM
//!
//! These drive the full client: worker pools, leader election, cleanup,
//! fan-out/fan-in, agent-as-tool, and cancellation, with intervals shrunk
//! so each scenario settles in well under a second of wall clock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use agentpg::client::{Client, SessionOptions};
use agentpg_core::{
    AgentDefinition, ContentBlock, EngineConfig, EngineError, ErrorType, MessageRole, RunState,
    StopReason, ToolExecutionState,
};
use agentpg_storage::{MemoryStore, Store};
use agentpg_worker::{
    CalcTool, HangingLlm, LlmClient, LlmScript, ScriptedLlm, ScriptedToolUse, Tool, ToolOutcome,
};

fn test_config() -> EngineConfig {
    EngineConfig::default()
        .with_run_poll_interval(Duration::from_millis(20))
        .with_tool_poll_interval(Duration::from_millis(10))
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_leader_ttl(Duration::from_millis(500))
        .with_election_period(Duration::from_millis(50))
        .with_reelection_delay(Duration::from_millis(25))
        .with_cleanup_interval(Duration::from_millis(50))
        .with_shutdown_grace(Duration::from_secs(2))
}

fn client_over(
    store: &Arc<MemoryStore>,
    llm: Arc<dyn LlmClient>,
    config: EngineConfig,
) -> Client {
    Client::new(Arc::clone(store) as Arc<dyn Store>, llm, config).expect("config is valid")
}

async fn wait_for<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Scenario 1: single turn, no tools
// ============================================================================

#[tokio::test]
async fn single_turn_completes() {
    let store = Arc::new(MemoryStore::new());
    let llm = Arc::new(ScriptedLlm::new().then_text("Hello! How can I help you today?"));
    let client = client_over(&store, llm, test_config());

    client
        .register_agent(AgentDefinition::new("chat", "test-model"))
        .unwrap();
    client.start().await.unwrap();

    let session = client.new_session(SessionOptions::default()).await.unwrap();
    let response = tokio::time::timeout(
        Duration::from_secs(5),
        client.run_sync(&CancellationToken::new(), session.id, "chat", "hello", None),
    )
    .await
    .expect("run_sync finished")
    .unwrap();

    assert_eq!(response.state, RunState::Completed);
    assert_eq!(response.stop_reason, Some(StopReason::EndTurn));
    let message = response.message.expect("final assistant message");
    assert!(!message.text().is_empty());

    let run = client.get_run(response.run_id).await.unwrap();
    assert!(run.finalized_at.is_some());
    assert_eq!(run.tool_iterations, 0);
    assert_eq!(store.tool_execution_count(), 0);
    // Exactly one iteration, numbered 0
    let iteration = store
        .get_iteration(run.current_iteration_id.unwrap())
        .await
        .unwrap();
    assert_eq!(iteration.iteration_number, 0);
    assert!(iteration.completed_at.is_some());

    client.stop().await.unwrap();
}

// ============================================================================
// Scenario 2: tool fan-out and fan-in
// ============================================================================

#[tokio::test]
async fn tool_fan_out_completes_with_ordered_results() {
    let store = Arc::new(MemoryStore::new());
    let llm = Arc::new(
        ScriptedLlm::new()
            .then(LlmScript::ToolUse {
                text: Some("Let me compute both.".into()),
                calls: vec![
                    ScriptedToolUse::new("calc", json!({"expr": "2+2"})),
                    ScriptedToolUse::new("calc", json!({"expr": "3+3"})),
                ],
            })
            .then_text("The answers are 4 and 6."),
    );
    let client = client_over(&store, llm, test_config());

    client
        .register_agent(AgentDefinition::new("chat", "test-model").with_tools(["calc"]))
        .unwrap();
    client.register_tool(CalcTool).unwrap();
    client.start().await.unwrap();

    let session = client.new_session(SessionOptions::default()).await.unwrap();
    let response = tokio::time::timeout(
        Duration::from_secs(5),
        client.run_sync(
            &CancellationToken::new(),
            session.id,
            "chat",
            "compute 2+2 and 3+3",
            None,
        ),
    )
    .await
    .expect("run_sync finished")
    .unwrap();

    assert_eq!(response.state, RunState::Completed);
    let text = response.message.expect("final message").text();
    assert!(text.contains('4') && text.contains('6'), "got: {}", text);

    let run = client.get_run(response.run_id).await.unwrap();
    assert_eq!(run.tool_iterations, 1);

    // Exactly two executions, both completed
    assert_eq!(store.tool_execution_count(), 2);
    let messages = store.list_run_messages(run.id).await.unwrap();
    let tool_result_message = messages
        .iter()
        .find(|m| {
            m.role == MessageRole::Assistant
                && m.content
                    .iter()
                    .all(|b| matches!(b, ContentBlock::ToolResult { .. }))
                && !m.content.is_empty()
        })
        .expect("aggregated tool_result message");

    // Results ordered by the original tool_use block order
    match (&tool_result_message.content[0], &tool_result_message.content[1]) {
        (
            ContentBlock::ToolResult { tool_use_id: a, content: ca, is_error: ea },
            ContentBlock::ToolResult { tool_use_id: b, content: cb, is_error: eb },
        ) => {
            assert!(a < b, "results out of tool_use order: {} then {}", a, b);
            assert_eq!(ca, "4");
            assert_eq!(cb, "6");
            assert!(!ea && !eb);
        }
        other => panic!("unexpected content: {:?}", other),
    }

    client.stop().await.unwrap();
}

// ============================================================================
// Scenario 3: failover — a dead claimer's run is rescued and completed
// ============================================================================

#[tokio::test]
async fn dead_instance_run_is_rescued_and_completed() {
    let store = Arc::new(MemoryStore::new());

    // Seed the run and claim it from an instance that dies without a trace
    // (no heartbeat row, no graceful stop)
    let session = store
        .create_session(agentpg_core::NewSession::new("default", "failover"))
        .await
        .unwrap();
    let run = store
        .create_run(agentpg_core::NewRun::new(session.id, "chat", "hello"))
        .await
        .unwrap();
    let dead_instance = Uuid::now_v7();
    let claimed = store.claim_runs(dead_instance, 1, None).await.unwrap();
    assert_eq!(claimed[0].id, run.id);

    // Past the stuck-run timeout on the database clock
    store.advance_clock(Duration::from_secs(3700));

    let llm = Arc::new(ScriptedLlm::new().then_text("recovered and done"));
    let survivor = client_over(&store, llm, test_config());
    survivor
        .register_agent(AgentDefinition::new("chat", "test-model"))
        .unwrap();
    survivor.start().await.unwrap();

    wait_for("rescued run to complete", || {
        let runs = store.runs();
        runs.iter()
            .any(|r| r.id == run.id && r.state == RunState::Completed)
    })
    .await;

    let rescued = store.get_run(run.id).await.unwrap();
    assert_eq!(rescued.rescue_attempts, 1);
    assert_eq!(rescued.state, RunState::Completed);
    assert!(rescued.finalized_at.is_some());

    survivor.stop().await.unwrap();
}

// ============================================================================
// Scenario 4: leader uniqueness across three instances
// ============================================================================

#[tokio::test]
async fn at_most_one_leader_and_clean_succession() {
    let store = Arc::new(MemoryStore::new());
    let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlm::new());

    let clients: Vec<Client> = (0..3)
        .map(|_| client_over(&store, Arc::clone(&llm), test_config()))
        .collect();
    for client in &clients {
        client.start().await.unwrap();
    }

    wait_for("a leader to emerge", || {
        clients.iter().filter(|c| c.is_leader()).count() == 1
    })
    .await;

    // Sample repeatedly: never more than one leader
    for _ in 0..20 {
        assert!(
            clients.iter().filter(|c| c.is_leader()).count() <= 1,
            "multiple leaders observed"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The leader exits cleanly; a successor is elected
    let leader_index = clients
        .iter()
        .position(|c| c.is_leader())
        .expect("one leader");
    clients[leader_index].stop().await.unwrap();

    wait_for("a successor", || {
        clients
            .iter()
            .enumerate()
            .any(|(i, c)| i != leader_index && c.is_leader())
    })
    .await;

    for (i, client) in clients.iter().enumerate() {
        if i != leader_index {
            client.stop().await.unwrap();
        }
    }
}

// ============================================================================
// Scenario 5: agent-as-tool
// ============================================================================

#[tokio::test]
async fn agent_as_tool_runs_child_and_feeds_parent() {
    let store = Arc::new(MemoryStore::new());
    let llm = Arc::new(
        ScriptedLlm::new()
            .script_for(
                "outer-model",
                vec![
                    LlmScript::ToolUse {
                        text: None,
                        calls: vec![ScriptedToolUse::new(
                            "inner",
                            json!({"prompt": "what time is it"}),
                        )],
                    },
                    LlmScript::Text("Inner reports: it is noon.".into()),
                ],
            )
            .script_for("inner-model", vec![LlmScript::Text("it is noon".into())]),
    );
    let client = client_over(&store, llm, test_config());

    client
        .register_agent(AgentDefinition::new("outer", "outer-model").with_tools(["inner"]))
        .unwrap();
    client
        .register_agent(AgentDefinition::new("inner", "inner-model"))
        .unwrap();
    client.start().await.unwrap();

    let session = client.new_session(SessionOptions::default()).await.unwrap();
    let response = tokio::time::timeout(
        Duration::from_secs(5),
        client.run_sync(
            &CancellationToken::new(),
            session.id,
            "outer",
            "ask inner for the time",
            None,
        ),
    )
    .await
    .expect("run_sync finished")
    .unwrap();

    assert_eq!(response.state, RunState::Completed);
    assert!(response.message.unwrap().text().contains("noon"));

    // Two runs: the outer and its child at depth 1
    let runs = store.runs();
    assert_eq!(runs.len(), 2);
    let outer = runs.iter().find(|r| r.agent_name == "outer").unwrap();
    let child = runs.iter().find(|r| r.agent_name == "inner").unwrap();
    assert_eq!(child.depth, 1);
    assert_eq!(child.parent_run_id, Some(outer.id));
    assert_eq!(child.state, RunState::Completed);
    assert_eq!(child.prompt, "what time is it");

    // The execution is an agent tool whose output came from the child
    let execution = store
        .get_tool_execution(child.parent_tool_execution_id.unwrap())
        .await
        .unwrap();
    assert!(execution.is_agent_tool);
    assert_eq!(execution.agent_name.as_deref(), Some("inner"));
    assert_eq!(execution.child_run_id, Some(child.id));
    assert_eq!(execution.state, ToolExecutionState::Completed);
    assert_eq!(execution.tool_output.as_deref(), Some("it is noon"));

    // The child ran in its own session, nested under the parent's
    let child_session = store.get_session(child.session_id).await.unwrap();
    assert_eq!(child_session.parent_session_id, Some(session.id));
    assert_eq!(child_session.depth, 1);

    // Depth filter: the parent's conversation context excludes the child's
    // sub-dialog
    let context = store.list_root_context(session.id).await.unwrap();
    assert!(context.iter().all(|m| m.run_id == Some(outer.id)));

    client.stop().await.unwrap();
}

// ============================================================================
// Scenario 6: cancellation mid-run
// ============================================================================

/// A tool that never finishes on its own
struct StuckTool;

#[async_trait]
impl Tool for StuckTool {
    fn name(&self) -> &str {
        "stuck"
    }

    async fn execute(&self, _input: serde_json::Value) -> ToolOutcome {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        ToolOutcome::success("never")
    }
}

#[tokio::test]
async fn cancellation_cancels_run_and_skips_tools() {
    let store = Arc::new(MemoryStore::new());
    let llm = Arc::new(ScriptedLlm::new().then(LlmScript::ToolUse {
        text: None,
        calls: vec![ScriptedToolUse::new("stuck", json!({}))],
    }));
    let client = client_over(&store, llm, test_config());

    client
        .register_agent(AgentDefinition::new("chat", "test-model").with_tools(["stuck"]))
        .unwrap();
    client.register_tool(StuckTool).unwrap();
    client.start().await.unwrap();

    let session = client.new_session(SessionOptions::default()).await.unwrap();
    let cancel = CancellationToken::new();

    let run_store = Arc::clone(&store);
    let cancel_trigger = cancel.clone();
    tokio::spawn(async move {
        // Cancel once the first iteration has fanned out
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if run_store
                .runs()
                .iter()
                .any(|r| r.state == RunState::PendingTools)
            {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel_trigger.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        client.run_sync(&cancel, session.id, "chat", "get stuck", None),
    )
    .await
    .expect("run_sync returned promptly");
    assert!(matches!(result, Err(EngineError::Cancelled)));

    let run = store.runs().into_iter().next().expect("run exists");
    wait_for("run to be cancelled", || {
        let runs = store.runs();
        runs.iter()
            .any(|r| r.id == run.id && r.state == RunState::Cancelled)
    })
    .await;

    let cancelled = store.get_run(run.id).await.unwrap();
    assert_eq!(cancelled.error_type, Some(ErrorType::Cancelled));
    assert!(cancelled.finalized_at.is_some());
    for execution in store
        .list_iteration_tool_executions(cancelled.current_iteration_id.unwrap())
        .await
        .unwrap()
    {
        assert_eq!(execution.state, ToolExecutionState::Skipped);
    }

    client.stop().await.unwrap();
}

// ============================================================================
// Tool errors surface to the model, which recovers
// ============================================================================

#[tokio::test]
async fn unregistered_tool_fails_into_tool_result_and_run_recovers() {
    let store = Arc::new(MemoryStore::new());
    let llm = Arc::new(
        ScriptedLlm::new()
            .then(LlmScript::ToolUse {
                text: None,
                calls: vec![ScriptedToolUse::new("ghost", json!({"q": 1}))],
            })
            .then_text("That tool seems unavailable; answering directly instead."),
    );
    let client = client_over(&store, llm, test_config());

    // The agent lists "ghost" but no instance registers it
    client
        .register_agent(AgentDefinition::new("chat", "test-model").with_tools(["ghost"]))
        .unwrap();
    client.start().await.unwrap();

    let session = client.new_session(SessionOptions::default()).await.unwrap();
    let response = tokio::time::timeout(
        Duration::from_secs(10),
        client.run_sync(&CancellationToken::new(), session.id, "chat", "use ghost", None),
    )
    .await
    .expect("run_sync finished")
    .unwrap();

    // The failure became a tool_result the model could see; the run still
    // completed
    assert_eq!(response.state, RunState::Completed);

    let run = client.get_run(response.run_id).await.unwrap();
    let messages = store.list_run_messages(run.id).await.unwrap();
    let error_block = messages
        .iter()
        .flat_map(|m| m.content.iter())
        .find_map(|b| match b {
            ContentBlock::ToolResult { content, is_error: true, .. } => Some(content.clone()),
            _ => None,
        })
        .expect("error tool_result block");
    assert!(error_block.contains("not registered"), "got: {}", error_block);

    // One execution row, its attempt budget spent
    assert_eq!(store.tool_execution_count(), 1);

    client.stop().await.unwrap();
}

// ============================================================================
// Auto-compaction
// ============================================================================

#[tokio::test]
async fn auto_compaction_summarizes_old_messages() {
    let store = Arc::new(MemoryStore::new());
    let llm = Arc::new(
        ScriptedLlm::new()
            .then_text("the first answer, at some length")
            .then_text("the second answer"),
    );
    let config = test_config().with_compaction_trigger(1);
    let client = client_over(&store, llm, config)
        .with_compactor(Arc::new(agentpg_worker::KeepRecentCompactor::new(2)));

    client
        .register_agent(AgentDefinition::new("chat", "test-model").with_auto_compaction())
        .unwrap();
    client.start().await.unwrap();

    let session = client.new_session(SessionOptions::default()).await.unwrap();
    client
        .run_sync(
            &CancellationToken::new(),
            session.id,
            "chat",
            "first prompt",
            None,
        )
        .await
        .unwrap();
    // The second run crosses the (tiny) trigger before its model call
    client
        .run_sync(
            &CancellationToken::new(),
            session.id,
            "chat",
            "second prompt",
            None,
        )
        .await
        .unwrap();

    let compacted = store.get_session(session.id).await.unwrap();
    assert!(compacted.compaction_count >= 1);

    let context = store.list_root_context(session.id).await.unwrap();
    let summary = context
        .iter()
        .find(|m| m.summary)
        .expect("summary message present");
    assert!(summary.preserved);
    // The oldest message was archived out of the context
    assert!(
        context.iter().all(|m| m.text() != "first prompt"),
        "first prompt should have been archived"
    );

    client.stop().await.unwrap();
}

// ============================================================================
// Synchronous validation errors
// ============================================================================

#[tokio::test]
async fn unknown_agent_fails_synchronously() {
    let store = Arc::new(MemoryStore::new());
    let client = client_over(&store, Arc::new(ScriptedLlm::new()), test_config());
    client.start().await.unwrap();

    let session = client.new_session(SessionOptions::default()).await.unwrap();
    let result = client
        .run_async(session.id, "nobody", "hello", None)
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
    assert_eq!(store.run_count(), 0);

    client.stop().await.unwrap();
}

#[tokio::test]
async fn run_variables_land_in_metadata() {
    let store = Arc::new(MemoryStore::new());
    let llm = Arc::new(ScriptedLlm::new().then_text("done"));
    let client = client_over(&store, llm, test_config());
    client
        .register_agent(AgentDefinition::new("chat", "test-model"))
        .unwrap();
    client.start().await.unwrap();

    let session = client.new_session(SessionOptions::default()).await.unwrap();
    let mut variables = HashMap::new();
    variables.insert("customer".to_string(), "acme".to_string());
    let run_id = client
        .run_async(session.id, "chat", "hello", Some(variables))
        .await
        .unwrap();

    let run = client.get_run(run_id).await.unwrap();
    assert_eq!(run.metadata.get("customer").map(String::as_str), Some("acme"));

    client.stop().await.unwrap();
}

// ============================================================================
// Stop drains in-flight work
// ============================================================================

#[tokio::test]
async fn stop_waits_for_in_flight_runs() {
    let store = Arc::new(MemoryStore::new());
    let llm = Arc::new(ScriptedLlm::new().then_text("finished before stop"));
    let client = client_over(&store, llm, test_config());
    client
        .register_agent(AgentDefinition::new("chat", "test-model"))
        .unwrap();
    client.start().await.unwrap();

    let session = client.new_session(SessionOptions::default()).await.unwrap();
    let run_id = client
        .run_async(session.id, "chat", "hello", None)
        .await
        .unwrap();

    // Give the worker a moment to claim, then stop; the run must still
    // reach a terminal state, not be abandoned mid-handler
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.stop().await.unwrap();

    let run = store.get_run(run_id).await.unwrap();
    assert!(
        run.is_terminal() || run.state == RunState::Pending || run.claimed_by_instance_id.is_none(),
        "stop left the run claimed by a dead instance: {:?}",
        run.state
    );
}

#[tokio::test]
async fn hanging_llm_leaves_run_claimed_until_cancelled_stop() {
    let store = Arc::new(MemoryStore::new());
    let config = test_config().with_shutdown_grace(Duration::from_millis(100));
    let client = client_over(&store, Arc::new(HangingLlm), config);
    client
        .register_agent(AgentDefinition::new("chat", "test-model"))
        .unwrap();
    client.start().await.unwrap();

    let session = client.new_session(SessionOptions::default()).await.unwrap();
    let run_id = client
        .run_async(session.id, "chat", "hang forever", None)
        .await
        .unwrap();

    wait_for("run to be claimed", || {
        store
            .runs()
            .iter()
            .any(|r| r.id == run_id && r.state == RunState::PendingApi)
    })
    .await;

    // The grace period elapses, the handler is cancelled, and the row stays
    // claimed for rescue
    client.stop().await.unwrap();
    let run = store.get_run(run_id).await.unwrap();
    assert!(!run.is_terminal());
}
