//! End-to-end loop scenarios over the `Runtime` facade with a scripted
//! provider — no network, no interpreter.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;

use dp_domain::capability::ProviderCapabilities;
use dp_domain::config::{Config, LlmConfig};
use dp_domain::error::{Error, Result};
use dp_domain::event::{Event, EventBody};
use dp_domain::message::Message;
use dp_domain::stream::{BoxStream, StreamDelta};
use dp_providers::registry::ProviderRegistry;
use dp_providers::{ChatRequest, ChatResponse, LlmProvider, ModelRouter};
use dp_runtime::Runtime;
use dp_sessions::{LogLine, TurnLog, TurnStatus};
use dp_skills::ToolRegistry;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One scripted model response: the deltas to stream, in order.
type Script = Vec<StreamDelta>;

struct MockProvider {
    id: String,
    scripts: Mutex<VecDeque<Script>>,
    /// Tool names advertised on each call, for constraint assertions.
    advertised: Mutex<Vec<Vec<String>>>,
    /// When true, every stream stalls forever after its first delta.
    stall_after_first: bool,
    capabilities: ProviderCapabilities,
}

impl MockProvider {
    fn new(id: &str, scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            scripts: Mutex::new(scripts.into()),
            advertised: Mutex::new(Vec::new()),
            stall_after_first: false,
            capabilities: ProviderCapabilities::default(),
        })
    }

    fn stalling(id: &str, scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            scripts: Mutex::new(scripts.into()),
            advertised: Mutex::new(Vec::new()),
            stall_after_first: true,
            capabilities: ProviderCapabilities::default(),
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for MockProvider {
    async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse> {
        // Used by the compression engine only.
        Ok(ChatResponse {
            content: "## Decisions\n- summarized earlier turns".into(),
            tool_calls: vec![],
            usage: None,
            model: "mock".into(),
            finish_reason: Some("stop".into()),
        })
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamDelta>>> {
        self.advertised
            .lock()
            .push(req.tools.iter().map(|t| t.name.clone()).collect());

        let script = self.scripts.lock().pop_front().ok_or_else(|| {
            Error::ProviderFatal {
                provider: self.id.clone(),
                message: "script exhausted".into(),
            }
        })?;
        let stall = self.stall_after_first;
        Ok(Box::pin(async_stream::stream! {
            let mut first = true;
            for delta in script {
                yield Ok(delta);
                if stall && first {
                    first = false;
                    std::future::pending::<()>().await;
                }
            }
        }))
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.capabilities
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

/// A provider that always fails with a transient error.
struct BrokenProvider(ProviderCapabilities);

#[async_trait::async_trait]
impl LlmProvider for BrokenProvider {
    async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse> {
        Err(Error::ProviderTransient {
            provider: "broken".into(),
            message: "HTTP 503".into(),
        })
    }
    async fn chat_stream(
        &self,
        _req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamDelta>>> {
        Err(Error::ProviderTransient {
            provider: "broken".into(),
            message: "HTTP 503".into(),
        })
    }
    fn capabilities(&self) -> &ProviderCapabilities {
        &self.0
    }
    fn provider_id(&self) -> &str {
        "broken"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn finish() -> StreamDelta {
    StreamDelta::Finish {
        usage: Some(dp_domain::message::Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        finish_reason: Some("stop".into()),
    }
}

fn tool_call(call_id: &str, name: &str, args: serde_json::Value) -> StreamDelta {
    StreamDelta::ToolCallFinished {
        call_id: call_id.into(),
        tool_name: name.into(),
        arguments: args,
    }
}

struct Harness {
    runtime: Runtime,
    session_id: String,
    _tmp: tempfile::TempDir,
}

fn build_harness(
    providers: Vec<Arc<dyn LlmProvider>>,
    mutate_config: impl FnOnce(&mut Config),
) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.workspace.root = tmp.path().join("sessions");
    config.skills.path = tmp.path().join("skills");
    std::fs::create_dir_all(&config.skills.path).unwrap();
    mutate_config(&mut config);

    let mut llm = LlmConfig::default();
    llm.retry.base_ms = 1;
    llm.retry.cap_ms = 2;
    let router = Arc::new(ModelRouter::new(
        ProviderRegistry::from_providers(providers),
        &llm,
    ));
    let registry = Arc::new(
        ToolRegistry::new(dp_runtime::tools::builtin_entries(), &config.skills.path).unwrap(),
    );

    let runtime = Runtime::builder(config)
        .with_router(router)
        .with_registry(registry)
        .build()
        .unwrap();
    let session_id = runtime.create_session(Some("test".into())).unwrap().id;

    Harness {
        runtime,
        session_id,
        _tmp: tmp,
    }
}

impl Harness {
    fn workspace_path(&self, rel: &str) -> std::path::PathBuf {
        self._tmp
            .path()
            .join("sessions")
            .join(&self.session_id)
            .join("workspace")
            .join(rel)
    }

    fn seed_dataset(&self, rel: &str, content: &str) {
        let path = self.workspace_path(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
}

async fn drain(mut rx: UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        let terminal = event.body.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }
    events
}

fn kinds(events: &[Event]) -> Vec<&'static str> {
    events
        .iter()
        .map(|e| match &e.body {
            EventBody::Session { .. } => "session",
            EventBody::IterationStart { .. } => "iteration_start",
            EventBody::Text { .. } => "text",
            EventBody::Reasoning { .. } => "reasoning",
            EventBody::ToolCall { .. } => "tool_call",
            EventBody::ToolResult { .. } => "tool_result",
            EventBody::Chart { .. } => "chart",
            EventBody::Data { .. } => "data",
            EventBody::Artifact { .. } => "artifact",
            EventBody::WorkspaceUpdate { .. } => "workspace_update",
            EventBody::AnalysisPlan { .. } => "analysis_plan",
            EventBody::PlanStepUpdate { .. } => "plan_step_update",
            EventBody::PlanProgress { .. } => "plan_progress",
            EventBody::TaskAttempt { .. } => "task_attempt",
            EventBody::Retrieval { .. } => "retrieval",
            EventBody::CompressionLossy { .. } => "compression_lossy",
            EventBody::Done { .. } => "done",
            EventBody::Stopped { .. } => "stopped",
            EventBody::Error { .. } => "error",
        })
        .collect()
}

fn position(kinds: &[&str], kind: &str) -> usize {
    kinds.iter().position(|k| *k == kind).unwrap_or_else(|| {
        panic!("expected a {kind} event in {kinds:?}");
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 1: plan → execute → done
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn plan_execute_done_orders_events() {
    let scripts = vec![
        vec![
            StreamDelta::Text {
                text: "1. Load the sales dataset\n2. Mean revenue by region\n".into(),
            },
            tool_call("c1", "load_dataset", json!({"name": "sales"})),
            finish(),
        ],
        vec![
            tool_call(
                "c2",
                "group_by_mean",
                json!({"name": "sales", "group_by": "region", "value": "revenue"}),
            ),
            finish(),
        ],
        vec![
            StreamDelta::Text {
                text: "North leads with a mean revenue of 110.".into(),
            },
            finish(),
        ],
    ];
    let provider = MockProvider::new("mock", scripts);
    let harness = build_harness(vec![provider as Arc<dyn LlmProvider>], |_| {});
    harness.seed_dataset(
        "datasets/sales.csv",
        "region,revenue\nnorth,100\nnorth,120\nsouth,80\n",
    );

    let (turn_id, rx) = harness
        .runtime
        .chat(&harness.session_id, "load sales.csv and report mean revenue by region", &[])
        .unwrap();
    let events = drain(rx).await;
    let ks = kinds(&events);

    // Strictly ordered sequence numbers.
    for pair in events.windows(2) {
        assert!(pair[0].seq < pair[1].seq);
        assert_eq!(pair[0].turn_id, turn_id);
    }

    assert_eq!(ks[0], "session");
    assert!(position(&ks, "analysis_plan") < position(&ks, "tool_call"));
    assert!(position(&ks, "tool_call") < position(&ks, "tool_result"));
    assert!(position(&ks, "data") > position(&ks, "tool_result"));
    assert_eq!(*ks.last().unwrap(), "done");

    // Both tools ran and the plan advanced to done twice.
    let tool_names: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.body {
            EventBody::ToolCall { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(tool_names, vec!["load_dataset", "group_by_mean"]);

    let done_steps = events
        .iter()
        .filter(|e| {
            matches!(
                &e.body,
                EventBody::PlanProgress {
                    step_status: dp_domain::plan::StepStatus::Done,
                    ..
                }
            )
        })
        .count();
    assert_eq!(done_steps, 2);

    // The grouped means are correct in the data event.
    let data = events
        .iter()
        .filter_map(|e| match &e.body {
            EventBody::Data { columns, rows } => Some((columns.clone(), rows.clone())),
            _ => None,
        })
        .last()
        .unwrap();
    assert_eq!(data.0, vec!["region", "mean_revenue"]);
    assert_eq!(data.1[0][0], json!("north"));
    assert_eq!(data.1[0][1], json!(110.0));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 2: sandbox policy violation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn policy_violation_surfaces_to_model() {
    let scripts = vec![
        vec![
            tool_call(
                "c1",
                "run_code",
                json!({"code": "__import__('os').system('ls')"}),
            ),
            finish(),
        ],
        vec![
            StreamDelta::Text {
                text: "That code was rejected by the sandbox policy; I'll use pandas instead."
                    .into(),
            },
            finish(),
        ],
    ];
    let harness = build_harness(
        vec![MockProvider::new("mock", scripts) as Arc<dyn LlmProvider>],
        |_| {},
    );

    let (_, rx) = harness
        .runtime
        .chat(&harness.session_id, "run this: __import__('os').system('ls')", &[])
        .unwrap();
    let events = drain(rx).await;
    let ks = kinds(&events);

    let result = events
        .iter()
        .find_map(|e| match &e.body {
            EventBody::ToolResult { success, data, .. } => Some((*success, data.clone())),
            _ => None,
        })
        .unwrap();
    assert!(!result.0);
    assert_eq!(result.1["kind"], "policy");
    assert!(result.1["stderr"].as_str().unwrap().contains("__import__"));

    // The model acknowledged the failure, then the turn completed.
    assert!(position(&ks, "tool_result") < position(&ks, "text"));
    assert_eq!(*ks.last().unwrap(), "done");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 3: provider failover
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn failover_hides_broken_binding() {
    let healthy = MockProvider::new(
        "healthy",
        vec![vec![
            StreamDelta::Text {
                text: "hello from the healthy binding".into(),
            },
            finish(),
        ]],
    );
    let harness = build_harness(
        vec![
            Arc::new(BrokenProvider(ProviderCapabilities::default())) as Arc<dyn LlmProvider>,
            healthy,
        ],
        |_| {},
    );

    let (_, rx) = harness.runtime.chat(&harness.session_id, "hi", &[]).unwrap();
    let events = drain(rx).await;

    let text: String = events
        .iter()
        .filter_map(|e| match &e.body {
            EventBody::Text { data } => Some(data.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "hello from the healthy binding");
    assert_eq!(*kinds(&events).last().unwrap(), "done");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 4: compression trigger
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn oversized_history_is_compressed_before_the_call() {
    let provider = MockProvider::new(
        "mock",
        vec![vec![
            StreamDelta::Text {
                text: "continuing after compression".into(),
            },
            finish(),
        ]],
    );
    let harness = build_harness(vec![provider as Arc<dyn LlmProvider>], |config| {
        config.compression.threshold_tokens = 500;
        config.compression.target_tokens = 100;
        config.compression.recency_window = 4;
    });

    // Seed a turn log well above the threshold.
    let session_root = harness
        ._tmp
        .path()
        .join("sessions")
        .join(&harness.session_id);
    let log = TurnLog::new(&session_root);
    for turn in 1..=6u64 {
        log.append(&[
            TurnLog::turn_start(turn),
            TurnLog::line(turn, Message::user("x".repeat(400))),
            TurnLog::line(turn, Message::assistant("y".repeat(400))),
            TurnLog::turn_end(
                turn,
                TurnStatus::Done,
                dp_domain::message::Usage::default(),
                1,
            ),
        ])
        .unwrap();
    }

    let (_, rx) = harness
        .runtime
        .chat(&harness.session_id, "and now?", &[])
        .unwrap();
    let events = drain(rx).await;
    let ks = kinds(&events);

    // Auxiliary summarization succeeded: no lossy warning.
    assert!(!ks.contains(&"compression_lossy"));
    assert_eq!(*ks.last().unwrap(), "done");

    // A compression record was persisted and shrank the estimate.
    let records = std::fs::read_to_string(
        session_root.join("workspace/.compression/records.jsonl"),
    )
    .unwrap();
    let record: serde_json::Value =
        serde_json::from_str(records.lines().next().unwrap()).unwrap();
    assert!(
        record["compressed_token_estimate"].as_u64().unwrap()
            < record["original_token_estimate"].as_u64().unwrap()
    );
    assert!(session_root
        .join("workspace/.compression/summary.md")
        .exists());

    // Re-running below the threshold is a no-op: no second record.
    assert_eq!(records.lines().count(), 1);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 5: cancellation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn stop_terminates_turn_and_session_stays_usable() {
    let provider = MockProvider::stalling(
        "mock",
        vec![vec![
            StreamDelta::Text {
                text: "partial...".into(),
            },
            finish(),
        ]],
    );
    let harness = build_harness(vec![provider as Arc<dyn LlmProvider>], |_| {});

    let (_, rx) = harness
        .runtime
        .chat(&harness.session_id, "long running question", &[])
        .unwrap();

    // Give the turn a moment to start streaming, then stop it.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(harness.runtime.stop(&harness.session_id));

    let events = drain(rx).await;
    let ks = kinds(&events);
    assert_eq!(ks.iter().filter(|k| **k == "stopped").count(), 1);
    assert_eq!(*ks.last().unwrap(), "stopped");

    // The session accepts the next message without reconnecting.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(!harness.runtime.stop(&harness.session_id), "no turn running");
    let log = harness.runtime.session_log(&harness.session_id).unwrap();
    assert!(log.iter().any(|l| matches!(
        l,
        LogLine::TurnEnd {
            status: TurnStatus::Stopped,
            ..
        }
    )));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 6: Markdown skill read-before-execute
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn skill_body_injected_before_dispatch_and_constrains_tools() {
    let scripts = vec![
        vec![tool_call("c1", "root-analysis", json!({})), finish()],
        vec![
            StreamDelta::Text {
                text: "Following the procedure now.".into(),
            },
            finish(),
        ],
    ];
    let provider = MockProvider::new("mock", scripts);
    let provider_ref = provider.clone();

    let tmp_skills = tempfile::tempdir().unwrap();
    let skill_dir = tmp_skills.path().join("root-analysis");
    std::fs::create_dir_all(&skill_dir).unwrap();
    std::fs::write(
        skill_dir.join("SKILL.md"),
        "---\nname: root-analysis\ndescription: guided analysis\nallowed-tools: [load_dataset, run_code]\n---\n# Procedure\n1. Load the data.\n2. Test the hypothesis.\n",
    )
    .unwrap();

    let skills_path = tmp_skills.path().to_path_buf();
    let harness = build_harness(vec![provider as Arc<dyn LlmProvider>], move |config| {
        config.skills.path = skills_path;
    });

    let (_, rx) = harness
        .runtime
        .chat(&harness.session_id, "use root-analysis", &[])
        .unwrap();
    let events = drain(rx).await;

    // The skill body came back as a skill_definition tool result.
    let (success, data) = events
        .iter()
        .find_map(|e| match &e.body {
            EventBody::ToolResult { success, data, .. } => Some((*success, data.clone())),
            _ => None,
        })
        .unwrap();
    assert!(success);
    assert_eq!(data["kind"], "skill_definition");
    assert!(data["body"].as_str().unwrap().contains("# Procedure"));

    // The next iteration advertised only the skill's allowed tools.
    let advertised = provider_ref.advertised.lock().clone();
    assert_eq!(advertised.len(), 2);
    let mut second = advertised[1].clone();
    second.sort();
    assert_eq!(second, vec!["load_dataset", "run_code"]);

    assert_eq!(*kinds(&events).last().unwrap(), "done");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Max iterations and retry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn max_iterations_emits_synthetic_summary_and_done() {
    // Every iteration asks for another tool call; the cap cuts it off.
    let scripts = (0..2)
        .map(|i| {
            vec![
                tool_call(&format!("c{i}"), "list_files", json!({})),
                finish(),
            ]
        })
        .collect();
    let harness = build_harness(
        vec![MockProvider::new("mock", scripts) as Arc<dyn LlmProvider>],
        |config| {
            config.runtime.max_iterations = 2;
        },
    );

    let (_, rx) = harness
        .runtime
        .chat(&harness.session_id, "loop forever", &[])
        .unwrap();
    let events = drain(rx).await;
    let ks = kinds(&events);

    let iterations = ks.iter().filter(|k| **k == "iteration_start").count();
    assert_eq!(iterations, 2, "no extra iteration past the cap");

    let synthetic: String = events
        .iter()
        .filter_map(|e| match &e.body {
            EventBody::Text { data } => Some(data.clone()),
            _ => None,
        })
        .collect();
    assert!(synthetic.contains("iteration limit"));
    assert_eq!(*ks.last().unwrap(), "done");
}

#[tokio::test]
async fn retry_supersedes_previous_turn() {
    let scripts = vec![
        vec![
            StreamDelta::Text {
                text: "first answer".into(),
            },
            finish(),
        ],
        vec![
            StreamDelta::Text {
                text: "second answer".into(),
            },
            finish(),
        ],
    ];
    let harness = build_harness(
        vec![MockProvider::new("mock", scripts) as Arc<dyn LlmProvider>],
        |_| {},
    );

    let (first_turn, rx) = harness
        .runtime
        .chat(&harness.session_id, "the question", &[])
        .unwrap();
    drain(rx).await;
    // Let the turn task finish its cleanup before retrying.
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    let (second_turn, rx) = harness.runtime.retry(&harness.session_id).unwrap();
    assert!(second_turn > first_turn);
    let events = drain(rx).await;
    assert_eq!(*kinds(&events).last().unwrap(), "done");

    let log = harness.runtime.session_log(&harness.session_id).unwrap();
    assert!(log
        .iter()
        .any(|l| matches!(l, LogLine::Superseded { turn_id, .. } if *turn_id == first_turn)));

    // Both turns' user messages exist; replay keeps only the retry.
    let turn_starts = log
        .iter()
        .filter(|l| matches!(l, LogLine::TurnStart { .. }))
        .count();
    assert_eq!(turn_starts, 2);
}

#[tokio::test]
async fn tool_result_references_matching_call_id() {
    let scripts = vec![
        vec![tool_call("call-abc", "list_files", json!({})), finish()],
        vec![
            StreamDelta::Text {
                text: "done".into(),
            },
            finish(),
        ],
    ];
    let harness = build_harness(
        vec![MockProvider::new("mock", scripts) as Arc<dyn LlmProvider>],
        |_| {},
    );

    let (_, rx) = harness.runtime.chat(&harness.session_id, "list", &[]).unwrap();
    let events = drain(rx).await;

    let call_id = events
        .iter()
        .find_map(|e| match &e.body {
            EventBody::ToolCall { call_id, .. } => Some(call_id.clone()),
            _ => None,
        })
        .unwrap();
    let result_id = events
        .iter()
        .find_map(|e| match &e.body {
            EventBody::ToolResult { call_id, .. } => Some(call_id.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(call_id, "call-abc");
    assert_eq!(call_id, result_id);
}
