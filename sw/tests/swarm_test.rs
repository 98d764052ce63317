//! End-to-end swarm scenarios against a scripted provider and spawner
//!
//! The provider answers by request shape (decomposition tool, probe tool,
//! judge prompt, synthesis); the spawner replays per-task behavior scripts.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use eyre::Result;

use swarmd::config::{SwarmConfig, WorkerSpec};
use swarmd::domain::{SpawnResult, WorkerMetrics};
use swarmd::events::{EventBus, SwarmEvent};
use swarmd::llm::{ChatRequest, ChatResponse, ProviderClient, ProviderError, StopReason, TokenUsage, ToolInvocation};
use swarmd::orchestrator::Orchestrator;
use swarmd::pool::{AgentDefinition, AgentSpawner};
use swarmd::state::CheckpointStore;

// === Scripted provider ===

struct TestProvider {
    decomposition: serde_json::Value,
    judge_score: u8,
    judge_calls: AtomicUsize,
}

impl TestProvider {
    fn new(decomposition: serde_json::Value) -> Self {
        Self {
            decomposition,
            judge_score: 4,
            judge_calls: AtomicUsize::new(0),
        }
    }

    fn with_judge_score(mut self, score: u8) -> Self {
        self.judge_score = score;
        self
    }

    fn judge_calls(&self) -> usize {
        self.judge_calls.load(Ordering::SeqCst)
    }
}

fn tool_response(name: &str, input: serde_json::Value) -> ChatResponse {
    ChatResponse {
        content: None,
        tool_calls: vec![ToolInvocation {
            id: "t".to_string(),
            name: name.to_string(),
            input,
        }],
        stop_reason: StopReason::ToolUse,
        usage: TokenUsage {
            input_tokens: 200,
            output_tokens: 100,
            cache_read_tokens: 0,
        },
        rate_limit_info: None,
    }
}

fn text_response(text: &str) -> ChatResponse {
    ChatResponse {
        content: Some(text.to_string()),
        tool_calls: vec![],
        stop_reason: StopReason::EndTurn,
        usage: TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
            cache_read_tokens: 0,
        },
        rate_limit_info: None,
    }
}

#[async_trait]
impl ProviderClient for TestProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn default_model(&self) -> &str {
        "test-model"
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        if request.tools.iter().any(|t| t.name == "submit_decomposition") {
            return Ok(tool_response("submit_decomposition", self.decomposition.clone()));
        }
        if request.tools.iter().any(|t| t.name == "confirm_ready") {
            return Ok(tool_response("confirm_ready", serde_json::json!({"token": "ok"})));
        }
        if request.system_prompt.contains("quality judge") {
            self.judge_calls.fetch_add(1, Ordering::SeqCst);
            return Ok(text_response(&format!(
                "SCORE: {}\nFEEDBACK: scripted verdict for this attempt",
                self.judge_score
            )));
        }
        // Planning / review / replan tools are unused in these scenarios;
        // anything else is the synthesizer
        Ok(text_response("synthesized: the swarm finished its work"))
    }
}

// === Scripted spawner ===

#[derive(Clone)]
enum Behavior {
    Succeed { output: String, tool_calls: i64 },
    Fail { output: String },
    Hollow,
}

impl Behavior {
    fn ok(output: &str) -> Self {
        Behavior::Succeed {
            output: output.to_string(),
            tool_calls: 3,
        }
    }
}

struct TestSpawner {
    scripts: Mutex<HashMap<String, VecDeque<Behavior>>>,
    /// (task id, prompt) per spawn, in spawn order
    prompts: Mutex<Vec<(String, String)>>,
}

impl TestSpawner {
    fn new(scripts: Vec<(&str, Vec<Behavior>)>) -> Self {
        let scripts = scripts
            .into_iter()
            .map(|(id, behaviors)| (id.to_string(), behaviors.into_iter().collect()))
            .collect();
        Self {
            scripts: Mutex::new(scripts),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn spawn_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    fn prompts_for(&self, task_id: &str) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == task_id)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Agent names look like `{worker}-{task}-a{attempt}`
    fn task_id_of(&self, name: &str) -> String {
        let scripts = self.scripts.lock().unwrap();
        for key in scripts.keys() {
            if name.contains(&format!("-{}-a", key)) {
                return key.clone();
            }
        }
        // Unscripted tasks: recover the id between the first '-' and "-a"
        name.split_once('-')
            .map(|(_, rest)| rest.rsplit_once("-a").map(|(id, _)| id.to_string()).unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AgentSpawner for TestSpawner {
    async fn register(&self, _def: AgentDefinition) -> Result<()> {
        Ok(())
    }

    async fn spawn(&self, name: &str, task_prompt: &str) -> Result<SpawnResult> {
        let task_id = self.task_id_of(name);
        self.prompts.lock().unwrap().push((task_id.clone(), task_prompt.to_string()));

        let behavior = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(&task_id) {
                Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
                Some(queue) => queue.front().cloned().unwrap_or_else(|| Behavior::ok("done")),
                None => Behavior::ok(&format!("completed {} with concrete changes applied", task_id)),
            }
        };

        let result = match behavior {
            Behavior::Succeed { output, tool_calls } => SpawnResult {
                success: true,
                output,
                metrics: WorkerMetrics {
                    tokens: 1_000,
                    duration_ms: 25,
                    tool_calls,
                },
                structured: None,
                files_modified: None,
            },
            Behavior::Fail { output } => SpawnResult {
                success: false,
                output,
                metrics: WorkerMetrics {
                    tokens: 500,
                    duration_ms: 25,
                    tool_calls: 1,
                },
                structured: None,
                files_modified: None,
            },
            Behavior::Hollow => SpawnResult {
                success: true,
                output: String::new(),
                metrics: WorkerMetrics {
                    tokens: 100,
                    duration_ms: 5,
                    tool_calls: 0,
                },
                structured: None,
                files_modified: None,
            },
        };
        Ok(result)
    }

    async fn unregister(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

// === Harness plumbing ===

fn test_config(state_dir: &Path) -> SwarmConfig {
    let mut config = SwarmConfig::default();
    config.swarm.dispatch_stagger_ms = 1;
    config.persistence.state_dir = state_dir.to_path_buf();
    config
}

struct Run {
    outcome: swarmd::orchestrator::SwarmOutcome,
    events: Vec<SwarmEvent>,
}

async fn run_swarm(
    config: SwarmConfig,
    provider: Arc<TestProvider>,
    spawner: Arc<TestSpawner>,
    workdir: &Path,
    prompt: &str,
) -> Result<Run> {
    let bus = EventBus::new(8_192);
    let mut rx = bus.subscribe();

    let mut orchestrator = Orchestrator::new(config, provider, spawner, bus, workdir)?;
    let outcome = orchestrator.run(prompt).await?;

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    Ok(Run { outcome, events })
}

fn status_of<'a>(run: &'a Run, id: &str) -> &'a str {
    run.outcome
        .tasks
        .iter()
        .find(|t| t.id == id)
        .map(|t| t.status.as_str())
        .unwrap_or("missing")
}

// === Decomposition fixtures ===

fn subtask(description: &str, ty: &str, deps: &[usize]) -> serde_json::Value {
    serde_json::json!({
        "description": description,
        "type": ty,
        "complexity": 5,
        "dependencies": deps,
        "parallelizable": true,
        "relevantFiles": []
    })
}

fn decomposition(subtasks: Vec<serde_json::Value>) -> serde_json::Value {
    serde_json::json!({
        "subtasks": subtasks,
        "strategy": "adaptive",
        "reasoning": "scripted decomposition"
    })
}

// === Scenarios ===

/// S1: linear three-wave pipeline, everything succeeds
#[tokio::test]
async fn test_linear_three_wave_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(TestProvider::new(decomposition(vec![
        subtask("create the project base", "implement", &[]),
        subtask("build feature alpha on the base", "implement", &[0]),
        subtask("build feature beta on the base", "implement", &[0]),
        subtask("integrate feature alpha and feature beta", "integrate", &[1, 2]),
    ])));
    let spawner = Arc::new(TestSpawner::new(vec![
        ("st-0", vec![Behavior::ok("laid down the base module layout")]),
        ("st-1", vec![Behavior::ok("implemented feature alpha in module alpha")]),
        ("st-2", vec![Behavior::ok("implemented feature beta in module beta")]),
        ("st-3", vec![Behavior::ok("joined alpha and beta behind one facade")]),
    ]));

    let run = run_swarm(test_config(dir.path()), provider, spawner.clone(), dir.path(), "build the thing")
        .await
        .unwrap();

    assert!(run.outcome.success);
    assert!(!run.outcome.partial_success);
    for id in ["st-0", "st-1", "st-2", "st-3"] {
        assert_eq!(status_of(&run, id), "completed", "task {}", id);
    }
    assert_eq!(run.outcome.tasks.iter().map(|t| t.wave).max(), Some(3));

    // The integrate worker saw both dependency outputs in its prompt
    let integrate_prompts = spawner.prompts_for("st-3");
    assert_eq!(integrate_prompts.len(), 1);
    assert!(integrate_prompts[0].contains("implemented feature alpha in module alpha"));
    assert!(integrate_prompts[0].contains("implemented feature beta in module beta"));

    // Three waves started, in order
    let waves: Vec<u32> = run
        .events
        .iter()
        .filter_map(|e| match e {
            SwarmEvent::WaveStart { wave, .. } => Some(*wave),
            _ => None,
        })
        .collect();
    assert_eq!(waves, vec![1, 2, 3]);
    assert_eq!(run.outcome.stats.retries, 0);
}

/// S2: one transient failure, retry succeeds
#[tokio::test]
async fn test_retry_then_succeed() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(TestProvider::new(decomposition(vec![
        subtask("research the landscape", "research", &[]),
        subtask("summarize the findings", "document", &[]),
    ])));
    let spawner = Arc::new(TestSpawner::new(vec![
        (
            "st-0",
            vec![
                Behavior::Fail {
                    output: "transient explosion while reading sources".to_string(),
                },
                Behavior::ok("survey finished, findings grounded in the repository"),
            ],
        ),
        ("st-1", vec![Behavior::ok("summary written with every claim sourced")]),
    ]));

    let run = run_swarm(test_config(dir.path()), provider, spawner.clone(), dir.path(), "survey")
        .await
        .unwrap();

    assert!(run.outcome.success);
    assert_eq!(status_of(&run, "st-0"), "completed");
    assert_eq!(status_of(&run, "st-1"), "completed");
    assert_eq!(run.outcome.stats.retries, 1);
    assert_eq!(spawner.prompts_for("st-0").len(), 2);

    // The retry prompt carried the failure context
    let retry_prompt = &spawner.prompts_for("st-0")[1];
    assert!(retry_prompt.contains("transient explosion"));
}

/// S3: strict cascade with threshold 1.0
#[tokio::test]
async fn test_strict_cascade() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(TestProvider::new(decomposition(vec![
        subtask("build the root layer", "implement", &[]),
        subtask("build the child layer", "implement", &[0]),
        subtask("build the grandchild layer", "implement", &[1]),
    ])));
    let spawner = Arc::new(TestSpawner::new(vec![(
        "st-0",
        vec![Behavior::Fail {
            output: "fundamental blocker: the root approach cannot work".to_string(),
        }],
    )]));

    let mut config = test_config(dir.path());
    config.retry.worker_retries = 0;
    // Keep the root-only wave from being collectively requeued forever
    config.swarm.total_budget = 2_000_000;

    let run = run_swarm(config, provider, spawner.clone(), dir.path(), "layered build")
        .await
        .unwrap();

    assert!(!run.outcome.success);
    assert_eq!(status_of(&run, "st-0"), "failed");
    assert_eq!(status_of(&run, "st-1"), "skipped");
    assert_eq!(status_of(&run, "st-2"), "skipped");

    let skipped_events = run
        .events
        .iter()
        .filter(|e| matches!(e, SwarmEvent::TaskSkipped { .. }))
        .count();
    assert_eq!(skipped_events, 2);
    // Skipped tasks never reached a worker
    assert!(spawner.prompts_for("st-1").is_empty());
    assert!(spawner.prompts_for("st-2").is_empty());
}

/// S4: partial-dependency rescue of a merge task at threshold 0.5
#[tokio::test]
async fn test_partial_merge_rescue() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(TestProvider::new(decomposition(vec![
        subtask("produce part alpha", "implement", &[]),
        subtask("produce part beta", "implement", &[]),
        subtask("produce part gamma", "implement", &[]),
        subtask("merge the three parts", "merge", &[0, 1, 2]),
    ])));
    let spawner = Arc::new(TestSpawner::new(vec![
        ("st-0", vec![Behavior::ok("part alpha produced and wired in")]),
        ("st-1", vec![Behavior::ok("part beta produced and wired in")]),
        (
            "st-2",
            vec![Behavior::Fail {
                output: "gamma is impossible with the current inputs".to_string(),
            }],
        ),
        ("st-3", vec![Behavior::ok("merged what exists, gaps documented")]),
    ]));

    let mut config = test_config(dir.path());
    config.retry.worker_retries = 0;
    config.retry.partial_dependency_threshold = 0.5;

    let run = run_swarm(config, provider, spawner.clone(), dir.path(), "three parts")
        .await
        .unwrap();

    assert_eq!(status_of(&run, "st-0"), "completed");
    assert_eq!(status_of(&run, "st-1"), "completed");
    assert_eq!(status_of(&run, "st-2"), "failed");
    assert_eq!(status_of(&run, "st-3"), "completed");
    assert!(run.outcome.success); // 3/4 ≥ 0.7

    // The merge prompt carried the degraded-input warning and both outputs
    let merge_prompts = spawner.prompts_for("st-3");
    assert_eq!(merge_prompts.len(), 1);
    let prompt = &merge_prompts[0];
    assert!(prompt.contains("degraded inputs"));
    assert!(prompt.contains("st-2"));
    assert!(prompt.contains("67%"));
    assert!(prompt.contains("part alpha produced"));
    assert!(prompt.contains("part beta produced"));
}

/// S5: hollow completion triggers failover to the alternative model
#[tokio::test]
async fn test_hollow_completion_failover() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(TestProvider::new(decomposition(vec![
        subtask("implement the widget", "implement", &[]),
        subtask("research widget prior art", "research", &[]),
    ])));
    let spawner = Arc::new(TestSpawner::new(vec![
        (
            "st-0",
            vec![Behavior::Hollow, Behavior::ok("widget implemented for real this time")],
        ),
        ("st-1", vec![Behavior::ok("prior art collected with references")]),
    ]));

    let mut config = test_config(dir.path());
    config.workers = vec![
        WorkerSpec {
            name: "primary".to_string(),
            model: "model-a".to_string(),
            capabilities: vec!["code".to_string(), "research".to_string()],
            lightweight: false,
        },
        WorkerSpec {
            name: "fallback".to_string(),
            model: "model-b".to_string(),
            capabilities: vec!["code".to_string(), "research".to_string()],
            lightweight: false,
        },
    ];

    let run = run_swarm(config, provider, spawner.clone(), dir.path(), "widget")
        .await
        .unwrap();

    assert_eq!(status_of(&run, "st-0"), "completed");
    let st0 = run.outcome.tasks.iter().find(|t| t.id == "st-0").unwrap();
    assert_eq!(st0.model.as_deref(), Some("model-b"));
    assert!(st0.attempts >= 1);

    let failover = run
        .events
        .iter()
        .find_map(|e| match e {
            SwarmEvent::ModelFailover { task_id, from, to, reason } if task_id == "st-0" => {
                Some((from.clone(), to.clone(), reason.clone()))
            }
            _ => None,
        })
        .expect("failover event");
    assert_eq!(failover.0, "model-a");
    assert_eq!(failover.1, "model-b");
    assert_eq!(failover.2, "hollow-completion");

    // The retry prompt demanded an immediate tool call
    let retry_prompt = &spawner.prompts_for("st-0")[1];
    assert!(retry_prompt.contains("FIRST action must be a tool call"));
}

/// S6: three rate limits inside the window open the circuit breaker
#[tokio::test(start_paused = true)]
async fn test_rate_limit_circuit_breaker() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(TestProvider::new(decomposition(vec![
        subtask("produce the first piece", "implement", &[]),
        subtask("produce the second piece", "implement", &[]),
    ])));
    let rate_limited = Behavior::Fail {
        output: "provider said 429 rate limit, backing off".to_string(),
    };
    let spawner = Arc::new(TestSpawner::new(vec![
        (
            "st-0",
            vec![
                rate_limited.clone(),
                rate_limited.clone(),
                rate_limited.clone(),
                Behavior::ok("first piece done after the storm passed"),
            ],
        ),
        ("st-1", vec![Behavior::ok("second piece done")]),
    ]));

    let run = run_swarm(test_config(dir.path()), provider, spawner.clone(), dir.path(), "pieces")
        .await
        .unwrap();

    assert_eq!(status_of(&run, "st-0"), "completed");
    assert_eq!(status_of(&run, "st-1"), "completed");

    let open = run
        .events
        .iter()
        .find_map(|e| match e {
            SwarmEvent::CircuitOpen { recent_count, pause_ms } => Some((*recent_count, *pause_ms)),
            _ => None,
        })
        .expect("circuit opened");
    assert_eq!(open.0, 3);
    assert_eq!(open.1, 15_000);

    assert!(
        run.events.iter().any(|e| matches!(e, SwarmEvent::CircuitClosed {})),
        "circuit should close after the pause"
    );

    // Rate-limit retries are announced with cooldowns, not terminal failures
    let retried = run
        .events
        .iter()
        .filter(|e| matches!(e, SwarmEvent::TaskFailed { will_retry: true, .. }))
        .count();
    assert_eq!(retried, 3);
}

/// S7: eight consecutive judge rejections trip the quality breaker; later
/// completions bypass the judge for the rest of the wave
#[tokio::test]
async fn test_quality_gate_circuit_breaker() {
    let dir = tempfile::tempdir().unwrap();
    let subtasks: Vec<serde_json::Value> = (0..9)
        .map(|i| subtask(&format!("produce deliverable number {}", i), "implement", &[]))
        .collect();
    let provider = Arc::new(TestProvider::new(decomposition(subtasks)).with_judge_score(2));
    let spawner = Arc::new(TestSpawner::new(vec![]));

    let mut config = test_config(dir.path());
    config.swarm.max_concurrency = 3;

    let run = run_swarm(config, provider.clone(), spawner, dir.path(), "nine deliverables")
        .await
        .unwrap();

    // Exactly eight rejections were counted before the breaker opened
    assert_eq!(run.outcome.stats.quality_rejections, 8);
    assert_eq!(provider.judge_calls(), 8);

    let breaker_decision = run.events.iter().any(
        |e| matches!(e, SwarmEvent::Decision { key, .. } if key == "quality-circuit-breaker"),
    );
    assert!(breaker_decision, "quality breaker decision should be logged");

    // Every task still completes: post-breaker completions bypass the judge
    assert!(run.outcome.success);
    assert_eq!(
        run.outcome.tasks.iter().filter(|t| t.status == "completed").count(),
        9
    );
}

/// Checkpoint lands on disk and the session resumes without re-spawning
#[tokio::test]
async fn test_checkpoint_and_resume() {
    let dir = tempfile::tempdir().unwrap();
    let decomposition_json = decomposition(vec![
        subtask("make the first half", "implement", &[]),
        subtask("make the second half", "implement", &[0]),
    ]);

    let provider = Arc::new(TestProvider::new(decomposition_json.clone()));
    let spawner = Arc::new(TestSpawner::new(vec![]));

    let run = run_swarm(
        test_config(dir.path()),
        provider,
        spawner.clone(),
        dir.path(),
        "two halves",
    )
    .await
    .unwrap();
    assert!(run.outcome.success);
    let session_id = run.outcome.session_id.clone();
    let spawns_before = spawner.spawn_count();

    // The final checkpoint is on disk with every task completed
    let store = CheckpointStore::new(dir.path());
    let checkpoint = store.load(&session_id).unwrap().expect("checkpoint exists");
    assert!(checkpoint.queue.tasks.iter().all(|t| t.status_name() == "completed"));

    // Resume: everything is terminal, so no worker runs again
    let mut config = test_config(dir.path());
    config.persistence.resume_session_id = Some(session_id.clone());
    let provider = Arc::new(TestProvider::new(decomposition_json));

    let resumed = run_swarm(config, provider, spawner.clone(), dir.path(), "")
        .await
        .unwrap();
    assert!(resumed.outcome.success);
    assert_eq!(resumed.outcome.session_id, session_id);
    assert_eq!(spawner.spawn_count(), spawns_before);
    assert!(
        resumed
            .events
            .iter()
            .any(|e| matches!(e, SwarmEvent::StateResume { .. }))
    );
}
