use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use buildloop_core::{CostConfidence, FailureKind, PhaseKind, PhaseStatus};
use futures::stream::{self, StreamExt};
use orchestrator::agent::MessageStream;
use orchestrator::monitor::ProbeReading;
use orchestrator::{
    AgentClient, AgentError, AgentOptions, CheckpointStore, FailureClassifier, MemoryProbe,
    MilestoneDriver, MonitorSettings, PhaseRunner, PolicyTable, ProjectLayout, ResourceMonitor,
    RetryPolicy,
};
use serde_json::{json, Value};
use tempfile::TempDir;

const TEARDOWN_ERROR: &str = "unhandled errors in a TaskGroup (1 sub-exception)";

/// What the fake agent does for one invocation.
#[derive(Clone)]
enum Script {
    /// Yield these items, then end the stream.
    Messages(Vec<Result<Value, String>>),
    /// Write the artifact named in the prompt, then finish cleanly.
    Work { cost: f64 },
    /// Never yield anything.
    Hang,
    /// Fail before producing a stream.
    Refuse,
    /// Exit with status 1 before producing a stream.
    Exit(&'static str),
}

struct ScriptedAgent {
    scripts: Mutex<VecDeque<Script>>,
    last: Mutex<Option<Script>>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedAgent {
    /// Scripts are used in order; the last one repeats.
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    fn next_script(&self) -> Script {
        let mut last = self.last.lock().unwrap();
        if let Some(script) = self.scripts.lock().unwrap().pop_front() {
            *last = Some(script);
        }
        last.clone().unwrap_or(Script::Hang)
    }
}

#[async_trait]
impl AgentClient for ScriptedAgent {
    async fn query(&self, prompt: &str, options: &AgentOptions) -> Result<MessageStream, AgentError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.prompts.lock().unwrap().push(prompt.to_string());

        let items = match self.next_script() {
            Script::Messages(items) => items,
            Script::Work { cost } => {
                write_requested_artifact(prompt, &options.working_dir);
                let session = format!("sess-{call}");
                vec![
                    Ok(system(&session)),
                    Ok(assistant(&session)),
                    Ok(terminal(&session, json!({ "cost_usd": cost }))),
                ]
            }
            Script::Hang => return Ok(stream::pending().boxed()),
            Script::Refuse => return Err(AgentError::Spawn("refused".to_string())),
            Script::Exit(stderr) => {
                return Err(AgentError::ProcessExit {
                    code: Some(1),
                    stderr: stderr.to_string(),
                })
            }
        };

        let items: Vec<Result<Value, AgentError>> = items
            .into_iter()
            .map(|item| item.map_err(AgentError::Protocol))
            .collect();
        Ok(stream::iter(items).boxed())
    }
}

fn write_requested_artifact(prompt: &str, root: &Path) {
    let marker = "Write your result to: `";
    let start = prompt.find(marker).expect("prompt names an artifact") + marker.len();
    let end = start + prompt[start..].find('`').expect("artifact path is quoted");
    let path = root.join(&prompt[start..end]);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, "findings\n".repeat(20)).unwrap();
}

fn system(session: &str) -> Value {
    json!({ "type": "system", "subtype": "init", "session_id": session })
}

fn assistant(session: &str) -> Value {
    json!({
        "type": "assistant",
        "session_id": session,
        "message": { "content": [{ "type": "text", "text": "working" }] }
    })
}

fn terminal(session: &str, extra: Value) -> Value {
    let mut base = json!({
        "type": "result",
        "subtype": "success",
        "is_error": false,
        "duration_ms": 1500,
        "num_turns": 3,
        "session_id": session,
        "result": "done"
    });
    base.as_object_mut()
        .unwrap()
        .extend(extra.as_object().unwrap().clone());
    base
}

struct QuietProbe;

impl MemoryProbe for QuietProbe {
    fn probe(&mut self) -> Option<ProbeReading> {
        Some(ProbeReading {
            rss_bytes: 100 * 1024 * 1024,
            vms_bytes: 400 * 1024 * 1024,
            cpu_percent: 2.0,
            total_system_bytes: 16 * 1024 * 1024 * 1024,
            available_system_bytes: 8 * 1024 * 1024 * 1024,
        })
    }
}

fn setup_runner(temp_dir: &TempDir, agent: Arc<ScriptedAgent>, retry: RetryPolicy) -> PhaseRunner {
    let layout = ProjectLayout::new(temp_dir.path());
    let monitor = ResourceMonitor::new(Box::new(QuietProbe), MonitorSettings::default());
    let classifier = FailureClassifier::new().with_policy(retry);
    PhaseRunner::new(agent, monitor, CheckpointStore::new(layout), classifier)
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(10))
}

fn write_artifact(layout: &ProjectLayout, milestone: u32, file: &str, bytes: usize) {
    let dir = layout.milestone_dir(milestone);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(file), "x".repeat(bytes)).unwrap();
}

mod runner {
    use super::*;

    #[tokio::test]
    async fn test_clean_run_completes_with_reported_cost() {
        let temp_dir = TempDir::new().unwrap();
        let agent = ScriptedAgent::new(vec![Script::Work { cost: 0.42 }]);
        let mut runner = setup_runner(&temp_dir, agent.clone(), fast_retry());

        let policies = PolicyTable::default();
        let policy = policies.get(PhaseKind::Plan);
        let mut phase = policy.new_phase();
        let result = runner.run(1, &mut phase, policy, "Write your result to: `.buildloop/milestones/milestone_1/plan.md`").await.unwrap();

        assert_eq!(result.status, PhaseStatus::Completed);
        assert_eq!(result.cost_usd, 0.42);
        assert_eq!(result.cost_confidence, CostConfidence::Reported);
        assert_eq!(result.session_id.as_deref(), Some("sess-1"));
        assert_eq!(result.message_count, 3);
        assert_eq!(result.attempts, 1);
        assert!(result.checkpoint_persisted);
        assert_eq!(
            result.output.as_deref(),
            Some(".buildloop/milestones/milestone_1/plan.md")
        );

        let checkpoint = runner.store().read(1, PhaseKind::Plan).await.unwrap().unwrap();
        assert!(checkpoint.is_completed());
        assert_eq!(checkpoint.cost_usd, 0.42);
        assert_eq!(checkpoint.session_id.as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn test_teardown_error_with_evidence_recovers() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ProjectLayout::new(temp_dir.path());
        write_artifact(&layout, 1, "plan.md", 120);

        let agent = ScriptedAgent::new(vec![Script::Messages(vec![
            Ok(system("s-1")),
            Ok(assistant("s-1")),
            Err(TEARDOWN_ERROR.to_string()),
        ])]);
        let mut runner = setup_runner(&temp_dir, agent.clone(), fast_retry());

        let policies = PolicyTable::default();
        let policy = policies.get(PhaseKind::Plan);
        let mut phase = policy.new_phase();
        let result = runner.run(1, &mut phase, policy, "plan it").await.unwrap();

        assert_eq!(result.status, PhaseStatus::Completed);
        assert_eq!(result.cost_usd, 0.0);
        assert_eq!(result.cost_confidence, CostConfidence::Unknown);
        assert!(result.session_id.unwrap().starts_with("recovered-"));
        assert_eq!(agent.calls(), 1);

        let records = runner.failure_log().read_all().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, FailureKind::TransientProtocol);
        assert!(records[0].evidence.as_ref().unwrap().satisfied);

        let checkpoint = runner.store().read(1, PhaseKind::Plan).await.unwrap().unwrap();
        assert_eq!(checkpoint.cost_confidence, CostConfidence::Unknown);
    }

    #[tokio::test]
    async fn test_teardown_error_after_terminal_keeps_reported_cost() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ProjectLayout::new(temp_dir.path());
        write_artifact(&layout, 1, "research.md", 200);

        let agent = ScriptedAgent::new(vec![Script::Messages(vec![
            Ok(system("s-7")),
            Ok(terminal("s-7", json!({ "total_cost_usd": 1.25 }))),
            Err(TEARDOWN_ERROR.to_string()),
        ])]);
        let mut runner = setup_runner(&temp_dir, agent, fast_retry());

        let policies = PolicyTable::default();
        let policy = policies.get(PhaseKind::Research);
        let mut phase = policy.new_phase();
        let result = runner.run(1, &mut phase, policy, "research").await.unwrap();

        assert_eq!(result.status, PhaseStatus::Completed);
        assert_eq!(result.cost_usd, 1.25);
        assert_eq!(result.cost_confidence, CostConfidence::Reported);
        assert_eq!(result.session_id.as_deref(), Some("s-7"));
    }

    #[tokio::test]
    async fn test_teardown_error_without_evidence_needs_manual_intervention() {
        let temp_dir = TempDir::new().unwrap();
        let agent = ScriptedAgent::new(vec![Script::Messages(vec![
            Ok(system("s-1")),
            Err(TEARDOWN_ERROR.to_string()),
        ])]);
        let mut runner = setup_runner(&temp_dir, agent.clone(), fast_retry());

        let policies = PolicyTable::default();
        let policy = policies.get(PhaseKind::Plan);
        let mut phase = policy.new_phase();
        let result = runner.run(1, &mut phase, policy, "plan the work").await.unwrap();

        assert_eq!(result.status, PhaseStatus::Failed);
        assert_eq!(result.attempts, 3);
        assert_eq!(agent.calls(), 3);
        let error = result.error.unwrap();
        assert!(error.contains("manual intervention"), "{error}");
        assert!(error.contains("plan the work"), "{error}");

        let records = runner.failure_log().read_all().await;
        assert_eq!(records.len(), 3);
        assert_eq!(
            records.iter().map(|r| r.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(records.iter().all(|r| !r.evidence.as_ref().unwrap().satisfied));
    }

    #[tokio::test]
    async fn test_retry_after_teardown_error_can_succeed() {
        let temp_dir = TempDir::new().unwrap();
        let agent = ScriptedAgent::new(vec![
            Script::Messages(vec![Err(TEARDOWN_ERROR.to_string())]),
            Script::Work { cost: 0.3 },
        ]);
        let mut runner = setup_runner(&temp_dir, agent.clone(), fast_retry());

        let policies = PolicyTable::default();
        let policy = policies.get(PhaseKind::Research);
        let mut phase = policy.new_phase();
        let prompt = "Write your result to: `.buildloop/milestones/milestone_1/research.md`";
        let result = runner.run(1, &mut phase, policy, prompt).await.unwrap();

        assert_eq!(result.status, PhaseStatus::Completed);
        assert_eq!(result.attempts, 2);
        assert_eq!(result.cost_usd, 0.3);
        assert_eq!(result.session_id.as_deref(), Some("sess-2"));
    }

    #[tokio::test]
    async fn test_unrecognized_error_fails_without_retry() {
        let temp_dir = TempDir::new().unwrap();
        let agent = ScriptedAgent::new(vec![Script::Messages(vec![
            Ok(system("s-1")),
            Err("connection refused".to_string()),
        ])]);
        let mut runner = setup_runner(&temp_dir, agent.clone(), fast_retry());

        let policies = PolicyTable::default();
        let policy = policies.get(PhaseKind::Lint);
        let mut phase = policy.new_phase();
        let result = runner.run(1, &mut phase, policy, "lint").await.unwrap();

        assert_eq!(result.status, PhaseStatus::Failed);
        assert_eq!(agent.calls(), 1);
        assert_eq!(result.cost_confidence, CostConfidence::Unknown);
        let error = result.error.unwrap();
        assert!(error.contains("lint"), "{error}");
        assert!(error.contains("connection refused"), "{error}");

        let records = runner.failure_log().read_all().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, FailureKind::Unrecognized);
        assert!(records[0].evidence.is_none());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let agent = ScriptedAgent::new(vec![Script::Refuse]);
        let mut runner = setup_runner(&temp_dir, agent.clone(), fast_retry());

        let policies = PolicyTable::default();
        let policy = policies.get(PhaseKind::Research);
        let mut phase = policy.new_phase();
        let result = runner.run(1, &mut phase, policy, "research").await.unwrap();

        assert_eq!(result.status, PhaseStatus::Failed);
        assert_eq!(result.message_count, 0);
        assert!(result.error.unwrap().contains("refused"));
    }

    #[tokio::test]
    async fn test_missing_artifact_never_completes() {
        let temp_dir = TempDir::new().unwrap();
        let agent = ScriptedAgent::new(vec![Script::Messages(vec![
            Ok(system("s-1")),
            Ok(terminal("s-1", json!({ "cost_usd": 0.2 }))),
        ])]);
        let mut runner = setup_runner(&temp_dir, agent, fast_retry());

        let policies = PolicyTable::default();
        let policy = policies.get(PhaseKind::Plan);
        let mut phase = policy.new_phase();
        let result = runner.run(1, &mut phase, policy, "plan").await.unwrap();

        assert_eq!(result.status, PhaseStatus::Failed);
        assert_eq!(result.cost_usd, 0.2);
        let error = result.error.unwrap();
        assert!(error.contains("missing or empty"), "{error}");
        assert!(error.contains("after 2 messages"), "{error}");

        let checkpoint = runner.store().read(1, PhaseKind::Plan).await.unwrap().unwrap();
        assert_eq!(checkpoint.status, PhaseStatus::Failed);

        let records = runner.failure_log().read_all().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, FailureKind::EvidenceMismatch);
        assert!(!records[0].is_retryable);
    }

    #[tokio::test]
    async fn test_empty_artifact_does_not_count() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ProjectLayout::new(temp_dir.path());
        write_artifact(&layout, 1, "plan.md", 0);

        let agent = ScriptedAgent::new(vec![Script::Messages(vec![Ok(terminal(
            "s-1",
            json!({ "cost_usd": 0.2 }),
        ))])]);
        let mut runner = setup_runner(&temp_dir, agent, fast_retry());

        let policies = PolicyTable::default();
        let policy = policies.get(PhaseKind::Plan);
        let mut phase = policy.new_phase();
        let result = runner.run(1, &mut phase, policy, "plan").await.unwrap();

        assert_eq!(result.status, PhaseStatus::Failed);
    }

    #[tokio::test]
    async fn test_stream_without_terminal_is_malformed() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ProjectLayout::new(temp_dir.path());
        write_artifact(&layout, 1, "plan.md", 120);

        let agent = ScriptedAgent::new(vec![Script::Messages(vec![
            Ok(system("s-1")),
            Ok(assistant("s-1")),
        ])]);
        let mut runner = setup_runner(&temp_dir, agent, fast_retry());

        let policies = PolicyTable::default();
        let policy = policies.get(PhaseKind::Plan);
        let mut phase = policy.new_phase();
        let result = runner.run(1, &mut phase, policy, "plan").await.unwrap();

        assert_eq!(result.status, PhaseStatus::Failed);
        assert_eq!(result.message_count, 2);
        assert_eq!(result.session_id.as_deref(), Some("s-1"));
        let error = result.error.unwrap();
        assert!(error.contains("malformed"), "{error}");
        assert!(error.contains("without a terminal"), "{error}");

        let records = runner.failure_log().read_all().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, FailureKind::MalformedResponse);
    }

    #[tokio::test]
    async fn test_terminal_without_cost_is_malformed() {
        let temp_dir = TempDir::new().unwrap();
        let mut bare = terminal("s-1", json!({}));
        bare.as_object_mut().unwrap().remove("result");
        let agent = ScriptedAgent::new(vec![Script::Messages(vec![Ok(bare)])]);
        let mut runner = setup_runner(&temp_dir, agent, fast_retry());

        let policies = PolicyTable::default();
        let policy = policies.get(PhaseKind::Plan);
        let mut phase = policy.new_phase();
        let result = runner.run(1, &mut phase, policy, "plan").await.unwrap();

        assert_eq!(result.status, PhaseStatus::Failed);
        assert!(result.error.unwrap().contains("cost"));
    }

    #[tokio::test]
    async fn test_error_terminal_fails_and_keeps_cost() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ProjectLayout::new(temp_dir.path());
        write_artifact(&layout, 1, "plan.md", 120);

        let agent = ScriptedAgent::new(vec![Script::Messages(vec![Ok(terminal(
            "s-1",
            json!({ "subtype": "error_max_turns", "is_error": true, "cost": 0.9 }),
        ))])]);
        let mut runner = setup_runner(&temp_dir, agent, fast_retry());

        let policies = PolicyTable::default();
        let policy = policies.get(PhaseKind::Plan);
        let mut phase = policy.new_phase();
        let result = runner.run(1, &mut phase, policy, "plan").await.unwrap();

        assert_eq!(result.status, PhaseStatus::Failed);
        assert_eq!(result.cost_usd, 0.9);
        assert_eq!(result.cost_confidence, CostConfidence::Reported);
        assert!(result.error.unwrap().contains("error_max_turns"));

        let records = runner.failure_log().read_all().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, FailureKind::AgentReported);
    }

    fn error_result_then_teardown() -> Script {
        Script::Messages(vec![
            Ok(system("s-1")),
            Ok(terminal(
                "s-1",
                json!({ "subtype": "error_max_turns", "is_error": true, "cost_usd": 0.9 }),
            )),
            Err(TEARDOWN_ERROR.to_string()),
        ])
    }

    #[tokio::test]
    async fn test_error_result_then_teardown_error_is_not_recovered() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ProjectLayout::new(temp_dir.path());
        write_artifact(&layout, 1, "plan.md", 200);

        let agent = ScriptedAgent::new(vec![error_result_then_teardown()]);
        let mut runner = setup_runner(&temp_dir, agent.clone(), fast_retry());

        let policies = PolicyTable::default();
        let policy = policies.get(PhaseKind::Plan);
        let mut phase = policy.new_phase();
        let result = runner.run(1, &mut phase, policy, "plan").await.unwrap();

        assert_eq!(result.status, PhaseStatus::Failed);
        assert_eq!(result.attempts, 1);
        assert_eq!(agent.calls(), 1);
        assert_eq!(result.cost_usd, 0.9);
        assert_eq!(result.cost_confidence, CostConfidence::Reported);
        assert_eq!(result.session_id.as_deref(), Some("s-1"));
        assert!(result.error.unwrap().contains("error_max_turns"));

        let checkpoint = runner.store().read(1, PhaseKind::Plan).await.unwrap().unwrap();
        assert!(!checkpoint.is_completed());
    }

    #[tokio::test]
    async fn test_error_result_then_teardown_error_is_not_retried() {
        let temp_dir = TempDir::new().unwrap();
        let agent = ScriptedAgent::new(vec![error_result_then_teardown()]);
        let mut runner = setup_runner(&temp_dir, agent.clone(), fast_retry());

        let policies = PolicyTable::default();
        let policy = policies.get(PhaseKind::Plan);
        let mut phase = policy.new_phase();
        let result = runner.run(1, &mut phase, policy, "plan").await.unwrap();

        assert_eq!(result.status, PhaseStatus::Failed);
        assert_eq!(agent.calls(), 1);
        let error = result.error.unwrap();
        assert!(!error.contains("manual intervention"), "{error}");
        assert!(error.contains("error_max_turns"), "{error}");

        let records = runner.failure_log().read_all().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, FailureKind::AgentReported);
    }

    #[tokio::test]
    async fn test_agent_exit_keeps_its_stderr_and_is_not_retried() {
        let temp_dir = TempDir::new().unwrap();
        let agent = ScriptedAgent::new(vec![Script::Exit("error: invalid API key")]);
        let mut runner = setup_runner(&temp_dir, agent.clone(), fast_retry());

        let policies = PolicyTable::default();
        let policy = policies.get(PhaseKind::Plan);
        let mut phase = policy.new_phase();
        let result = runner.run(1, &mut phase, policy, "plan").await.unwrap();

        assert_eq!(result.status, PhaseStatus::Failed);
        assert_eq!(agent.calls(), 1);
        let error = result.error.unwrap();
        assert!(error.contains("invalid API key"), "{error}");
        assert!(!error.contains("manual intervention"), "{error}");
    }

    #[tokio::test]
    async fn test_timeout_is_recorded() {
        let temp_dir = TempDir::new().unwrap();
        let agent = ScriptedAgent::new(vec![Script::Hang]);
        let mut runner = setup_runner(&temp_dir, agent, fast_retry());

        let mut policy = PolicyTable::default().get(PhaseKind::Test).clone();
        policy.timeout_seconds = 1;
        let mut phase = policy.new_phase();
        let result = runner.run(1, &mut phase, &policy, "test").await.unwrap();

        assert_eq!(result.status, PhaseStatus::TimedOut);
        assert_eq!(result.cost_confidence, CostConfidence::Unknown);
        let error = result.error.unwrap();
        assert!(error.contains("timed out after 1s"), "{error}");

        let checkpoint = runner.store().read(1, PhaseKind::Test).await.unwrap().unwrap();
        assert_eq!(checkpoint.status, PhaseStatus::TimedOut);

        let records = runner.failure_log().read_all().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, FailureKind::Timeout);
    }

    #[tokio::test]
    async fn test_long_stream_is_counted_in_full() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ProjectLayout::new(temp_dir.path());
        write_artifact(&layout, 1, "lint_report.md", 120);

        let mut messages: Vec<Result<Value, String>> =
            (0..400).map(|_| Ok(assistant("s-1"))).collect();
        messages.push(Ok(terminal("s-1", json!({ "cost_usd": 0.05 }))));
        let agent = ScriptedAgent::new(vec![Script::Messages(messages)]);
        let mut runner = setup_runner(&temp_dir, agent, fast_retry());

        let policies = PolicyTable::default();
        let policy = policies.get(PhaseKind::Lint);
        let mut phase = policy.new_phase();
        let result = runner.run(1, &mut phase, policy, "lint").await.unwrap();

        assert_eq!(result.status, PhaseStatus::Completed);
        assert_eq!(result.message_count, 401);
        assert!(!runner.monitor().is_empty());
    }

    #[tokio::test]
    async fn test_phase_must_be_pending() {
        let temp_dir = TempDir::new().unwrap();
        let agent = ScriptedAgent::new(vec![Script::Work { cost: 0.1 }]);
        let mut runner = setup_runner(&temp_dir, agent.clone(), fast_retry());

        let policies = PolicyTable::default();
        let policy = policies.get(PhaseKind::Plan);
        let mut phase = policy.new_phase();
        phase.start().unwrap();

        assert!(runner.run(1, &mut phase, policy, "plan").await.is_err());
        assert_eq!(agent.calls(), 0);
    }
}

mod driver {
    use super::*;

    fn setup_driver(temp_dir: &TempDir, agent: Arc<ScriptedAgent>) -> MilestoneDriver {
        MilestoneDriver::new(PolicyTable::default(), setup_runner(temp_dir, agent, fast_retry()))
    }

    #[tokio::test]
    async fn test_full_milestone_runs_every_phase() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ProjectLayout::new(temp_dir.path());
        std::fs::create_dir_all(layout.milestone_dir(1)).unwrap();
        std::fs::write(layout.goal_path(1), "Build a todo list CLI").unwrap();

        let agent = ScriptedAgent::new(vec![Script::Work { cost: 0.25 }]);
        let mut driver = setup_driver(&temp_dir, agent.clone());
        let summary = driver.run(1).await.unwrap();

        assert!(summary.succeeded);
        assert_eq!(summary.results.len(), PhaseKind::ALL.len());
        assert!(summary.results.iter().all(|r| r.status == PhaseStatus::Completed));
        assert!((summary.total_cost_usd - 2.0).abs() < 1e-9);
        assert!(!summary.cost_is_lower_bound());
        assert_eq!(agent.calls(), PhaseKind::ALL.len());

        let prompts = agent.prompts();
        assert!(prompts.iter().all(|p| p.contains("Build a todo list CLI")));
        assert!(prompts[1].contains("- research: `.buildloop/milestones/milestone_1/research.md`"));

        assert!(layout.summary_path(1).exists());
        let checkpoints = driver.runner().store().read_milestone(1).await.unwrap();
        assert_eq!(checkpoints.len(), PhaseKind::ALL.len());
    }

    #[tokio::test]
    async fn test_stops_at_first_failure() {
        let temp_dir = TempDir::new().unwrap();
        let agent = ScriptedAgent::new(vec![
            Script::Work { cost: 0.1 },
            Script::Work { cost: 0.1 },
            Script::Messages(vec![Ok(system("s-3"))]),
        ]);
        let mut driver = setup_driver(&temp_dir, agent.clone());
        let summary = driver.run(1).await.unwrap();

        assert!(!summary.succeeded);
        assert_eq!(summary.failed_phase, Some(PhaseKind::Implement));
        assert_eq!(summary.results.len(), 3);
        assert_eq!(agent.calls(), 3);

        let lint = driver.runner().store().read(1, PhaseKind::Lint).await.unwrap();
        assert!(lint.is_none());
    }

    #[tokio::test]
    async fn test_resume_skips_completed_phases() {
        let temp_dir = TempDir::new().unwrap();
        let first = ScriptedAgent::new(vec![
            Script::Work { cost: 0.5 },
            Script::Work { cost: 0.5 },
            Script::Messages(vec![Err("boom".to_string())]),
        ]);
        let summary = setup_driver(&temp_dir, first).run(1).await.unwrap();
        assert_eq!(summary.failed_phase, Some(PhaseKind::Implement));

        let second = ScriptedAgent::new(vec![Script::Work { cost: 0.1 }]);
        let mut driver = setup_driver(&temp_dir, second.clone());
        let summary = driver.run(1).await.unwrap();

        assert!(summary.succeeded);
        assert_eq!(summary.results[0].status, PhaseStatus::Skipped);
        assert_eq!(summary.results[1].status, PhaseStatus::Skipped);
        assert_eq!(summary.results[0].cost_usd, 0.5);
        assert_eq!(second.calls(), PhaseKind::ALL.len() - 2);
        assert!((summary.total_cost_usd - (1.0 + 0.6)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_resume_reruns_phase_whose_artifact_is_gone() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ProjectLayout::new(temp_dir.path());
        let agent = ScriptedAgent::new(vec![Script::Work { cost: 0.1 }]);
        setup_driver(&temp_dir, agent).run(1).await.unwrap();

        std::fs::remove_file(layout.milestone_dir(1).join("plan.md")).unwrap();

        let again = ScriptedAgent::new(vec![Script::Work { cost: 0.1 }]);
        let summary = setup_driver(&temp_dir, again.clone()).run(1).await.unwrap();

        assert_eq!(again.calls(), 1);
        assert_eq!(summary.results[1].phase, PhaseKind::Plan);
        assert_eq!(summary.results[1].status, PhaseStatus::Completed);
        assert!(layout.milestone_dir(1).join("plan.md").exists());
    }

    #[tokio::test]
    async fn test_no_resume_runs_everything_again() {
        let temp_dir = TempDir::new().unwrap();
        let agent = ScriptedAgent::new(vec![Script::Work { cost: 0.1 }]);
        setup_driver(&temp_dir, agent).run(1).await.unwrap();

        let again = ScriptedAgent::new(vec![Script::Work { cost: 0.1 }]);
        let summary = setup_driver(&temp_dir, again.clone())
            .with_resume(false)
            .run(1)
            .await
            .unwrap();

        assert_eq!(again.calls(), PhaseKind::ALL.len());
        assert!(summary.results.iter().all(|r| r.status == PhaseStatus::Completed));
    }

    #[tokio::test]
    async fn test_only_runs_a_single_phase() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ProjectLayout::new(temp_dir.path());
        write_artifact(&layout, 3, "research.md", 200);

        let agent = ScriptedAgent::new(vec![Script::Work { cost: 0.1 }]);
        let summary = setup_driver(&temp_dir, agent.clone())
            .with_only(Some(PhaseKind::Lint))
            .run(3)
            .await
            .unwrap();

        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.results[0].phase, PhaseKind::Lint);
        assert_eq!(agent.calls(), 1);

        let prompt = &agent.prompts()[0];
        assert!(prompt.contains("- research: `.buildloop/milestones/milestone_3/research.md`"));
        assert!(!prompt.contains("- plan:"));
    }

    #[tokio::test]
    async fn test_recovered_phase_makes_cost_a_lower_bound() {
        let temp_dir = TempDir::new().unwrap();
        let layout = ProjectLayout::new(temp_dir.path());
        write_artifact(&layout, 1, "research.md", 200);

        let agent = ScriptedAgent::new(vec![
            Script::Messages(vec![Ok(system("s-1")), Err(TEARDOWN_ERROR.to_string())]),
            Script::Work { cost: 0.1 },
        ]);
        let summary = setup_driver(&temp_dir, agent).run(1).await.unwrap();

        assert!(summary.succeeded);
        assert_eq!(summary.unknown_cost_phases, vec![PhaseKind::Research]);
        assert!(summary.cost_is_lower_bound());
    }
}
