//! Single-phase execution.
//!
//! The [`PhaseRunner`] drives one phase through the agent: it streams the
//! agent's messages under the phase timeout, keeps the in-memory history
//! bounded, hands stream errors to the [`FailureClassifier`], gates
//! completion on the phase's evidence and always persists a final
//! checkpoint before returning.

use std::sync::Arc;
use std::time::Duration;

use buildloop_core::{Checkpoint, CostConfidence, FailureRecord, Phase, PhaseKind, PhaseResult};
use futures::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::{normalize_message, AgentClient, AgentMessage, AgentOptions, TerminalMessage};
use crate::checkpoint_store::CheckpointStore;
use crate::classifier::{FailureClassifier, Recovery};
use crate::config::AgentSettings;
use crate::error::{ExecutionContext, OrchestratorError, Result};
use crate::failure_log::FailureLog;
use crate::layout::ProjectLayout;
use crate::monitor::ResourceMonitor;
use crate::policy::PhasePolicy;
use crate::resources::CheckpointGuard;
use crate::trimmer;

/// Prompt characters kept in a manual-intervention report.
pub const PROMPT_EXCERPT_CHARS: usize = 500;

/// Per-attempt stream bookkeeping. Lives outside the timed future so a
/// timeout still knows how far the stream got.
#[derive(Debug, Default)]
struct StreamState {
    history: Vec<AgentMessage>,
    message_count: usize,
    session_id: Option<String>,
    terminal: Option<TerminalMessage>,
}

/// How one attempt ended.
#[derive(Debug)]
enum AttemptOutcome {
    /// The stream ended after a terminal message.
    Finished(TerminalMessage),
    /// The stream ended without a terminal message, or a message was malformed.
    Malformed(String),
    /// An error raised while starting or consuming the stream.
    StreamError(String),
    TimedOut,
}

/// How the phase ended, before it is written back onto the [`Phase`].
enum Verdict {
    Completed {
        session_id: String,
        cost_usd: f64,
        confidence: CostConfidence,
    },
    Failed {
        error: OrchestratorError,
        cost_usd: Option<f64>,
        /// Already appended to the failure log by the classifier.
        logged: bool,
    },
    TimedOut(OrchestratorError),
}

impl Verdict {
    fn failed(error: OrchestratorError, cost_usd: Option<f64>) -> Self {
        Self::Failed {
            error,
            cost_usd,
            logged: false,
        }
    }

    /// The fatal error still missing from the failure log, if any.
    fn unlogged_error(&self) -> Option<&OrchestratorError> {
        match self {
            Self::Failed {
                error,
                logged: false,
                ..
            }
            | Self::TimedOut(error) => Some(error),
            _ => None,
        }
    }
}

pub struct PhaseRunner {
    agent: Arc<dyn AgentClient>,
    monitor: ResourceMonitor,
    store: CheckpointStore,
    classifier: FailureClassifier,
    failure_log: FailureLog,
    agent_settings: AgentSettings,
}

impl PhaseRunner {
    pub fn new(
        agent: Arc<dyn AgentClient>,
        monitor: ResourceMonitor,
        store: CheckpointStore,
        classifier: FailureClassifier,
    ) -> Self {
        let failure_log = FailureLog::new(store.layout());
        Self {
            agent,
            monitor,
            store,
            classifier,
            failure_log,
            agent_settings: AgentSettings::default(),
        }
    }

    pub fn with_agent_settings(mut self, settings: AgentSettings) -> Self {
        self.agent_settings = settings;
        self
    }

    pub fn layout(&self) -> &ProjectLayout {
        self.store.layout()
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    pub fn failure_log(&self) -> &FailureLog {
        &self.failure_log
    }

    /// Run `phase` (which must be `Pending`) to a terminal state.
    ///
    /// Every failure mode is reported through the returned [`PhaseResult`];
    /// `Err` is only returned when `phase` is not in a runnable state.
    pub async fn run(
        &mut self,
        milestone: u32,
        phase: &mut Phase,
        policy: &PhasePolicy,
        prompt: &str,
    ) -> Result<PhaseResult> {
        phase.start()?;
        let mut guard = CheckpointGuard::arm(self.store.clone(), milestone, phase);
        info!(
            milestone,
            phase = %phase.kind,
            timeout_seconds = phase.timeout_seconds,
            max_turns = phase.max_turns,
            "Phase started"
        );

        let mut attempt = 1;
        let mut state = StreamState::default();
        let verdict = loop {
            let ctx = ExecutionContext::new(milestone, phase.kind).with_attempt(attempt);
            let outcome = self.attempt(phase, policy, prompt, &mut state).await;
            let ctx = ExecutionContext {
                message_count: state.message_count,
                session_id: state.session_id.clone(),
                ..ctx
            };

            match outcome {
                AttemptOutcome::Finished(terminal) => {
                    break self.verdict_for_terminal(&ctx, policy, terminal).await;
                }
                AttemptOutcome::Malformed(reason) => {
                    break Verdict::failed(ctx.malformed(reason), None);
                }
                AttemptOutcome::TimedOut => {
                    break Verdict::TimedOut(ctx.timed_out(phase.timeout_seconds));
                }
                AttemptOutcome::StreamError(message) => {
                    // The agent already reported failure; a later teardown
                    // error does not make it recoverable.
                    if let Some(terminal) = state.terminal.clone().filter(|t| t.is_error) {
                        debug!(phase = %phase.kind, error = %message, "Stream error after an error result");
                        break self.verdict_for_terminal(&ctx, policy, terminal).await;
                    }
                    match self.recover(&ctx, policy, &message).await {
                        Recovery::Retry { delay } => {
                            warn!(
                                milestone,
                                phase = %phase.kind,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %message,
                                "Transient protocol error without evidence, retrying"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            state = StreamState::default();
                        }
                        Recovery::Recovered => {
                            break Self::recovered_verdict(&ctx, &state, &message);
                        }
                        Recovery::Exhausted => {
                            break Verdict::Failed {
                                error: OrchestratorError::ManualIntervention {
                                    phase: phase.kind,
                                    attempts: attempt,
                                    message_count: state.message_count,
                                    prompt_excerpt: excerpt(prompt),
                                },
                                cost_usd: None,
                                logged: true,
                            };
                        }
                        Recovery::Fatal => {
                            break Verdict::Failed {
                                error: ctx.phase_failed(message),
                                cost_usd: None,
                                logged: true,
                            };
                        }
                    }
                }
            }
        };

        if let Some(error) = verdict.unlogged_error() {
            let record = FailureRecord::new(phase.kind, attempt, error.failure_kind(), error.to_string());
            self.failure_log.append(&record).await;
        }
        if phase.session_id.is_none() {
            phase.session_id = state.session_id.clone();
        }
        let confidence = Self::apply_verdict(phase, policy, self.layout(), milestone, verdict)?;

        guard.disarm();
        let checkpoint_persisted = self
            .persist(milestone, phase.kind, Checkpoint::from_phase(phase, confidence))
            .await;

        let mut result = PhaseResult::from_phase(phase, confidence)
            .with_message_count(state.message_count)
            .with_attempts(attempt);
        result.checkpoint_persisted = checkpoint_persisted;

        if result.is_success() {
            info!(
                milestone,
                phase = %phase.kind,
                cost_usd = result.cost_usd,
                cost_confidence = ?confidence,
                duration_ms = result.duration_ms,
                message_count = result.message_count,
                attempts = attempt,
                "Phase completed"
            );
        } else {
            error!(
                milestone,
                phase = %phase.kind,
                status = %result.status,
                message_count = result.message_count,
                error = result.error.as_deref().unwrap_or_default(),
                "Phase failed"
            );
        }
        Ok(result)
    }

    /// One invocation of the agent under the phase timeout.
    async fn attempt(
        &mut self,
        phase: &Phase,
        policy: &PhasePolicy,
        prompt: &str,
        state: &mut StreamState,
    ) -> AttemptOutcome {
        let options = AgentOptions::new(self.layout().root(), phase.max_turns)
            .with_allowed_tools(policy.allowed_tools.clone())
            .with_permission_mode(self.agent_settings.permission_mode)
            .with_model(self.agent_settings.model.clone());
        let timeout = Duration::from_secs(phase.timeout_seconds);

        // Dropping the consuming future on timeout drops the stream, which
        // terminates the agent invocation.
        match tokio::time::timeout(
            timeout,
            self.consume(prompt, &options, policy.retention_budget, state),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => AttemptOutcome::TimedOut,
        }
    }

    async fn consume(
        &mut self,
        prompt: &str,
        options: &AgentOptions,
        retention_budget: usize,
        state: &mut StreamState,
    ) -> AttemptOutcome {
        let mut stream = match self.agent.query(prompt, options).await {
            Ok(stream) => stream,
            Err(e) => return AttemptOutcome::StreamError(e.to_string()),
        };

        let mut since_sample = 0;
        while let Some(item) = stream.next().await {
            let raw = match item {
                Ok(raw) => raw,
                Err(e) => return AttemptOutcome::StreamError(e.to_string()),
            };
            state.message_count += 1;

            let message = match normalize_message(raw) {
                Ok(message) => message,
                Err(e) => return AttemptOutcome::Malformed(e.0),
            };
            if let Some(session_id) = message.session_id() {
                state.session_id = Some(session_id.to_string());
            }
            if let Some(terminal) = message.as_terminal() {
                state.terminal = Some(terminal.clone());
            }
            state.history.push(message);

            since_sample += 1;
            if since_sample >= self.monitor.sampling_interval() {
                since_sample = 0;
                self.monitor.sample();
                let cleanup = self.monitor.should_trigger_cleanup();
                self.monitor.adjust_cadence(cleanup);
                let report = trimmer::trim(&mut state.history, retention_budget, cleanup);
                debug!(
                    message_count = state.message_count,
                    retained = report.after,
                    dropped = report.dropped(),
                    under_pressure = cleanup,
                    "Sampled memory"
                );
            } else if state.history.len() > retention_budget {
                let cleanup = self.monitor.should_trigger_cleanup();
                trimmer::trim(&mut state.history, retention_budget, cleanup);
            }
        }

        match state.terminal.take() {
            Some(terminal) => AttemptOutcome::Finished(terminal),
            None => AttemptOutcome::Malformed("stream ended without a terminal result message".to_string()),
        }
    }

    async fn verdict_for_terminal(
        &self,
        ctx: &ExecutionContext,
        policy: &PhasePolicy,
        terminal: TerminalMessage,
    ) -> Verdict {
        if terminal.is_error {
            let detail = terminal
                .result
                .clone()
                .unwrap_or_else(|| "no detail reported".to_string());
            return Verdict::failed(
                OrchestratorError::AgentReported {
                    phase: ctx.phase,
                    subtype: terminal.subtype,
                    message_count: ctx.message_count,
                    detail,
                },
                Some(terminal.cost_usd),
            );
        }

        if !policy.evidence.artifact_present(self.layout(), ctx.milestone).await {
            return Verdict::failed(
                OrchestratorError::EvidenceMismatch {
                    phase: ctx.phase,
                    message_count: ctx.message_count,
                    artifact: policy.evidence.artifact_path(self.layout(), ctx.milestone),
                },
                Some(terminal.cost_usd),
            );
        }

        debug!(
            phase = %ctx.phase,
            cost_field = terminal.cost_field,
            num_turns = ?terminal.num_turns,
            "Terminal message accepted"
        );
        Verdict::Completed {
            session_id: terminal.session_id,
            cost_usd: terminal.cost_usd,
            confidence: CostConfidence::Reported,
        }
    }

    /// Classify a stream error, check evidence for transient ones, log the
    /// record and decide what to do next.
    async fn recover(
        &self,
        ctx: &ExecutionContext,
        policy: &PhasePolicy,
        message: &str,
    ) -> Recovery {
        let mut record = self.classifier.classify(ctx.phase, ctx.attempt, message);
        if record.is_transient_cleanup_error {
            let evidence = policy.evidence.check(self.layout(), ctx.milestone).await;
            debug!(
                phase = %ctx.phase,
                artifact = %evidence.artifact,
                satisfied = evidence.satisfied,
                "Evidence checked after transient error"
            );
            record = record.with_evidence(evidence);
        }
        self.failure_log.append(&record).await;

        let recovery = self.classifier.decide(&record);
        if recovery == Recovery::Recovered {
            warn!(
                phase = %ctx.phase,
                attempt = ctx.attempt,
                error = %message,
                "Transient protocol error after the work was done - treating phase as completed"
            );
        }
        recovery
    }

    fn recovered_verdict(ctx: &ExecutionContext, state: &StreamState, message: &str) -> Verdict {
        // A terminal message that made it through before the teardown error
        // still carries the real cost.
        if let Some(ref terminal) = state.terminal {
            if !terminal.is_error {
                return Verdict::Completed {
                    session_id: terminal.session_id.clone(),
                    cost_usd: terminal.cost_usd,
                    confidence: CostConfidence::Reported,
                };
            }
        }
        debug!(phase = %ctx.phase, error = %message, "Recovered without a terminal message");
        Verdict::Completed {
            session_id: format!("recovered-{}", Uuid::new_v4()),
            cost_usd: 0.0,
            confidence: CostConfidence::Unknown,
        }
    }

    fn apply_verdict(
        phase: &mut Phase,
        policy: &PhasePolicy,
        layout: &ProjectLayout,
        milestone: u32,
        verdict: Verdict,
    ) -> Result<CostConfidence> {
        match verdict {
            Verdict::Completed {
                session_id,
                cost_usd,
                confidence,
            } => {
                let artifact = policy.evidence.artifact_path(layout, milestone);
                phase.complete(
                    session_id,
                    cost_usd,
                    layout.relative(&artifact).display().to_string(),
                )?;
                Ok(confidence)
            }
            Verdict::Failed { error, cost_usd, .. } => {
                phase.fail(error.to_string())?;
                Ok(Self::record_failure_cost(phase, cost_usd))
            }
            Verdict::TimedOut(error) => {
                phase.time_out(error.to_string())?;
                Ok(CostConfidence::Unknown)
            }
        }
    }

    fn record_failure_cost(phase: &mut Phase, cost_usd: Option<f64>) -> CostConfidence {
        match cost_usd {
            Some(cost) => {
                phase.record_cost(cost);
                CostConfidence::Reported
            }
            None => CostConfidence::Unknown,
        }
    }

    /// Write the final checkpoint in its own task so cancellation of the
    /// caller cannot interrupt the write. Failure degrades resumability only.
    async fn persist(&self, milestone: u32, phase: PhaseKind, checkpoint: Checkpoint) -> bool {
        let store = self.store.clone();
        let write = tokio::spawn(async move { store.write(milestone, phase, &checkpoint).await });

        match write.await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(
                    milestone,
                    phase = %phase,
                    error = %e,
                    "Checkpoint write failed - phase will not be resumable"
                );
                false
            }
            Err(e) => {
                warn!(milestone, phase = %phase, error = %e, "Checkpoint write task failed");
                false
            }
        }
    }
}

fn excerpt(prompt: &str) -> String {
    let mut chars = prompt.chars();
    let head: String = chars.by_ref().take(PROMPT_EXCERPT_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}
