use std::sync::Arc;

use buildloop_core::{MilestoneSummary, Phase, PhaseKind, PhaseResult};
use tracing::{debug, error, info, warn};

use crate::agent::AgentClient;
use crate::checkpoint_store::CheckpointStore;
use crate::classifier::FailureClassifier;
use crate::config::ProjectConfig;
use crate::error::{OrchestratorError, Result};
use crate::layout::{write_atomic, ProjectLayout};
use crate::monitor::ResourceMonitor;
use crate::policy::{PhasePolicy, PolicyTable};
use crate::prompts::{PhasePrompts, PromptContext};
use crate::runner::PhaseRunner;

/// Runs the phases of a milestone in order and aggregates their results.
pub struct MilestoneDriver {
    policies: PolicyTable,
    runner: PhaseRunner,
    resume: bool,
    only: Option<PhaseKind>,
}

impl MilestoneDriver {
    pub fn new(policies: PolicyTable, runner: PhaseRunner) -> Self {
        Self {
            policies,
            runner,
            resume: true,
            only: None,
        }
    }

    /// Wire one monitor, one checkpoint store and one classifier for this
    /// run and hand them to a fresh runner.
    pub fn from_config(
        layout: ProjectLayout,
        config: &ProjectConfig,
        policies: PolicyTable,
        agent: Arc<dyn AgentClient>,
    ) -> Self {
        let monitor = ResourceMonitor::with_sysinfo(config.monitor.clone());
        let store = CheckpointStore::new(layout);
        let classifier = FailureClassifier::new().with_policy(config.retry);
        let runner = PhaseRunner::new(agent, monitor, store, classifier)
            .with_agent_settings(config.agent.clone());
        Self::new(policies, runner)
    }

    /// Skip phases whose checkpoint says completed and whose artifact still exists.
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Run a single phase; earlier phases only contribute their artifacts.
    pub fn with_only(mut self, only: Option<PhaseKind>) -> Self {
        self.only = only;
        self
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    pub fn runner(&self) -> &PhaseRunner {
        &self.runner
    }

    fn layout(&self) -> &ProjectLayout {
        self.runner.layout()
    }

    pub async fn run(&mut self, milestone: u32) -> Result<MilestoneSummary> {
        info!(milestone, resume = self.resume, only = ?self.only, "Milestone started");

        let mut summary = MilestoneSummary::new(milestone);
        let mut prior_artifacts: Vec<(PhaseKind, String)> = Vec::new();

        for kind in PhaseKind::ALL {
            let policy = self.policies.get(kind).clone();

            if let Some(only) = self.only {
                if kind != only {
                    if kind < only && policy.evidence.artifact_present(self.layout(), milestone).await {
                        prior_artifacts.push((kind, self.artifact_display(&policy, milestone)));
                    }
                    continue;
                }
            }

            let mut phase = policy.new_phase();
            let resumed = if self.resume {
                self.try_resume(milestone, &mut phase, &policy).await?
            } else {
                None
            };
            let result = match resumed {
                Some(result) => result,
                None => {
                    let ctx =
                        PromptContext::gather(self.layout(), milestone, &policy, prior_artifacts.clone())
                            .await;
                    let prompt = PhasePrompts::build(kind, milestone, &ctx);
                    debug!(phase = %kind, prompt_length = prompt.len(), "Prompt built");
                    self.runner.run(milestone, &mut phase, &policy, &prompt).await?
                }
            };

            let succeeded = result.is_success();
            summary.push(result);
            if !succeeded {
                error!(milestone, phase = %kind, "Stopping milestone at failed phase");
                break;
            }
            prior_artifacts.push((kind, self.artifact_display(&policy, milestone)));
        }

        self.write_summary(&summary).await;
        info!(
            milestone,
            succeeded = summary.succeeded,
            total_cost_usd = summary.total_cost_usd,
            cost_is_lower_bound = summary.cost_is_lower_bound(),
            total_duration_ms = summary.total_duration_ms,
            "Milestone finished"
        );
        Ok(summary)
    }

    /// Mark `phase` skipped when its checkpoint is completed and its
    /// artifact is still present. The checkpoint's cost carries over.
    async fn try_resume(
        &self,
        milestone: u32,
        phase: &mut Phase,
        policy: &PhasePolicy,
    ) -> Result<Option<PhaseResult>> {
        let checkpoint = match self.runner.store().read(milestone, phase.kind).await {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(milestone, phase = %phase.kind, error = %e, "Unreadable checkpoint, running phase");
                return Ok(None);
            }
        };
        if !checkpoint.is_completed() {
            debug!(milestone, phase = %phase.kind, status = %checkpoint.status, "Checkpoint not completed");
            return Ok(None);
        }
        if !policy.evidence.artifact_present(self.layout(), milestone).await {
            warn!(
                milestone,
                phase = %phase.kind,
                "Checkpoint says completed but the artifact is gone, running phase again"
            );
            return Ok(None);
        }

        phase.skip(Some(self.artifact_display(policy, milestone)))?;
        phase.session_id = checkpoint.session_id.clone();
        phase.cost_usd = checkpoint.cost_usd;
        info!(milestone, phase = %phase.kind, "Phase already completed, skipping");

        Ok(Some(PhaseResult::from_phase(phase, checkpoint.cost_confidence)))
    }

    fn artifact_display(&self, policy: &PhasePolicy, milestone: u32) -> String {
        let path = policy.evidence.artifact_path(self.layout(), milestone);
        self.layout().relative(&path).display().to_string()
    }

    async fn write_summary(&self, summary: &MilestoneSummary) {
        let path = self.layout().summary_path(summary.milestone);
        let written = match serde_json::to_vec_pretty(summary) {
            Ok(json) => write_atomic(&path, &json).await,
            Err(e) => Err(OrchestratorError::Serialization(e.to_string())),
        };
        if let Err(e) = written {
            warn!(path = %path.display(), error = %e, "Failed to write milestone summary");
        }
    }
}
