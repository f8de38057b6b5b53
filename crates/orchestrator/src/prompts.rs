use buildloop_core::PhaseKind;
use tokio::fs;
use tracing::debug;

use crate::layout::ProjectLayout;
use crate::policy::PhasePolicy;

/// Everything a phase prompt refers to.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    /// Contents of the milestone's `goal.md`, if it exists.
    pub goal: Option<String>,
    pub description: String,
    /// Project-relative path the phase must write.
    pub artifact: String,
    /// Outputs of earlier phases of this milestone, in pipeline order.
    pub prior_artifacts: Vec<(PhaseKind, String)>,
    pub validation_command: Option<String>,
}

impl PromptContext {
    pub async fn gather(
        layout: &ProjectLayout,
        milestone: u32,
        policy: &PhasePolicy,
        prior_artifacts: Vec<(PhaseKind, String)>,
    ) -> Self {
        let goal_path = layout.goal_path(milestone);
        let goal = match fs::read_to_string(&goal_path).await {
            Ok(goal) if !goal.trim().is_empty() => Some(goal.trim().to_string()),
            _ => {
                debug!(path = %goal_path.display(), "No milestone goal file");
                None
            }
        };
        let artifact = policy.evidence.artifact_path(layout, milestone);

        Self {
            goal,
            description: policy.description.clone(),
            artifact: layout.relative(&artifact).display().to_string(),
            prior_artifacts,
            validation_command: policy.evidence.validation.as_ref().map(|c| c.to_string()),
        }
    }
}

pub struct PhasePrompts;

impl PhasePrompts {
    pub fn build(kind: PhaseKind, milestone: u32, ctx: &PromptContext) -> String {
        let goal = ctx
            .goal
            .clone()
            .unwrap_or_else(|| format!("Complete milestone {} of this project.", milestone));

        let inputs = if ctx.prior_artifacts.is_empty() {
            "None. This is the first phase of the milestone.".to_string()
        } else {
            ctx.prior_artifacts
                .iter()
                .map(|(phase, path)| format!("- {}: `{}`", phase, path))
                .collect::<Vec<_>>()
                .join("\n")
        };

        format!(
            r#"You are working on milestone {milestone}, phase **{phase}**.

## Milestone Goal
{goal}

## This Phase
{description}

## Inputs From Earlier Phases
{inputs}

## Instructions
{instructions}

## Required Output
Write your result to: `{artifact}`
The phase is only considered done once that file exists and is not empty."#,
            milestone = milestone,
            phase = kind,
            goal = goal,
            description = ctx.description,
            inputs = inputs,
            instructions = Self::instructions(kind, ctx),
            artifact = ctx.artifact,
        )
    }

    fn instructions(kind: PhaseKind, ctx: &PromptContext) -> String {
        let check = ctx
            .validation_command
            .as_deref()
            .map(|c| format!("\nRun `{}` and make sure it exits successfully.", c))
            .unwrap_or_default();

        match kind {
            PhaseKind::Research => r#"1. Read the existing code and documentation
2. Identify the libraries, APIs and constraints that matter for the goal
3. List open questions and risks
Do NOT modify source files in this phase."#
                .to_string(),
            PhaseKind::Plan => r#"1. Read the research findings
2. List the files to create or modify
3. Break the work into ordered, verifiable steps
4. Note how each step will be tested
Do NOT implement anything yet. Only create the plan."#
                .to_string(),
            PhaseKind::Implement => r#"1. Read the plan carefully
2. Implement each step in order
3. Keep the project building after every step"#
                .to_string(),
            PhaseKind::Lint | PhaseKind::Typecheck => format!(
                r#"1. Run the {kind} checks for this project
2. Fix every reported problem in the source, not by disabling checks
3. Re-run until clean, then summarize what changed in the report{check}"#
            ),
            PhaseKind::Test | PhaseKind::Integration | PhaseKind::E2e => format!(
                r#"1. Add or update {kind} tests covering the milestone goal
2. Run them and fix failures in the code under test
3. Record the commands you ran and their final results in the report{check}"#
            ),
        }
    }
}
