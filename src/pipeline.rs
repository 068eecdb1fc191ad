// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Step abstraction and pipeline runner.
//!
//! A __step__ is one idempotent unit of provisioning work. It is split into
//! two halves:
//!
//! - __probe__: read-only inspection of one resource, classified as
//!   [`ProbeResult::Absent`], [`ProbeResult::PresentCorrect`], or
//!   [`ProbeResult::PresentIncorrect`].
//! - __apply__: the minimal mutation that brings the resource to its desired
//!   state.
//!
//! A __pipeline__ is a fixed sequence of steps. Dependency order is enforced
//! when the pipeline is constructed, never computed at run time. The runner
//! visits steps strictly in order and stops at the first failure. Nothing is
//! rolled back: partitioning a disk or creating a pool cannot be undone by
//! software, so recovery is left to the operator.
//!
//! # Idempotence
//!
//! Every step must be safe to apply twice in a row. Once a step has been
//! applied, probing it again must report [`ProbeResult::PresentCorrect`]. The
//! runner checks this after every mutation and fails the step if the resource
//! did not converge.

use crate::{
    context::RunContext,
    drafter::DraftError,
    prompt::{Prompt, PromptError},
    system::SystemError,
};

use std::{
    collections::HashSet,
    fmt::{Display, Formatter, Result as FmtResult},
    io,
    path::PathBuf,
};
use tracing::{debug, info, info_span, warn};

/// Classification of a resource's current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// Resource does not exist, or is not configured at all.
    Absent,

    /// Resource exists in its desired state.
    PresentCorrect,

    /// Resource exists, but deviates from its desired state.
    PresentIncorrect(String),
}

impl ProbeResult {
    /// Check if resource needs no further work.
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::PresentCorrect)
    }
}

impl Display for ProbeResult {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Absent => fmt.write_str("absent"),
            Self::PresentCorrect => fmt.write_str("present"),
            Self::PresentIncorrect(detail) => write!(fmt, "incorrect ({detail})"),
        }
    }
}

/// What a step did to its resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionTaken {
    /// Resource was already in its desired state.
    Skipped,

    /// Resource did not exist and was created.
    Created,

    /// Resource existed and was brought to its desired state.
    Modified,

    /// Optional collaborator failed, resource left for manual follow-up.
    Deferred(String),
}

impl ActionTaken {
    /// Action that corresponds to mutating a resource in given state.
    pub fn for_probe(probe: &ProbeResult) -> Self {
        match probe {
            ProbeResult::Absent => Self::Created,
            _ => Self::Modified,
        }
    }

    /// Check if action changed the system.
    pub fn is_mutation(&self) -> bool {
        matches!(self, Self::Created | Self::Modified)
    }
}

impl Display for ActionTaken {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Skipped => fmt.write_str("skipped"),
            Self::Created => fmt.write_str("created"),
            Self::Modified => fmt.write_str("modified"),
            Self::Deferred(_) => fmt.write_str("deferred"),
        }
    }
}

/// Identity of a step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepMeta {
    id: String,
    after: Vec<String>,
}

impl StepMeta {
    /// Construct new step identity without dependencies.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            after: Vec::new(),
        }
    }

    /// Require steps to have succeeded first.
    pub fn after(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.after.extend(ids.into_iter().map(Into::into));
        self
    }
}

/// One idempotent unit of provisioning work.
pub trait Step {
    /// Identity of step.
    fn meta(&self) -> &StepMeta;

    /// Unique identifier of step.
    fn id(&self) -> &str {
        &self.meta().id
    }

    /// Identifiers of steps that must have succeeded first.
    fn dependencies(&self) -> &[String] {
        &self.meta().after
    }

    /// Check if applying step destroys existing data.
    ///
    /// Destructive steps are only applied after operator confirmation.
    fn is_destructive(&self) -> bool {
        false
    }

    /// Check if step may be skipped when its resource is already correct.
    fn skip_when_satisfied(&self) -> bool {
        true
    }

    /// Short human-readable account of what applying step does.
    fn describe(&self, _ctx: &RunContext) -> String {
        self.id().to_owned()
    }

    /// Inspect current state of resource without mutating anything.
    ///
    /// # Errors
    ///
    /// - Return [`StepError`] only if inspection itself is impossible. A
    ///   resource that is merely unconfigured is [`ProbeResult::Absent`].
    fn probe(&self, ctx: &RunContext) -> Result<ProbeResult>;

    /// Bring resource to its desired state.
    ///
    /// # Errors
    ///
    /// - Return [`StepError`] if mutation fails.
    fn apply(&self, probe: &ProbeResult, ctx: &RunContext) -> Result<ActionTaken>;
}

/// Perform minimal work needed for step given its probe result.
///
/// A satisfied step that may be skipped is left alone. Everything else is
/// handed to [`Step::apply`].
///
/// # Errors
///
/// - Return [`StepError`] if applying step fails.
pub fn execute(step: &dyn Step, probe: &ProbeResult, ctx: &RunContext) -> Result<ActionTaken> {
    if probe.is_satisfied() && step.skip_when_satisfied() {
        debug!("{} already satisfied", step.id());
        return Ok(ActionTaken::Skipped);
    }

    step.apply(probe, ctx)
}

/// Per-step outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEntry {
    pub step: String,
    pub action: ActionTaken,
}

/// Append-only record of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    entries: Vec<ReportEntry>,
    declined: Option<String>,
}

impl RunReport {
    /// Record outcome of step.
    pub fn record(&mut self, step: impl Into<String>, action: ActionTaken) {
        self.entries.push(ReportEntry {
            step: step.into(),
            action,
        });
    }

    /// Record that operator refused to let step run.
    pub fn decline(&mut self, step: impl Into<String>) {
        self.declined = Some(step.into());
    }

    /// Outcomes in execution order.
    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    /// Step the operator refused to run, if any.
    pub fn declined(&self) -> Option<&str> {
        self.declined.as_deref()
    }

    /// Steps left for manual follow-up, with their reasons.
    pub fn deferred(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().filter_map(|entry| match &entry.action {
            ActionTaken::Deferred(reason) => Some((entry.step.as_str(), reason.as_str())),
            _ => None,
        })
    }
}

/// Read-only probe result of one step.
#[derive(Debug)]
pub struct SurveyEntry {
    pub step: String,
    pub probe: Result<ProbeResult>,
}

/// Fixed, dependency-ordered sequence of steps.
pub struct Pipeline {
    steps: Vec<Box<dyn Step>>,
}

impl Pipeline {
    /// Construct new pipeline.
    ///
    /// # Errors
    ///
    /// - Return [`PipelineError::DuplicateStep`] if two steps share an id.
    /// - Return [`PipelineError::DependencyOrder`] if a step depends on a step
    ///   that does not come before it.
    pub fn new(steps: Vec<Box<dyn Step>>) -> Result<Self, PipelineError> {
        let mut seen = HashSet::new();
        for step in &steps {
            for dependency in step.dependencies() {
                if !seen.contains(dependency.as_str()) {
                    return Err(PipelineError::DependencyOrder {
                        step: step.id().to_owned(),
                        dependency: dependency.clone(),
                    });
                }
            }

            if !seen.insert(step.id()) {
                return Err(PipelineError::DuplicateStep {
                    step: step.id().to_owned(),
                });
            }
        }

        Ok(Self { steps })
    }

    /// Identifiers of steps in execution order.
    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.id()).collect()
    }

    /// Run every step in order.
    ///
    /// Destructive steps whose resource is not already correct are only
    /// applied after the operator confirms. Declining stops the run without
    /// error, and without touching the declined step or any step after it.
    ///
    /// # Errors
    ///
    /// - Return [`PipelineFailure`] at the first step that fails. Steps
    ///   applied before it stay applied, and are listed in the failure's
    ///   report.
    pub fn run(&self, ctx: &RunContext, prompt: &dyn Prompt) -> Result<RunReport, PipelineFailure> {
        let mut report = RunReport::default();
        for step in &self.steps {
            let span = info_span!("step", id = step.id());
            let _guard = span.enter();

            match run_step(step.as_ref(), ctx, prompt) {
                Ok(Some(action)) => {
                    info!("{}: {action}", step.id());
                    report.record(step.id(), action);
                }
                Ok(None) => {
                    warn!("operator declined {}, stopping", step.id());
                    report.decline(step.id());
                    return Ok(report);
                }
                Err(error) => {
                    return Err(PipelineFailure {
                        step: step.id().to_owned(),
                        error,
                        report,
                    })
                }
            }
        }

        Ok(report)
    }

    /// Probe every step without applying anything.
    pub fn survey(&self, ctx: &RunContext) -> Vec<SurveyEntry> {
        self.steps
            .iter()
            .map(|step| SurveyEntry {
                step: step.id().to_owned(),
                probe: step.probe(ctx),
            })
            .collect()
    }
}

// INVARIANT: Ok(None) means the operator declined a destructive step.
fn run_step(step: &dyn Step, ctx: &RunContext, prompt: &dyn Prompt) -> Result<Option<ActionTaken>> {
    let probe = step.probe(ctx)?;
    debug!("{} is {probe}", step.id());

    if step.is_destructive() && !probe.is_satisfied() {
        let question = format!(
            "{} is destructive (currently {probe}). Continue?",
            step.describe(ctx)
        );
        if !prompt.confirm(&question, false)? {
            return Ok(None);
        }
    }

    let action = execute(step, &probe, ctx)?;
    if let ActionTaken::Deferred(reason) = &action {
        warn!("{} deferred: {reason}", step.id());
    }

    if action.is_mutation() {
        let after = step.probe(ctx)?;
        if !after.is_satisfied() {
            return Err(StepError::Unconverged {
                detail: after.to_string(),
            });
        }
    }

    Ok(Some(action))
}

/// Step failure error types.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// External tool failed.
    #[error(transparent)]
    System(#[from] SystemError),

    /// Configuration file could not be edited.
    #[error(transparent)]
    Draft(#[from] DraftError),

    /// Operator could not be asked for confirmation.
    #[error(transparent)]
    Prompt(#[from] PromptError),

    /// Resource on disk could not be inspected or written.
    #[error("failed to access {:?}", path.display())]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Step cannot proceed with the parameters it was given.
    #[error("{detail}")]
    Invalid { detail: String },

    /// Probe after apply still reports resource as unsatisfied.
    #[error("resource is still {detail} after applying step")]
    Unconverged { detail: String },
}

/// Pipeline construction error types.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Two steps share an identifier.
    #[error("step {step:?} is listed twice")]
    DuplicateStep { step: String },

    /// Step depends on a step that does not precede it.
    #[error("step {step:?} depends on {dependency:?}, which does not run before it")]
    DependencyOrder { step: String, dependency: String },
}

/// Run halted at a failing step.
#[derive(Debug, thiserror::Error)]
#[error("step {step:?} failed")]
pub struct PipelineFailure {
    /// Identifier of failing step.
    pub step: String,

    /// Why step failed.
    #[source]
    pub error: StepError,

    /// Steps completed before the failure.
    pub report: RunReport,
}

/// Friendly result alias :3
pub type Result<T, E = StepError> = std::result::Result<T, E>;
