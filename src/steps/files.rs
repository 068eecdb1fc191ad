// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{
    context::RunContext,
    drafter::write_managed,
    pipeline::{ActionTaken, ProbeResult, Result, Step, StepError, StepMeta},
};

use std::{fs::read_to_string, io, path::PathBuf};
use tracing::info;

/// Small file whose entire content zprov owns.
///
/// Content is a template that may carry run parameter markers, e.g.,
/// `{pool}`. Markers are substituted when the step runs, not when it is
/// constructed.
#[derive(Debug, Clone)]
pub struct ManagedFileStep {
    meta: StepMeta,
    path: PathBuf,
    template: String,
}

impl ManagedFileStep {
    /// Construct new managed file at `path`, relative to the target root.
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>, template: impl Into<String>) -> Self {
        Self {
            meta: StepMeta::new(id),
            path: path.into(),
            template: template.into(),
        }
    }

    /// Require other steps to have succeeded first.
    pub fn after(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.meta = self.meta.after(ids);
        self
    }

    /// Path of file inside the target system.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Step for ManagedFileStep {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    fn describe(&self, _ctx: &RunContext) -> String {
        format!("Writing {}", self.path.display())
    }

    fn probe(&self, ctx: &RunContext) -> Result<ProbeResult> {
        let path = ctx.target_path(&self.path);
        let content = match read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(ProbeResult::Absent),
            Err(err) => return Err(StepError::Io { source: err, path }),
        };

        if content == ctx.expand(&self.template) {
            return Ok(ProbeResult::PresentCorrect);
        }

        Ok(ProbeResult::PresentIncorrect(format!(
            "{} has unexpected content",
            self.path.display()
        )))
    }

    fn apply(&self, probe: &ProbeResult, ctx: &RunContext) -> Result<ActionTaken> {
        write_managed(ctx.target_path(&self.path), ctx.expand(&self.template))?;
        info!("wrote {:?}", self.path.display());

        Ok(ActionTaken::for_probe(probe))
    }
}
