// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{
    context::RunContext,
    pipeline::{ActionTaken, ProbeResult, Result, Step, StepMeta},
    system::{CommandRunner, Invocation, SystemError, SystemRunner},
};

use std::collections::HashSet;
use tracing::{debug, info};

/// Set of packages installed in target system.
///
/// Dependency resolution is entirely up to pacman.
#[derive(Debug, Clone)]
pub struct PackagesStep<R = SystemRunner> {
    meta: StepMeta,
    runner: R,
    packages: Vec<String>,
}

impl<R: CommandRunner> PackagesStep<R> {
    pub fn new(runner: R, packages: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            meta: StepMeta::new("packages"),
            runner,
            packages: packages.into_iter().map(Into::into).collect(),
        }
    }

    fn pacman(ctx: &RunContext) -> Invocation {
        let invocation = Invocation::new("pacman");
        match ctx.is_host_root() {
            true => invocation,
            false => invocation.arg("--sysroot").arg(ctx.root.to_string_lossy()),
        }
    }

    // INVARIANT: pacman -Q exits non-zero when any listed package is missing,
    // but still prints the ones that are installed.
    fn missing(&self, ctx: &RunContext) -> Result<Option<Vec<String>>> {
        let query = Self::pacman(ctx).arg("-Qq").args(&self.packages);
        let output = match self.runner.run(&query) {
            Ok(output) => output,
            Err(SystemError::Missing { program }) => {
                debug!("{program} is not installed, treating packages as absent");
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        };

        let installed = output.stdout.lines().map(str::trim).collect::<HashSet<_>>();
        Ok(Some(
            self.packages
                .iter()
                .filter(|package| !installed.contains(package.as_str()))
                .cloned()
                .collect(),
        ))
    }
}

impl<R: CommandRunner> Step for PackagesStep<R> {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    fn describe(&self, _ctx: &RunContext) -> String {
        format!("Installing {}", self.packages.join(", "))
    }

    fn probe(&self, ctx: &RunContext) -> Result<ProbeResult> {
        let Some(missing) = self.missing(ctx)? else {
            return Ok(ProbeResult::Absent);
        };

        Ok(match missing.len() {
            0 => ProbeResult::PresentCorrect,
            count if count == self.packages.len() => ProbeResult::Absent,
            _ => ProbeResult::PresentIncorrect(format!("missing {}", missing.join(", "))),
        })
    }

    fn apply(&self, probe: &ProbeResult, ctx: &RunContext) -> Result<ActionTaken> {
        let missing = self
            .missing(ctx)?
            .unwrap_or_else(|| self.packages.clone());
        if missing.is_empty() {
            return Ok(ActionTaken::Skipped);
        }

        info!("install {}", missing.join(" "));
        self.runner.run_checked(
            &Self::pacman(ctx)
                .args(["-S", "--needed", "--noconfirm"])
                .args(missing),
        )?;

        Ok(ActionTaken::for_probe(probe))
    }
}
