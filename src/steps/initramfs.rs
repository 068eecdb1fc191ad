// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Initramfs configuration and generation.
//!
//! A ZFS root only boots if the initramfs knows how to import the pool. That
//! takes the `zfs` hook in `HOOKS`, placed immediately before `filesystems`,
//! and any extra kernel modules in `MODULES`, e.g., for early KMS.

use crate::{
    context::RunContext,
    drafter::{ArrayDrafter, Placement},
    pipeline::{ActionTaken, ProbeResult, Result, Step, StepMeta},
    system::{CommandRunner, Invocation, SystemRunner},
};

use glob::{glob, Pattern};
use std::path::PathBuf;
use tracing::info;

/// Token inside a shell array directive of a configuration file.
#[derive(Debug, Clone)]
pub struct ArrayTokenStep {
    meta: StepMeta,
    config: PathBuf,
    key: String,
    token: String,
    placement: Placement,
}

impl ArrayTokenStep {
    /// Construct new token step for file at `config`, relative to the target
    /// root.
    pub fn new(
        id: impl Into<String>,
        config: impl Into<PathBuf>,
        key: impl Into<String>,
        token: impl Into<String>,
        placement: Placement,
    ) -> Self {
        Self {
            meta: StepMeta::new(id),
            config: config.into(),
            key: key.into(),
            token: token.into(),
            placement,
        }
    }

    /// Kernel module appended to `MODULES`.
    pub fn module(config: impl Into<PathBuf>, module: impl Into<String>) -> Self {
        let module = module.into();
        Self::new(
            format!("initramfs-module:{module}"),
            config,
            "MODULES",
            module,
            Placement::Append,
        )
    }

    /// Hook placed immediately before `anchor` in `HOOKS`.
    pub fn hook(
        config: impl Into<PathBuf>,
        hook: impl Into<String>,
        anchor: impl Into<String>,
    ) -> Self {
        let hook = hook.into();
        Self::new(
            format!("initramfs-hook:{hook}"),
            config,
            "HOOKS",
            hook,
            Placement::Before(anchor.into()),
        )
    }

    /// Require other steps to have succeeded first.
    pub fn after(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.meta = self.meta.after(ids);
        self
    }

    fn drafter(&self, ctx: &RunContext) -> ArrayDrafter {
        ArrayDrafter::new(ctx.target_path(&self.config), &self.key)
    }
}

impl Step for ArrayTokenStep {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    fn describe(&self, _ctx: &RunContext) -> String {
        format!(
            "Adding {} to {} in {}",
            self.token,
            self.key,
            self.config.display()
        )
    }

    fn probe(&self, ctx: &RunContext) -> Result<ProbeResult> {
        Ok(match self.drafter(ctx).current()? {
            Some(tokens) => tokens.classify(&self.token, &self.placement),
            None => ProbeResult::Absent,
        })
    }

    fn apply(&self, probe: &ProbeResult, ctx: &RunContext) -> Result<ActionTaken> {
        self.drafter(ctx)
            .edit(|tokens| tokens.place(&self.token, &self.placement))?;

        Ok(ActionTaken::for_probe(probe))
    }
}

/// Initramfs images of every installed kernel.
///
/// Never skipped: images embed the hook and module configuration, so they
/// are rebuilt on every run to pick up whatever the steps before changed.
#[derive(Debug, Clone)]
pub struct InitramfsStep<R = SystemRunner> {
    meta: StepMeta,
    runner: R,
}

impl<R: CommandRunner> InitramfsStep<R> {
    pub fn new(runner: R) -> Self {
        Self {
            meta: StepMeta::new("initramfs-images"),
            runner,
        }
    }

    /// Require other steps to have succeeded first.
    pub fn after(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.meta = self.meta.after(ids);
        self
    }
}

impl<R: CommandRunner> Step for InitramfsStep<R> {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    fn skip_when_satisfied(&self) -> bool {
        false
    }

    fn describe(&self, _ctx: &RunContext) -> String {
        "Regenerating initramfs images".into()
    }

    fn probe(&self, ctx: &RunContext) -> Result<ProbeResult> {
        let boot = ctx.target_path("/boot");
        let pattern = format!("{}/initramfs-*.img", Pattern::escape(&boot.to_string_lossy()));
        let found = glob(&pattern)
            .map(|mut paths| paths.any(|path| path.is_ok()))
            .unwrap_or(false);

        Ok(match found {
            true => ProbeResult::PresentCorrect,
            false => ProbeResult::Absent,
        })
    }

    fn apply(&self, probe: &ProbeResult, ctx: &RunContext) -> Result<ActionTaken> {
        info!("regenerate initramfs images");
        self.runner
            .run_checked(&Invocation::new("mkinitcpio").arg("-P").in_target(&ctx.root))?;

        Ok(ActionTaken::for_probe(probe))
    }
}
