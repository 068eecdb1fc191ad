// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{
    context::RunContext,
    pipeline::{ActionTaken, ProbeResult, Result, Step, StepMeta},
    system::{CommandRunner, Invocation, SystemError, SystemRunner},
};

use tracing::{debug, info};

/// Enabled systemd unit.
#[derive(Debug, Clone)]
pub struct ServiceStep<R = SystemRunner> {
    meta: StepMeta,
    runner: R,
    unit: String,
}

impl<R: CommandRunner> ServiceStep<R> {
    pub fn new(runner: R, unit: impl Into<String>) -> Self {
        let unit = unit.into();
        Self {
            meta: StepMeta::new(format!("service:{unit}")),
            runner,
            unit,
        }
    }

    /// Require other steps to have succeeded first.
    pub fn after(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.meta = self.meta.after(ids);
        self
    }

    fn systemctl(&self, ctx: &RunContext, verb: &str) -> Invocation {
        let mut invocation = Invocation::new("systemctl");
        if !ctx.is_host_root() {
            invocation = invocation.arg(format!("--root={}", ctx.root.display()));
        }

        invocation.arg(verb).arg(&self.unit)
    }
}

impl<R: CommandRunner> Step for ServiceStep<R> {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    fn describe(&self, _ctx: &RunContext) -> String {
        format!("Enabling {}", self.unit)
    }

    // INVARIANT: is-enabled exits non-zero for anything but enabled units, so
    // its output is inspected regardless of exit status.
    fn probe(&self, ctx: &RunContext) -> Result<ProbeResult> {
        let output = match self.runner.run(&self.systemctl(ctx, "is-enabled")) {
            Ok(output) => output,
            Err(SystemError::Missing { program }) => {
                debug!("{program} is not installed, treating {} as absent", self.unit);
                return Ok(ProbeResult::Absent);
            }
            Err(error) => return Err(error.into()),
        };

        Ok(match output.stdout.trim() {
            "enabled" | "enabled-runtime" => ProbeResult::PresentCorrect,
            "masked" | "masked-runtime" => {
                ProbeResult::PresentIncorrect(format!("{} is masked", self.unit))
            }
            _ => ProbeResult::Absent,
        })
    }

    fn apply(&self, probe: &ProbeResult, ctx: &RunContext) -> Result<ActionTaken> {
        // INVARIANT: A masked unit is the only incorrect state, and cannot be
        // enabled before it is unmasked.
        if let ProbeResult::PresentIncorrect(_) = probe {
            info!("unmask {}", self.unit);
            self.runner.run_checked(&self.systemctl(ctx, "unmask"))?;
        }

        info!("enable {}", self.unit);
        self.runner.run_checked(&self.systemctl(ctx, "enable"))?;

        Ok(ActionTaken::for_probe(probe))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{fake::FakeRunner, CommandOutput};
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;
    use std::{cell::RefCell, rc::Rc};

    #[test_case(CommandOutput::success("enabled\n"), ProbeResult::PresentCorrect; "enabled")]
    #[test_case(
        CommandOutput { success: false, code: Some(1), stdout: "disabled\n".into(), stderr: String::new() },
        ProbeResult::Absent;
        "disabled"
    )]
    #[test_case(
        CommandOutput { success: false, code: Some(1), stdout: "masked\n".into(), stderr: String::new() },
        ProbeResult::PresentIncorrect("sshd.service is masked".into());
        "masked"
    )]
    #[test_case(CommandOutput::failure(4, "No such file or directory"), ProbeResult::Absent; "unknown unit")]
    #[test]
    fn state_follows_is_enabled(output: CommandOutput, expect: ProbeResult) {
        let runner = FakeRunner::new(move |_| Ok(output.clone()));
        let step = ServiceStep::new(runner, "sshd.service");
        pretty_assertions::assert_eq!(step.probe(&RunContext::new("/mnt")).unwrap(), expect);
    }

    #[test]
    fn masked_unit_is_unmasked_then_enabled() -> anyhow::Result<()> {
        let state = Rc::new(RefCell::new("masked"));
        let unit = state.clone();
        let runner = FakeRunner::new(move |invocation| {
            let mut unit = unit.borrow_mut();
            let output = match invocation.arguments()[1].as_str() {
                "is-enabled" if *unit == "enabled" => CommandOutput::success("enabled\n"),
                "is-enabled" => CommandOutput {
                    success: false,
                    code: Some(1),
                    stdout: format!("{}\n", *unit),
                    stderr: String::new(),
                },
                "enable" if *unit == "masked" => CommandOutput::failure(
                    1,
                    "Failed to enable unit: Unit file /etc/systemd/system/sshd.service is masked.",
                ),
                "enable" => {
                    *unit = "enabled";
                    CommandOutput::success("")
                }
                "unmask" => {
                    *unit = "disabled";
                    CommandOutput::success("")
                }
                _ => CommandOutput::failure(1, "unexpected verb"),
            };
            Ok(output)
        });
        let step = ServiceStep::new(runner.clone(), "sshd.service");
        let ctx = RunContext::new("/mnt");

        let probe = step.probe(&ctx)?;
        assert_eq!(
            probe,
            ProbeResult::PresentIncorrect("sshd.service is masked".into())
        );
        assert_eq!(step.apply(&probe, &ctx)?, ActionTaken::Modified);
        assert_eq!(step.probe(&ctx)?, ProbeResult::PresentCorrect);
        assert_eq!(*state.borrow(), "enabled");
        assert_eq!(
            runner.calls()[1..3].to_vec(),
            vec![
                "systemctl --root=/mnt unmask sshd.service",
                "systemctl --root=/mnt enable sshd.service",
            ]
        );

        Ok(())
    }

    #[test]
    fn enable_targets_offline_root() -> anyhow::Result<()> {
        let runner = FakeRunner::new(|_| Ok(CommandOutput::success("")));
        let step = ServiceStep::new(runner.clone(), "zfs.target");

        step.apply(&ProbeResult::Absent, &RunContext::new("/mnt"))?;
        step.apply(&ProbeResult::Absent, &RunContext::new("/"))?;
        assert_eq!(
            runner.calls(),
            vec!["systemctl --root=/mnt enable zfs.target", "systemctl enable zfs.target"]
        );

        Ok(())
    }
}
