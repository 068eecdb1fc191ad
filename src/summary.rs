// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Run summaries.
//!
//! Rendering is pure: the same report, context, and template always produce
//! the same text. Nothing here writes to the terminal.

use crate::{
    context::RunContext,
    pipeline::{ActionTaken, RunReport, SurveyEntry},
};

use std::fmt::Write;

/// Render full summary of a finished run.
///
/// Lists every step in execution order, then any manual follow-up left by
/// deferred steps, then a note if the operator stopped the run, and finally
/// the phase's next-steps template with run parameters substituted.
pub fn render(report: &RunReport, ctx: &RunContext, template: &str) -> String {
    let mut out = render_steps(report);

    let deferred = report.deferred().collect::<Vec<_>>();
    if !deferred.is_empty() {
        out.push_str("\nManual follow-up:\n");
        for (step, reason) in deferred {
            let _ = writeln!(out, "  - {step}: {reason}");
        }
    }

    if let Some(step) = report.declined() {
        let _ = writeln!(
            out,
            "\nStopped before {step} at operator's request. Nothing after it was run."
        );
        return out;
    }

    let next = ctx.expand(template);
    if !next.trim().is_empty() {
        out.push_str("\nNext steps:\n");
        out.push_str(next.trim_end());
        out.push('\n');
    }

    out
}

/// Render per-step listing of report.
pub fn render_steps(report: &RunReport) -> String {
    let width = report
        .entries()
        .iter()
        .map(|entry| entry.step.len())
        .max()
        .unwrap_or_default();

    let mut out = String::from("Steps:\n");
    if report.entries().is_empty() {
        out.push_str("  (none)\n");
    }

    for entry in report.entries() {
        let marker = match entry.action {
            ActionTaken::Skipped => " ",
            ActionTaken::Created | ActionTaken::Modified => "+",
            ActionTaken::Deferred(_) => "!",
        };
        let _ = writeln!(out, "{marker} {:<width$}  {}", entry.step, entry.action);
    }

    out
}

/// Render read-only survey of a phase.
pub fn render_survey(entries: &[SurveyEntry]) -> String {
    let width = entries
        .iter()
        .map(|entry| entry.step.len())
        .max()
        .unwrap_or_default();

    let mut out = String::new();
    for entry in entries {
        let _ = match &entry.probe {
            Ok(probe) => writeln!(out, "{:<width$}  {probe}", entry.step),
            Err(error) => writeln!(out, "{:<width$}  unknown ({error})", entry.step),
        };
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ProbeResult, StepError};
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn ctx() -> RunContext {
        let mut ctx = RunContext::new("/mnt");
        ctx.pool = "zroot".into();
        ctx.disk = "/dev/nvme0n1".into();
        ctx
    }

    #[test]
    fn render_substitutes_parameters_into_next_steps() {
        let mut report = RunReport::default();
        report.record("partition-disk", ActionTaken::Created);
        report.record("create-pool", ActionTaken::Skipped);

        let summary = render(&report, &ctx(), "zpool export {pool}\nreboot\n");
        assert_eq!(
            summary,
            indoc! {"
                Steps:
                + partition-disk  created
                  create-pool     skipped

                Next steps:
                zpool export zroot
                reboot
            "}
        );
        assert!(!summary.contains("{pool}"));
    }

    #[test]
    fn render_lists_deferred_steps_as_follow_up() {
        let mut report = RunReport::default();
        report.record("service:sshd.service", ActionTaken::Modified);
        report.record(
            "authorized-keys",
            ActionTaken::Deferred("failed to fetch https://github.com/alice.keys".into()),
        );

        let summary = render(&report, &ctx(), "");
        assert_eq!(
            summary,
            indoc! {"
                Steps:
                + service:sshd.service  modified
                ! authorized-keys       deferred

                Manual follow-up:
                  - authorized-keys: failed to fetch https://github.com/alice.keys
            "}
        );
    }

    #[test]
    fn render_declined_run_omits_next_steps() {
        let mut report = RunReport::default();
        report.decline("partition-disk");

        let summary = render(&report, &ctx(), "zpool export {pool}");
        assert_eq!(
            summary,
            indoc! {"
                Steps:
                  (none)

                Stopped before partition-disk at operator's request. Nothing after it was run.
            "}
        );
    }

    #[test]
    fn render_survey_aligns_step_states() {
        let entries = vec![
            SurveyEntry {
                step: "hostid".into(),
                probe: Ok(ProbeResult::PresentCorrect),
            },
            SurveyEntry {
                step: "initramfs-hook:zfs".into(),
                probe: Ok(ProbeResult::PresentIncorrect(
                    "zfs is not immediately before filesystems".into(),
                )),
            },
            SurveyEntry {
                step: "packages".into(),
                probe: Err(StepError::Invalid {
                    detail: "no pool name was given".into(),
                }),
            },
        ];

        assert_eq!(
            render_survey(&entries),
            indoc! {"
                hostid              present
                initramfs-hook:zfs  incorrect (zfs is not immediately before filesystems)
                packages            unknown (no pool name was given)
            "}
        );
    }
}
