// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Concrete provisioning steps.
//!
//! Each step manages exactly one resource of the target system. Resources come
//! in two flavours:
//!
//! - __Text configuration__, e.g., a hook inside `mkinitcpio.conf`, or a boot
//!   loader entry. These are probed by parsing the file, and edited through
//!   the [`drafter`](crate::drafter).
//! - __System objects__, e.g., a pool, a dataset, an enabled service. These
//!   are probed by querying the tool that owns them, and mutated through that
//!   same tool.
//!
//! Probes never mutate anything, and treat an unconfigured world gracefully.
//! A missing file, a missing tool, or a failing query all mean the resource
//! is [`ProbeResult::Absent`](crate::pipeline::ProbeResult::Absent).

pub mod boot;
pub mod disk;
pub mod files;
pub mod initramfs;
pub mod keys;
pub mod packages;
pub mod services;
pub mod zfs;

pub use boot::{discover_kernels, entry_template, loader_template, microcode_images};
pub use disk::{partition_path, PartitionStep};
pub use files::ManagedFileStep;
pub use initramfs::{ArrayTokenStep, InitramfsStep};
pub use keys::AuthorizedKeysStep;
pub use packages::PackagesStep;
pub use services::ServiceStep;
pub use zfs::{DatasetStep, HostIdStep, MountStep, PoolPropertyStep, PoolStep, SwapVolumeStep};

use crate::{
    pipeline::{Result, StepError},
    system::{CommandRunner, Invocation, SystemError},
};

use tracing::debug;

/// Run read-only query, yielding its standard output.
///
/// A query that fails, or whose tool is not installed, yields `None`.
///
/// # Errors
///
/// - Return [`StepError::System`] if the tool exists but cannot be run.
pub(crate) fn query<R>(runner: &R, invocation: &Invocation) -> Result<Option<String>>
where
    R: CommandRunner + ?Sized,
{
    match runner.run(invocation) {
        Ok(output) if output.success => Ok(Some(output.stdout)),
        Ok(output) => {
            debug!("query `{invocation}` found nothing: {}", output.message());
            Ok(None)
        }
        Err(SystemError::Missing { program }) => {
            debug!("{program} is not installed, treating resource as absent");
            Ok(None)
        }
        Err(error) => Err(error.into()),
    }
}

/// Reject empty run parameter that step cannot work without.
pub(crate) fn require<'a>(value: &'a str, what: &str) -> Result<&'a str> {
    if value.trim().is_empty() {
        return Err(StepError::Invalid {
            detail: format!("no {what} was given"),
        });
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{fake::FakeRunner, CommandOutput};
    use pretty_assertions::assert_eq;

    #[test]
    fn query_treats_failure_and_missing_tool_as_nothing() -> anyhow::Result<()> {
        let runner = FakeRunner::new(|invocation| match invocation.program() {
            "zpool" => Ok(CommandOutput::success("zroot\n")),
            "zfs" => Ok(CommandOutput::failure(1, "dataset does not exist")),
            program => Err(SystemError::Missing {
                program: program.into(),
            }),
        });

        assert_eq!(query(&runner, &Invocation::new("zpool"))?, Some("zroot\n".into()));
        assert_eq!(query(&runner, &Invocation::new("zfs"))?, None);
        assert_eq!(query(&runner, &Invocation::new("lsblk"))?, None);

        Ok(())
    }

    #[test]
    fn query_propagates_spawn_errors() {
        let runner = FakeRunner::new(|_| {
            Err(SystemError::Spawn {
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                program: "zpool".into(),
            })
        });
        assert!(matches!(
            query(&runner, &Invocation::new("zpool")),
            Err(StepError::System(SystemError::Spawn { .. }))
        ));
    }

    #[test]
    fn require_rejects_blank_parameter() {
        assert!(matches!(require("  ", "target disk"), Err(StepError::Invalid { .. })));
        assert!(matches!(require("/dev/sda", "target disk"), Ok("/dev/sda")));
    }
}
