// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Disk partitioning.
//!
//! The target disk receives a GPT label with exactly two partitions:
//!
//! 1. `esp`: FAT32 EFI system partition.
//! 2. `zfs`: remainder of the disk, handed to the pool.

use crate::{
    context::RunContext,
    pipeline::{ActionTaken, ProbeResult, Result, Step, StepMeta},
    steps::{query, require},
    system::{CommandRunner, Invocation, SystemRunner},
};

use tracing::{info, instrument};

/// Partition label of the EFI system partition.
pub const ESP_LABEL: &str = "esp";

/// Partition label of the pool's partition.
pub const ZFS_LABEL: &str = "zfs";

/// Path of partition `number` of `disk`.
///
/// Devices whose name ends in a digit, e.g., `nvme0n1` or `mmcblk0`, separate
/// the partition number with a `p`.
pub fn partition_path(disk: &str, number: u32) -> String {
    match disk.chars().last() {
        Some(last) if last.is_ascii_digit() => format!("{disk}p{number}"),
        _ => format!("{disk}{number}"),
    }
}

/// Partition of the target disk as reported by `lsblk`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Partition {
    label: String,
    fstype: String,
}

impl Partition {
    // INVARIANT: Raw lsblk output keeps empty columns, separated by single spaces.
    fn parse(line: &str) -> Option<Self> {
        let mut columns = line.split(' ');
        if columns.next()? != "part" {
            return None;
        }

        Some(Self {
            label: columns.next().unwrap_or_default().to_owned(),
            fstype: columns.next().unwrap_or_default().to_owned(),
        })
    }

    fn name(&self) -> &str {
        match self.label.is_empty() {
            true => "unlabeled",
            false => &self.label,
        }
    }
}

fn is_zfs_layout(partitions: &[Partition]) -> bool {
    matches!(partitions, [esp, zfs] if esp.label == ESP_LABEL && zfs.label == ZFS_LABEL)
}

/// Lay out target disk for a ZFS root.
#[derive(Debug, Clone)]
pub struct PartitionStep<R = SystemRunner> {
    meta: StepMeta,
    runner: R,
    esp_size_mib: u32,
}

impl<R: CommandRunner> PartitionStep<R> {
    pub fn new(runner: R, esp_size_mib: u32) -> Self {
        Self {
            meta: StepMeta::new("partition-disk"),
            runner,
            esp_size_mib,
        }
    }

    fn partitions(&self, disk: &str) -> Result<Vec<Partition>> {
        let invocation =
            Invocation::new("lsblk").args(["-n", "-r", "-o", "TYPE,PARTLABEL,FSTYPE", disk]);
        let partitions = query(&self.runner, &invocation)?
            .unwrap_or_default()
            .lines()
            .filter_map(Partition::parse)
            .collect();

        Ok(partitions)
    }
}

impl<R: CommandRunner> Step for PartitionStep<R> {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    fn is_destructive(&self) -> bool {
        true
    }

    fn describe(&self, ctx: &RunContext) -> String {
        format!("Wiping and partitioning {}", ctx.disk)
    }

    fn probe(&self, ctx: &RunContext) -> Result<ProbeResult> {
        let disk = require(&ctx.disk, "target disk")?;
        let partitions = self.partitions(disk)?;

        if partitions.is_empty() {
            return Ok(ProbeResult::Absent);
        }

        if !is_zfs_layout(&partitions) {
            let names = partitions.iter().map(Partition::name).collect::<Vec<_>>();
            return Ok(ProbeResult::PresentIncorrect(format!(
                "{disk} carries partitions {}",
                names.join(", ")
            )));
        }

        if partitions[0].fstype != "vfat" {
            return Ok(ProbeResult::PresentIncorrect(format!(
                "{ESP_LABEL} is not formatted"
            )));
        }

        Ok(ProbeResult::PresentCorrect)
    }

    #[instrument(skip(self, probe, ctx), level = "debug")]
    fn apply(&self, probe: &ProbeResult, ctx: &RunContext) -> Result<ActionTaken> {
        let disk = require(&ctx.disk, "target disk")?;
        let esp_end = format!("{}MiB", self.esp_size_mib + 1);

        // INVARIANT: A disk already laid out by a prior run only lacks its filesystem.
        if !is_zfs_layout(&self.partitions(disk)?) {
            info!("wipe {disk}");
            self.runner
                .run_checked(&Invocation::new("wipefs").args(["-a", disk]))?;

            info!("partition {disk}");
            self.runner.run_checked(&Invocation::new("parted").args([
                "-s", disk, "mklabel", "gpt", "mkpart", ESP_LABEL, "fat32", "1MiB", &esp_end,
                "set", "1", "esp", "on", "mkpart", ZFS_LABEL, &esp_end, "100%",
            ]))?;
        }

        // INVARIANT: Partition device nodes must exist before formatting.
        self.runner
            .run_checked(&Invocation::new("udevadm").arg("settle"))?;

        self.runner.run_checked(&Invocation::new("mkfs.fat").args([
            "-F",
            "32",
            "-n",
            "ESP",
            &partition_path(disk, 1),
        ]))?;

        Ok(ActionTaken::for_probe(probe))
    }
}
