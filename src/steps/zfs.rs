// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Pool and dataset management.
//!
//! Everything here is queried and mutated through `zpool` and `zfs`. When the
//! target root is not the host root, the pool is created or imported with that
//! root as its `altroot`, which makes ZFS report every mountpoint prefixed
//! with it.

use crate::{
    context::RunContext,
    pipeline::{ActionTaken, ProbeResult, Result, Step, StepError, StepMeta},
    steps::{disk::partition_path, query, require},
    system::{CommandRunner, Invocation, SystemRunner},
};

use std::{collections::BTreeMap, fs::metadata, io, path::Path};
use tracing::{info, instrument};

/// Properties every new pool is created with.
pub const POOL_OPTIONS: &[(&str, &str)] = &[("ashift", "12"), ("autotrim", "on")];

/// Properties of the pool's root dataset, inherited by every other dataset.
pub const POOL_FILESYSTEM_OPTIONS: &[(&str, &str)] = &[
    ("acltype", "posixacl"),
    ("canmount", "off"),
    ("compression", "lz4"),
    ("devices", "off"),
    ("dnodesize", "auto"),
    ("mountpoint", "none"),
    ("normalization", "formD"),
    ("relatime", "on"),
    ("xattr", "sa"),
];

/// Name of swap volume inside pool.
pub const SWAP_VOLUME: &str = "swap";

/// Block size of swap volume, matching the kernel's page size.
pub const SWAP_BLOCK_SIZE: u64 = 4096;

fn altroot(invocation: Invocation, ctx: &RunContext) -> Invocation {
    match ctx.is_host_root() {
        true => invocation,
        false => invocation.arg("-R").arg(ctx.root.to_string_lossy()),
    }
}

/// Create the pool, or import it if it already exists but is exported.
#[derive(Debug, Clone)]
pub struct PoolStep<R = SystemRunner> {
    meta: StepMeta,
    runner: R,
}

impl<R: CommandRunner> PoolStep<R> {
    pub fn new(runner: R) -> Self {
        Self {
            meta: StepMeta::new("create-pool").after(["partition-disk"]),
            runner,
        }
    }

    fn is_importable(&self, pool: &str) -> Result<bool> {
        let listing = query(&self.runner, &Invocation::new("zpool").arg("import"))?;
        Ok(listing.is_some_and(|listing| {
            listing
                .lines()
                .filter_map(|line| line.trim().strip_prefix("pool:"))
                .any(|name| name.trim() == pool)
        }))
    }
}

impl<R: CommandRunner> Step for PoolStep<R> {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    fn is_destructive(&self) -> bool {
        true
    }

    fn describe(&self, ctx: &RunContext) -> String {
        format!(
            "Creating pool {} on {}",
            ctx.pool,
            partition_path(&ctx.disk, 2)
        )
    }

    fn probe(&self, ctx: &RunContext) -> Result<ProbeResult> {
        let pool = require(&ctx.pool, "pool name")?;
        let listed = query(
            &self.runner,
            &Invocation::new("zpool").args(["list", "-H", "-o", "name", pool]),
        )?;
        if listed.is_some() {
            return Ok(ProbeResult::PresentCorrect);
        }

        if self.is_importable(pool)? {
            return Ok(ProbeResult::PresentIncorrect(format!("{pool} is exported")));
        }

        Ok(ProbeResult::Absent)
    }

    #[instrument(skip(self, probe, ctx), level = "debug")]
    fn apply(&self, probe: &ProbeResult, ctx: &RunContext) -> Result<ActionTaken> {
        let pool = require(&ctx.pool, "pool name")?;
        if let ProbeResult::PresentIncorrect(_) = probe {
            info!("import {pool}");
            let import = altroot(Invocation::new("zpool").args(["import", "-N"]), ctx).arg(pool);
            self.runner.run_checked(&import)?;
            return Ok(ActionTaken::Modified);
        }

        let disk = require(&ctx.disk, "target disk")?;
        let mut create = Invocation::new("zpool").args(["create", "-f"]);
        for (key, value) in POOL_OPTIONS {
            create = create.arg("-o").arg(format!("{key}={value}"));
        }
        for (key, value) in POOL_FILESYSTEM_OPTIONS {
            create = create.arg("-O").arg(format!("{key}={value}"));
        }
        let create = altroot(create, ctx)
            .arg(pool)
            .arg(partition_path(disk, 2));

        info!("create {pool}");
        self.runner.run_checked(&create)?;

        Ok(ActionTaken::Created)
    }
}

/// Dataset carrying a fixed set of properties.
#[derive(Debug, Clone)]
pub struct DatasetStep<R = SystemRunner> {
    meta: StepMeta,
    runner: R,
    name: String,
    properties: BTreeMap<String, String>,
}

impl<R: CommandRunner> DatasetStep<R> {
    /// Construct new dataset step for `name`, relative to the pool.
    pub fn new(runner: R, name: impl Into<String>, properties: BTreeMap<String, String>) -> Self {
        let name = name.into();
        Self {
            meta: StepMeta::new(format!("dataset:{name}")).after(["create-pool"]),
            runner,
            name,
            properties,
        }
    }

    /// Require further steps to have succeeded first.
    pub fn after(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.meta = self.meta.after(ids);
        self
    }

    fn full_name(&self, ctx: &RunContext) -> Result<String> {
        Ok(format!("{}/{}", require(&ctx.pool, "pool name")?, self.name))
    }

    fn mismatches(&self, ctx: &RunContext, dataset: &str) -> Result<Vec<String>> {
        if self.properties.is_empty() {
            return Ok(Vec::new());
        }

        let keys = self.properties.keys().cloned().collect::<Vec<_>>().join(",");
        let output = query(
            &self.runner,
            &Invocation::new("zfs").args(["get", "-H", "-o", "property,value", &keys, dataset]),
        )?
        .unwrap_or_default();
        let actual = output
            .lines()
            .filter_map(|line| line.split_once('\t'))
            .collect::<BTreeMap<_, _>>();

        Ok(self
            .properties
            .iter()
            .filter(|(key, want)| match actual.get(key.as_str()) {
                Some(value) => !property_matches(ctx, key, value, want),
                None => true,
            })
            .map(|(key, _)| key.clone())
            .collect())
    }
}

// INVARIANT: ZFS reports mountpoints prefixed with the pool's altroot.
fn property_matches(ctx: &RunContext, key: &str, actual: &str, want: &str) -> bool {
    if actual == want {
        return true;
    }

    key == "mountpoint"
        && want.starts_with('/')
        && !ctx.is_host_root()
        && Path::new(actual) == ctx.target_path(want).as_path()
}

impl<R: CommandRunner> Step for DatasetStep<R> {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    fn probe(&self, ctx: &RunContext) -> Result<ProbeResult> {
        let dataset = self.full_name(ctx)?;
        let exists = query(
            &self.runner,
            &Invocation::new("zfs").args(["list", "-H", "-o", "name", &dataset]),
        )?;
        if exists.is_none() {
            return Ok(ProbeResult::Absent);
        }

        let mismatches = self.mismatches(ctx, &dataset)?;
        if mismatches.is_empty() {
            return Ok(ProbeResult::PresentCorrect);
        }

        Ok(ProbeResult::PresentIncorrect(format!(
            "{dataset} differs in {}",
            mismatches.join(", ")
        )))
    }

    fn apply(&self, probe: &ProbeResult, ctx: &RunContext) -> Result<ActionTaken> {
        let dataset = self.full_name(ctx)?;
        if *probe == ProbeResult::Absent {
            let mut create = Invocation::new("zfs").arg("create");
            for (key, value) in &self.properties {
                create = create.arg("-o").arg(format!("{key}={value}"));
            }

            info!("create {dataset}");
            self.runner.run_checked(&create.arg(&dataset))?;
            return Ok(ActionTaken::Created);
        }

        for key in self.mismatches(ctx, &dataset)? {
            let value = &self.properties[&key];
            info!("set {key}={value} on {dataset}");
            self.runner.run_checked(
                &Invocation::new("zfs")
                    .arg("set")
                    .arg(format!("{key}={value}"))
                    .arg(&dataset),
            )?;
        }

        Ok(ActionTaken::Modified)
    }
}

/// Swap volume inside the pool.
#[derive(Debug, Clone)]
pub struct SwapVolumeStep<R = SystemRunner> {
    meta: StepMeta,
    runner: R,
}

impl<R: CommandRunner> SwapVolumeStep<R> {
    pub fn new(runner: R) -> Self {
        Self {
            meta: StepMeta::new("swap-volume").after(["create-pool"]),
            runner,
        }
    }

    fn volume(ctx: &RunContext) -> Result<String> {
        Ok(format!("{}/{SWAP_VOLUME}", require(&ctx.pool, "pool name")?))
    }

    // INVARIANT: ZFS rounds volume sizes up to a whole number of blocks.
    fn wanted_size(ctx: &RunContext) -> Result<u64> {
        let want = require(&ctx.swap_size, "swap size")?;
        let bytes = parse_size(want).ok_or_else(|| StepError::Invalid {
            detail: format!("swap size {want:?} is not a size"),
        })?;

        Ok(bytes.div_ceil(SWAP_BLOCK_SIZE) * SWAP_BLOCK_SIZE)
    }

    fn volsize(&self, volume: &str) -> Result<Option<u64>> {
        let Some(size) = query(
            &self.runner,
            &Invocation::new("zfs").args(["get", "-H", "-p", "-o", "value", "volsize", volume]),
        )?
        else {
            return Ok(None);
        };

        size.trim()
            .parse()
            .map(Some)
            .map_err(|_| StepError::Invalid {
                detail: format!("{volume} reports volsize {:?}", size.trim()),
            })
    }

    fn is_swap(&self, volume: &str) -> Result<bool> {
        let kind = query(
            &self.runner,
            &Invocation::new("blkid")
                .args(["-o", "value", "-s", "TYPE"])
                .arg(format!("/dev/zvol/{volume}")),
        )?;
        Ok(kind.is_some_and(|kind| kind.trim() == "swap"))
    }

    fn mkswap(&self, volume: &str) -> Result<()> {
        self.runner
            .run_checked(&Invocation::new("udevadm").arg("settle"))?;
        self.runner.run_checked(
            &Invocation::new("mkswap")
                .arg("-f")
                .arg(format!("/dev/zvol/{volume}")),
        )?;
        Ok(())
    }
}

/// Parse human-readable size into bytes, e.g., `16G`, `1.5GiB`, or `512m`.
///
/// Units are binary like they are for `zfs`, so `1K` is 1024 bytes. A bare
/// number is taken as bytes.
pub fn parse_size(size: &str) -> Option<u64> {
    let size = size.trim().to_ascii_uppercase();
    let size = size
        .strip_suffix("IB")
        .or_else(|| size.strip_suffix('B'))
        .unwrap_or(&size);

    let (number, exponent) = match size.char_indices().last()? {
        (at, unit) if unit.is_ascii_alphabetic() => (&size[..at], "KMGTPE".find(unit)? + 1),
        _ => (size, 0),
    };

    let number = number
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|number| number.is_finite() && *number >= 0.0)?;

    Some((number * 1024_f64.powi(exponent as i32)).round() as u64)
}

impl<R: CommandRunner> Step for SwapVolumeStep<R> {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    fn probe(&self, ctx: &RunContext) -> Result<ProbeResult> {
        let volume = Self::volume(ctx)?;
        let want = Self::wanted_size(ctx)?;
        let Some(size) = self.volsize(&volume)? else {
            return Ok(ProbeResult::Absent);
        };

        if size != want {
            return Ok(ProbeResult::PresentIncorrect(format!(
                "{volume} is {size} bytes, expected {want}"
            )));
        }

        if !self.is_swap(&volume)? {
            return Ok(ProbeResult::PresentIncorrect(format!(
                "{volume} is not formatted as swap"
            )));
        }

        Ok(ProbeResult::PresentCorrect)
    }

    #[instrument(skip(self, probe, ctx), level = "debug")]
    fn apply(&self, probe: &ProbeResult, ctx: &RunContext) -> Result<ActionTaken> {
        let volume = Self::volume(ctx)?;
        let want = Self::wanted_size(ctx)?;

        match self.volsize(&volume)? {
            None => {
                info!("create {volume} of {} ({want} bytes)", ctx.swap_size);
                self.runner.run_checked(
                    &Invocation::new("zfs")
                        .args(["create", "-V"])
                        .arg(want.to_string())
                        .arg("-b")
                        .arg(SWAP_BLOCK_SIZE.to_string())
                        .args([
                            "-o",
                            "compression=zle",
                            "-o",
                            "logbias=throughput",
                            "-o",
                            "sync=always",
                            "-o",
                            "primarycache=metadata",
                            "-o",
                            "secondarycache=none",
                            "-o",
                            "com.sun:auto-snapshot=false",
                        ])
                        .arg(&volume),
                )?;
                self.mkswap(&volume)?;
            }
            Some(size) if size != want => {
                info!("resize {volume} from {size} to {want} bytes");
                self.runner.run_checked(
                    &Invocation::new("zfs")
                        .arg("set")
                        .arg(format!("volsize={want}"))
                        .arg(&volume),
                )?;
                self.mkswap(&volume)?;
            }
            Some(_) => {
                if !self.is_swap(&volume)? {
                    self.mkswap(&volume)?;
                }
            }
        }

        Ok(ActionTaken::for_probe(probe))
    }
}

/// Pool property, e.g., `bootfs` or `cachefile`.
#[derive(Debug, Clone)]
pub struct PoolPropertyStep<R = SystemRunner> {
    meta: StepMeta,
    runner: R,
    property: String,
    value: String,
}

impl<R: CommandRunner> PoolPropertyStep<R> {
    /// Construct new property step. Value may carry run parameter markers.
    pub fn new(runner: R, property: impl Into<String>, value: impl Into<String>) -> Self {
        let property = property.into();
        Self {
            meta: StepMeta::new(format!("pool-{property}")).after(["create-pool"]),
            runner,
            property,
            value: value.into(),
        }
    }

    /// Require further steps to have succeeded first.
    pub fn after(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.meta = self.meta.after(ids);
        self
    }
}

impl<R: CommandRunner> Step for PoolPropertyStep<R> {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    fn probe(&self, ctx: &RunContext) -> Result<ProbeResult> {
        let pool = require(&ctx.pool, "pool name")?;
        let want = ctx.expand(&self.value);
        let value = query(
            &self.runner,
            &Invocation::new("zpool").args(["get", "-H", "-o", "value", &self.property, pool]),
        )?;

        Ok(match value.as_deref().map(str::trim) {
            None | Some("-") | Some("") => ProbeResult::Absent,
            Some(value) if value == want => ProbeResult::PresentCorrect,
            Some(value) => {
                ProbeResult::PresentIncorrect(format!("{} is {value}", self.property))
            }
        })
    }

    fn apply(&self, probe: &ProbeResult, ctx: &RunContext) -> Result<ActionTaken> {
        let pool = require(&ctx.pool, "pool name")?;
        let want = ctx.expand(&self.value);

        info!("set {}={want} on {pool}", self.property);
        self.runner.run_checked(
            &Invocation::new("zpool")
                .arg("set")
                .arg(format!("{}={want}", self.property))
                .arg(pool),
        )?;

        Ok(ActionTaken::for_probe(probe))
    }
}

/// Mounted dataset.
#[derive(Debug, Clone)]
pub struct MountStep<R = SystemRunner> {
    meta: StepMeta,
    runner: R,
    dataset: String,
}

impl<R: CommandRunner> MountStep<R> {
    pub fn new(runner: R, dataset: impl Into<String>) -> Self {
        let dataset = dataset.into();
        Self {
            meta: StepMeta::new("mount-root").after([format!("dataset:{dataset}")]),
            runner,
            dataset,
        }
    }
}

impl<R: CommandRunner> Step for MountStep<R> {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    fn probe(&self, ctx: &RunContext) -> Result<ProbeResult> {
        let dataset = format!("{}/{}", require(&ctx.pool, "pool name")?, self.dataset);
        let mounted = query(
            &self.runner,
            &Invocation::new("zfs").args(["get", "-H", "-o", "value", "mounted", &dataset]),
        )?;

        Ok(match mounted.as_deref().map(str::trim) {
            Some("yes") => ProbeResult::PresentCorrect,
            _ => ProbeResult::Absent,
        })
    }

    fn apply(&self, probe: &ProbeResult, ctx: &RunContext) -> Result<ActionTaken> {
        let dataset = format!("{}/{}", require(&ctx.pool, "pool name")?, self.dataset);
        info!("mount {dataset}");
        self.runner
            .run_checked(&Invocation::new("zfs").args(["mount", &dataset]))?;

        Ok(ActionTaken::for_probe(probe))
    }
}

/// Size of a valid `/etc/hostid` in bytes.
const HOSTID_SIZE: u64 = 4;

/// Host identifier the pool is bound to.
#[derive(Debug, Clone)]
pub struct HostIdStep<R = SystemRunner> {
    meta: StepMeta,
    runner: R,
}

impl<R: CommandRunner> HostIdStep<R> {
    pub fn new(runner: R) -> Self {
        Self {
            meta: StepMeta::new("hostid"),
            runner,
        }
    }

    /// Require further steps to have succeeded first.
    pub fn after(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.meta = self.meta.after(ids);
        self
    }
}

impl<R: CommandRunner> Step for HostIdStep<R> {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    fn probe(&self, ctx: &RunContext) -> Result<ProbeResult> {
        let path = ctx.target_path("/etc/hostid");
        match metadata(&path) {
            Ok(meta) if meta.len() == HOSTID_SIZE => Ok(ProbeResult::PresentCorrect),
            Ok(meta) => Ok(ProbeResult::PresentIncorrect(format!(
                "/etc/hostid is {} bytes, expected {HOSTID_SIZE}",
                meta.len()
            ))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(ProbeResult::Absent),
            Err(err) => Err(StepError::Io { source: err, path }),
        }
    }

    fn apply(&self, probe: &ProbeResult, ctx: &RunContext) -> Result<ActionTaken> {
        info!("generate /etc/hostid");
        self.runner
            .run_checked(&Invocation::new("zgenhostid").arg("-f").in_target(&ctx.root))?;

        Ok(ActionTaken::for_probe(probe))
    }
}
