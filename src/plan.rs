// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Phase plans.
//!
//! Turn a [`Profile`] and a resolved [`RunContext`] into the fixed step
//! sequence of a phase. The order of steps is decided here, once, and then
//! validated by [`Pipeline::new`].
//!
//! # Install
//!
//! Runs from the live medium against a blank disk:
//!
//! 1. Partition disk.
//! 2. Create pool.
//! 3. Create datasets in profile order, mounting the root dataset as soon as
//!    it exists so that every later dataset mounts beneath it.
//! 4. Create swap volume, unless swap size is `0`.
//! 5. Point pool's `bootfs` at the root dataset, and set its `cachefile`.
//!
//! # Configure
//!
//! Runs against the freshly installed system:
//!
//! 1. Install packages.
//! 2. Write hostname, and generate hostid.
//! 3. Add kernel modules and the ZFS hook to `mkinitcpio.conf`.
//! 4. Regenerate initramfs images.
//! 5. Write boot entries per kernel, and the loader configuration.
//! 6. Enable services.
//! 7. Authorize public keys of the key account, if one was given.

use crate::{
    config::Profile,
    context::{Parameter, RunContext},
    pipeline::{Pipeline, PipelineError, Step},
    preflight::Requirement,
    steps::{
        boot::entry_file, discover_kernels, entry_template, loader_template, microcode_images,
        ArrayTokenStep, AuthorizedKeysStep, DatasetStep, HostIdStep, InitramfsStep,
        ManagedFileStep, MountStep, PackagesStep, PartitionStep, PoolPropertyStep, PoolStep,
        ServiceStep, SwapVolumeStep,
    },
    system::CommandRunner,
};

use std::fmt::{Display, Formatter, Result as FmtResult};
use tracing::{debug, warn};

/// Tools the install phase calls on the host.
const INSTALL_TOOLS: &[&str] = &[
    "lsblk", "wipefs", "parted", "udevadm", "mkfs.fat", "zpool", "zfs", "blkid", "mkswap",
];

/// Tools the configure phase calls on the host.
const CONFIGURE_TOOLS: &[&str] = &["pacman", "systemctl"];

/// A provisioning phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Phase {
    /// Prepare disk, pool, and datasets from the live medium.
    Install,

    /// Configure freshly installed system to boot from ZFS.
    Configure,
}

impl Display for Phase {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Install => fmt.write_str("install"),
            Self::Configure => fmt.write_str("configure"),
        }
    }
}

impl Phase {
    /// Run parameters the phase needs resolved before it starts.
    pub fn parameters(self) -> &'static [Parameter] {
        match self {
            Self::Install => &[
                Parameter::Root,
                Parameter::Disk,
                Parameter::Pool,
                Parameter::SwapSize,
            ],
            Self::Configure => &[
                Parameter::Root,
                Parameter::Pool,
                Parameter::Hostname,
                Parameter::Username,
                Parameter::KeysAccount,
            ],
        }
    }

    /// Target root used when none is given.
    pub fn default_root(self) -> &'static str {
        match self {
            Self::Install => "/mnt",
            Self::Configure => "/",
        }
    }

    /// Preconditions of the phase.
    pub fn requirements(self, profile: &Profile) -> Vec<Requirement> {
        let mut requirements = vec![Requirement::superuser()];
        let tools = match self {
            Self::Install => {
                requirements.push(Requirement::uefi());
                INSTALL_TOOLS
            }
            Self::Configure => CONFIGURE_TOOLS,
        };
        requirements.extend(tools.iter().map(|tool| Requirement::tool(*tool)));

        if let Some(model) = &profile.settings.hardware_model {
            requirements.push(Requirement::hardware_model(model));
        }

        requirements
    }

    /// Next-steps template shown once the phase is done.
    pub fn summary_template(self, profile: &Profile) -> &str {
        match self {
            Self::Install => &profile.summary.install,
            Self::Configure => &profile.summary.configure,
        }
    }

    /// Build step sequence of the phase.
    ///
    /// # Errors
    ///
    /// - Return [`PipelineError`] if profile yields a step sequence whose
    ///   dependencies are out of order.
    pub fn plan<R>(self, profile: &Profile, ctx: &RunContext, runner: &R) -> Result<Pipeline>
    where
        R: CommandRunner + Clone + 'static,
    {
        match self {
            Self::Install => install(profile, ctx, runner),
            Self::Configure => configure(profile, ctx, runner),
        }
    }
}

/// Build step sequence of install phase.
///
/// # Errors
///
/// - Return [`PipelineError`] if profile lists a dataset before its parent,
///   or does not list the root dataset at all.
pub fn install<R>(profile: &Profile, ctx: &RunContext, runner: &R) -> Result<Pipeline>
where
    R: CommandRunner + Clone + 'static,
{
    let settings = &profile.settings;
    let root_dataset = settings.root_dataset.as_str();
    let mut steps: Vec<Box<dyn Step>> = vec![
        Box::new(PartitionStep::new(runner.clone(), settings.esp_size_mib)),
        Box::new(PoolStep::new(runner.clone())),
    ];

    let mut mounted = false;
    for dataset in &profile.datasets {
        let mut after = Vec::new();
        if let Some((parent, _)) = dataset.name.rsplit_once('/') {
            if profile.datasets.iter().any(|other| other.name == parent) {
                after.push(format!("dataset:{parent}"));
            }
        }

        // INVARIANT: Datasets created after the root is mounted land beneath it.
        if mounted {
            after.push("mount-root".to_owned());
        }

        steps.push(Box::new(
            DatasetStep::new(runner.clone(), &dataset.name, dataset.properties.clone())
                .after(after),
        ));

        if dataset.name == root_dataset {
            steps.push(Box::new(MountStep::new(runner.clone(), root_dataset)));
            mounted = true;
        }
    }

    if !mounted {
        steps.push(Box::new(MountStep::new(runner.clone(), root_dataset)));
    }

    if is_swap_wanted(&ctx.swap_size) {
        steps.push(Box::new(SwapVolumeStep::new(runner.clone())));
    } else {
        debug!("swap size is {:?}, no swap volume", ctx.swap_size);
    }

    steps.push(Box::new(
        PoolPropertyStep::new(runner.clone(), "bootfs", format!("{{pool}}/{root_dataset}"))
            .after([format!("dataset:{root_dataset}")]),
    ));
    steps.push(Box::new(PoolPropertyStep::new(
        runner.clone(),
        "cachefile",
        "/etc/zfs/zpool.cache",
    )));

    Pipeline::new(steps)
}

// INVARIANT: Any size whose digits are all zero, e.g., `0` or `0G`, means none.
fn is_swap_wanted(size: &str) -> bool {
    size.chars().any(|digit| ('1'..='9').contains(&digit))
}

/// Build step sequence of configure phase.
///
/// Kernels are taken from the profile, or discovered under the target root's
/// `/boot` when the profile lists none.
///
/// # Errors
///
/// - Return [`PipelineError`] if step sequence is out of order.
pub fn configure<R>(profile: &Profile, ctx: &RunContext, runner: &R) -> Result<Pipeline>
where
    R: CommandRunner + Clone + 'static,
{
    let mut steps: Vec<Box<dyn Step>> = Vec::new();

    let has_packages = !profile.packages.install.is_empty();
    if has_packages {
        steps.push(Box::new(PackagesStep::new(
            runner.clone(),
            &profile.packages.install,
        )));
    }
    let after_packages = match has_packages {
        true => vec!["packages".to_owned()],
        false => Vec::new(),
    };

    steps.push(Box::new(ManagedFileStep::new(
        "hostname",
        "/etc/hostname",
        "{hostname}\n",
    )));
    steps.push(Box::new(
        HostIdStep::new(runner.clone()).after(after_packages.clone()),
    ));

    // INVARIANT: The initramfs is rebuilt only after every token is in place.
    let initramfs = &profile.initramfs;
    let mut tokens = Vec::new();
    for module in &initramfs.modules {
        let step = ArrayTokenStep::module(&initramfs.config, module);
        tokens.push(step.id().to_owned());
        steps.push(Box::new(step));
    }
    let hook = ArrayTokenStep::hook(&initramfs.config, &initramfs.hook, &initramfs.anchor);
    tokens.push(hook.id().to_owned());
    steps.push(Box::new(hook));
    steps.push(Box::new(
        InitramfsStep::new(runner.clone())
            .after(tokens)
            .after(after_packages.clone()),
    ));

    let boot = &profile.boot;
    let kernels = match boot.kernels.is_empty() {
        true => discover_kernels(&ctx.root),
        false => boot.kernels.clone(),
    };
    let microcode = microcode_images(&ctx.root);
    let options = boot_options(profile);
    for kernel in &kernels {
        steps.push(Box::new(
            ManagedFileStep::new(
                format!("boot-entry:{kernel}"),
                boot.entries_dir.join(entry_file(kernel)),
                entry_template(kernel, &microcode, &options),
            )
            .after(["initramfs-images"]),
        ));
    }

    match kernels.first() {
        Some(default) => steps.push(Box::new(
            ManagedFileStep::new(
                "loader-conf",
                &boot.loader_conf,
                loader_template(default, boot.timeout),
            )
            .after([format!("boot-entry:{default}")]),
        )),
        None => warn!(
            "no kernels found under {:?}, skipping boot entries",
            ctx.target_path("/boot").display()
        ),
    }

    for unit in &profile.services.enable {
        steps.push(Box::new(
            ServiceStep::new(runner.clone(), unit).after(after_packages.clone()),
        ));
    }

    if ctx.keys_account.is_some() {
        steps.push(Box::new(AuthorizedKeysStep::new(
            runner.clone(),
            &profile.keys.url,
        )));
    }

    Pipeline::new(steps)
}

/// Kernel command line of boot entries.
///
/// Substitutes `{root_dataset}` from the profile. Run parameter markers, e.g.,
/// `{pool}`, are left for the boot entry steps to fill in.
pub fn boot_options(profile: &Profile) -> String {
    profile
        .boot
        .options
        .replace("{root_dataset}", &profile.settings.root_dataset)
}

/// Friendly result alias :3
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DatasetSpec,
        system::{fake::FakeRunner, CommandOutput},
    };
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;
    use std::fs::write;

    fn runner() -> FakeRunner {
        FakeRunner::new(|_| Ok(CommandOutput::success("")))
    }

    fn install_ctx(swap_size: &str) -> RunContext {
        let mut ctx = RunContext::new("/mnt");
        ctx.disk = "/dev/nvme0n1".into();
        ctx.pool = "zroot".into();
        ctx.swap_size = swap_size.into();
        ctx
    }

    #[test]
    fn install_plan_mounts_root_before_child_datasets() -> anyhow::Result<()> {
        let profile = Profile::builtin()?;
        let pipeline = install(&profile, &install_ctx("16G"), &runner())?;

        assert_eq!(
            pipeline.step_ids(),
            vec![
                "partition-disk",
                "create-pool",
                "dataset:ROOT",
                "dataset:ROOT/default",
                "mount-root",
                "dataset:home",
                "dataset:var",
                "dataset:var/log",
                "dataset:var/cache",
                "swap-volume",
                "pool-bootfs",
                "pool-cachefile",
            ]
        );

        Ok(())
    }

    #[test_case("0", false; "zero")]
    #[test_case("0G", false; "zero with unit")]
    #[test_case("", false; "empty")]
    #[test_case("16G", true; "sixteen gigabytes")]
    #[test_case("512M", true; "half a gigabyte")]
    #[test_case("0.5G", true; "fractional size")]
    #[test]
    fn swap_volume_is_optional(size: &str, expect: bool) {
        pretty_assertions::assert_eq!(is_swap_wanted(size), expect);
    }

    #[test]
    fn install_plan_rejects_child_before_parent() -> anyhow::Result<()> {
        let mut profile = Profile::builtin()?;
        profile.datasets.swap(3, 4);
        assert_eq!(profile.datasets[3].name, "var/log");

        let result = install(&profile, &install_ctx("0"), &runner());
        assert!(matches!(result, Err(PipelineError::DependencyOrder { .. })));

        Ok(())
    }

    #[test]
    fn install_plan_requires_root_dataset() -> anyhow::Result<()> {
        let mut profile = Profile::builtin()?;
        profile.datasets = vec![DatasetSpec {
            name: "home".into(),
            ..DatasetSpec::default()
        }];

        let result = install(&profile, &install_ctx("0"), &runner());
        assert!(matches!(result, Err(PipelineError::DependencyOrder { .. })));

        Ok(())
    }

    #[test]
    fn configure_plan_discovers_kernels() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        mkdirp::mkdirp(root.path().join("boot"))?;
        write(root.path().join("boot/vmlinuz-linux"), "")?;
        write(root.path().join("boot/vmlinuz-linux-lts"), "")?;

        let mut profile = Profile::builtin()?;
        profile.initramfs.modules = vec!["nvidia".into()];
        profile.services.enable = vec!["zfs.target".into()];
        let mut ctx = RunContext::new(root.path());
        ctx.keys_account = Some("alice".into());

        let pipeline = configure(&profile, &ctx, &runner())?;
        assert_eq!(
            pipeline.step_ids(),
            vec![
                "packages",
                "hostname",
                "hostid",
                "initramfs-module:nvidia",
                "initramfs-hook:zfs",
                "initramfs-images",
                "boot-entry:linux",
                "boot-entry:linux-lts",
                "loader-conf",
                "service:zfs.target",
                "authorized-keys",
            ]
        );

        Ok(())
    }

    #[test]
    fn configure_plan_without_kernels_or_keys() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let mut profile = Profile::builtin()?;
        profile.packages.install.clear();
        profile.services.enable.clear();

        let pipeline = configure(&profile, &RunContext::new(root.path()), &runner())?;
        assert_eq!(
            pipeline.step_ids(),
            vec!["hostname", "hostid", "initramfs-hook:zfs", "initramfs-images"]
        );

        Ok(())
    }

    #[test]
    fn boot_options_follow_root_dataset() -> anyhow::Result<()> {
        let mut profile = Profile::builtin()?;
        assert_eq!(boot_options(&profile), "zfs={pool}/ROOT/default rw");

        profile.settings.root_dataset = "ROOT/arch".into();
        assert_eq!(boot_options(&profile), "zfs={pool}/ROOT/arch rw");

        Ok(())
    }

    #[test]
    fn requirements_follow_phase_and_profile() -> anyhow::Result<()> {
        let mut profile = Profile::builtin()?;
        assert!(Phase::Install.requirements(&profile).contains(&Requirement::uefi()));
        assert!(!Phase::Configure.requirements(&profile).contains(&Requirement::uefi()));

        profile.settings.hardware_model = Some("ROG Zephyrus G14".into());
        assert!(Phase::Configure
            .requirements(&profile)
            .contains(&Requirement::hardware_model("ROG Zephyrus G14")));

        Ok(())
    }
}
