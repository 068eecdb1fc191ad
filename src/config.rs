// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Provisioning profile layout.
//!
//! A __profile__ holds the declarative half of provisioning: dataset layout,
//! package and service lists, boot entry options, and default run parameters.
//! The imperative half, i.e., the steps themselves, is built from a profile
//! by [`plan`](crate::plan).
//!
//! Zprov ships with a built-in profile. Users can write it out with
//! `zprov init-profile` and adjust it to taste.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::read_to_string,
    path::{Path, PathBuf},
    str::FromStr,
};

const BUILTIN_PROFILE: &str = include_str!("../profiles/default.toml");

/// Provisioning profile.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Profile {
    /// Default run parameters.
    pub settings: Settings,

    /// Initramfs generation settings.
    #[serde(default)]
    pub initramfs: InitramfsSettings,

    /// Boot loader settings.
    #[serde(default)]
    pub boot: BootSettings,

    /// Packages to install into the target system.
    #[serde(default)]
    pub packages: PackageSettings,

    /// Services to enable in the target system.
    #[serde(default)]
    pub services: ServiceSettings,

    /// Remote public key settings.
    #[serde(default)]
    pub keys: KeySettings,

    /// Follow-up instructions shown after each phase.
    #[serde(default)]
    pub summary: SummarySettings,

    /// Datasets to create in the pool, parents first.
    #[serde(rename = "dataset", default)]
    pub datasets: Vec<DatasetSpec>,
}

impl Profile {
    /// Profile shipped with zprov.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Deserialize`] if built-in profile is invalid.
    pub fn builtin() -> Result<Self> {
        BUILTIN_PROFILE.parse()
    }

    /// Load profile from file.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if file cannot be read.
    /// - Return [`ConfigError::Deserialize`] if file is not a valid profile.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        read_to_string(path)
            .map_err(|err| ConfigError::Read {
                source: err,
                path: path.to_path_buf(),
            })?
            .parse()
    }
}

impl FromStr for Profile {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut profile: Profile = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on every path field.
        profile.initramfs.config = expand_path(&profile.initramfs.config)?;
        profile.boot.entries_dir = expand_path(&profile.boot.entries_dir)?;
        profile.boot.loader_conf = expand_path(&profile.boot.loader_conf)?;

        Ok(profile)
    }
}

impl Display for Profile {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path.to_string_lossy().as_ref())
            .map_err(ConfigError::ShellExpansion)?
            .into_owned(),
    ))
}

/// Default run parameters.
///
/// Empty strings mean "no default", and are asked for interactively.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Name of the ZFS pool.
    pub pool: String,

    /// Block device to install onto.
    #[serde(default)]
    pub disk: String,

    /// Dataset mounted as `/`, relative to the pool.
    #[serde(default = "default_root_dataset")]
    pub root_dataset: String,

    /// Size of the swap volume, `0` for none.
    #[serde(default)]
    pub swap_size: String,

    /// Hostname of the installed system.
    #[serde(default)]
    pub hostname: String,

    /// Primary user of the installed system.
    #[serde(default)]
    pub username: String,

    /// Account to fetch public SSH keys from.
    #[serde(default)]
    pub keys_account: String,

    /// Hardware model this profile was written for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_model: Option<String>,

    /// Size of the EFI system partition in MiB.
    #[serde(default = "default_esp_size")]
    pub esp_size_mib: u32,
}

fn default_root_dataset() -> String {
    "ROOT/default".into()
}

fn default_esp_size() -> u32 {
    1024
}

/// Dataset layout entry.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct DatasetSpec {
    /// Name of dataset relative to the pool.
    pub name: String,

    /// Properties the dataset must carry.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Initramfs generation settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InitramfsSettings {
    /// Path of mkinitcpio configuration in the target system.
    pub config: PathBuf,

    /// Kernel modules to add to `MODULES`.
    pub modules: Vec<String>,

    /// Hook to add to `HOOKS`.
    pub hook: String,

    /// Hook that `hook` must come immediately before.
    pub anchor: String,
}

impl Default for InitramfsSettings {
    fn default() -> Self {
        Self {
            config: "/etc/mkinitcpio.conf".into(),
            modules: Vec::new(),
            hook: "zfs".into(),
            anchor: "filesystems".into(),
        }
    }
}

/// Boot loader settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BootSettings {
    /// Directory of boot loader entries in the target system.
    pub entries_dir: PathBuf,

    /// Path of boot loader configuration in the target system.
    pub loader_conf: PathBuf,

    /// Kernels to write entries for. Discovered from `/boot` when empty.
    pub kernels: Vec<String>,

    /// Kernel command line template.
    pub options: String,

    /// Boot menu timeout in seconds.
    pub timeout: u32,
}

impl Default for BootSettings {
    fn default() -> Self {
        Self {
            entries_dir: "/boot/loader/entries".into(),
            loader_conf: "/boot/loader/loader.conf".into(),
            kernels: Vec::new(),
            options: "zfs={pool}/{root_dataset} rw".into(),
            timeout: 3,
        }
    }
}

/// Package settings.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PackageSettings {
    pub install: Vec<String>,
}

/// Service settings.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub enable: Vec<String>,
}

/// Remote public key settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeySettings {
    /// HTTPS location of an account's public keys.
    pub url: String,
}

impl Default for KeySettings {
    fn default() -> Self {
        Self {
            url: "https://github.com/{keys_account}.keys".into(),
        }
    }
}

/// Follow-up instructions per phase.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SummarySettings {
    pub install: String,
    pub configure: String,
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read profile.
    #[error("failed to read profile at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to deserialize profile.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize profile.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on profile.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[test]
    fn builtin_profile_parses() -> anyhow::Result<()> {
        let profile = Profile::builtin()?;

        assert_eq!(profile.settings.pool, "zroot");
        assert_eq!(profile.settings.root_dataset, "ROOT/default");
        assert_eq!(profile.initramfs.hook, "zfs");
        assert_eq!(profile.initramfs.anchor, "filesystems");
        assert_eq!(
            profile.datasets.first(),
            Some(&DatasetSpec {
                name: "ROOT".into(),
                properties: BTreeMap::from([
                    ("canmount".to_string(), "off".to_string()),
                    ("mountpoint".to_string(), "none".to_string()),
                ]),
            })
        );
        assert!(profile.services.enable.contains(&"zfs.target".to_string()));

        Ok(())
    }

    #[sealed_test(env = [("TARGET", "/mnt")])]
    fn deserialize_profile() -> anyhow::Result<()> {
        let result: Profile = r#"
            [settings]
            pool = "tank"
            disk = "/dev/nvme0n1"
            hardware_model = "ROG Zephyrus G14"

            [initramfs]
            config = "$TARGET/etc/mkinitcpio.conf"
            modules = ["nvidia", "nvidia_modeset"]

            [[dataset]]
            name = "ROOT"
            properties = { mountpoint = "none", canmount = "off" }
        "#
        .parse()?;

        assert_eq!(result.settings.pool, "tank");
        assert_eq!(result.settings.disk, "/dev/nvme0n1");
        assert_eq!(result.settings.root_dataset, "ROOT/default");
        assert_eq!(result.settings.esp_size_mib, 1024);
        assert_eq!(result.settings.hardware_model.as_deref(), Some("ROG Zephyrus G14"));
        assert_eq!(result.initramfs.config, PathBuf::from("/mnt/etc/mkinitcpio.conf"));
        assert_eq!(result.initramfs.modules, vec!["nvidia", "nvidia_modeset"]);
        assert_eq!(result.initramfs.hook, "zfs");
        assert_eq!(result.boot, BootSettings::default());
        assert_eq!(result.datasets.len(), 1);

        Ok(())
    }

    #[test]
    fn serialized_profile_parses_back() -> anyhow::Result<()> {
        let profile = Profile::builtin()?;
        let reparsed: Profile = profile.to_string().parse()?;
        assert_eq!(reparsed, profile);

        Ok(())
    }

    #[test]
    fn missing_settings_is_rejected() {
        let result = "[boot]\ntimeout = 5\n".parse::<Profile>();
        assert!(matches!(result, Err(ConfigError::Deserialize(_))));
    }
}
