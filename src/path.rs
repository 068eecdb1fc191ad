// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine where zprov keeps its own files on the host, as opposed to the
//! files it manages inside the target system.

use std::path::PathBuf;

/// Determine default absolute path to the user's profile.
///
/// Uses XDG Base Directory path `$XDG_CONFIG_HOME/zprov/profile.toml`. Does
/// not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoConfigDir`] if configuration directory cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_profile_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("zprov").join("profile.toml"))
        .ok_or(NoConfigDir)
}

/// No way to determine user's configuration directory.
///
/// # See Also
///
/// - [`dirs::config_dir`](https://docs.rs/dirs/latest/dirs/fn.config_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's configuration directory")]
pub struct NoConfigDir;

/// Friendly result alias :3
pub type Result<T, E = NoConfigDir> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("XDG_CONFIG_HOME", "/tmp/zprov-config")])]
    fn default_profile_path_follows_xdg() -> anyhow::Result<()> {
        assert_eq!(
            default_profile_path()?,
            PathBuf::from("/tmp/zprov-config/zprov/profile.toml")
        );

        Ok(())
    }
}
