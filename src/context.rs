// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Run parameters.
//!
//! A phase needs a handful of parameters before it can do anything: which disk
//! to partition, what to call the pool, who the primary user is. These are
//! resolved exactly once, before the first step runs, and then handed to every
//! step as an immutable [`RunContext`].
//!
//! # Resolution Order
//!
//! Each parameter is taken from the first source that supplies a non-empty
//! value:
//!
//! 1. Command-line override.
//! 2. Environment variable, e.g., `ZPROV_POOL`.
//! 3. Operator prompt, seeded with the profile's default.

use crate::prompt::{Prompt, PromptError};

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Resolved parameters of a single run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    /// Root directory of the system being provisioned.
    pub root: PathBuf,

    /// Block device to install onto.
    pub disk: String,

    /// Name of the ZFS pool.
    pub pool: String,

    /// Size of the swap volume, `0` for none.
    pub swap_size: String,

    /// Hostname of the installed system.
    pub hostname: String,

    /// Primary user of the installed system.
    pub username: String,

    /// Account whose published SSH keys get authorized for the primary user.
    pub keys_account: Option<String>,
}

impl RunContext {
    /// Construct context for target root with every other parameter empty.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            disk: String::new(),
            pool: String::new(),
            swap_size: String::new(),
            hostname: String::new(),
            username: String::new(),
            keys_account: None,
        }
    }

    /// Map absolute path of the installed system onto the host.
    pub fn target_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        self.root.join(path.strip_prefix("/").unwrap_or(path))
    }

    /// Check if target root is the host's root.
    pub fn is_host_root(&self) -> bool {
        self.root == Path::new("/")
    }

    /// Substitute run parameters into template.
    ///
    /// Recognizes `{pool}`, `{disk}`, `{root}`, `{hostname}`, `{user}`,
    /// `{swap_size}`, and `{keys_account}`. Anything else is left as is.
    pub fn expand(&self, template: &str) -> String {
        let root = self.root.to_string_lossy();
        let keys_account = self.keys_account.as_deref().unwrap_or_default();
        [
            ("{pool}", self.pool.as_str()),
            ("{disk}", self.disk.as_str()),
            ("{root}", &*root),
            ("{hostname}", self.hostname.as_str()),
            ("{user}", self.username.as_str()),
            ("{swap_size}", self.swap_size.as_str()),
            ("{keys_account}", keys_account),
        ]
        .into_iter()
        .fold(template.to_owned(), |text, (marker, value)| {
            text.replace(marker, value)
        })
    }
}

/// A single resolvable run parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parameter {
    Root,
    Disk,
    Pool,
    SwapSize,
    Hostname,
    Username,
    KeysAccount,
}

impl Parameter {
    /// Environment variable that supplies parameter.
    pub fn env_var(self) -> &'static str {
        match self {
            Self::Root => "ZPROV_ROOT",
            Self::Disk => "ZPROV_DISK",
            Self::Pool => "ZPROV_POOL",
            Self::SwapSize => "ZPROV_SWAP_SIZE",
            Self::Hostname => "ZPROV_HOSTNAME",
            Self::Username => "ZPROV_USER",
            Self::KeysAccount => "ZPROV_KEYS_ACCOUNT",
        }
    }

    /// Question asked when parameter must be prompted for.
    pub fn question(self) -> &'static str {
        match self {
            Self::Root => "Target root directory",
            Self::Disk => "Target disk (e.g. /dev/nvme0n1)",
            Self::Pool => "ZFS pool name",
            Self::SwapSize => "Swap volume size (0 for none)",
            Self::Hostname => "Hostname",
            Self::Username => "Primary user name",
            Self::KeysAccount => "Account to fetch SSH keys from (empty to skip)",
        }
    }

    fn is_optional(self) -> bool {
        matches!(self, Self::KeysAccount)
    }

    // INVARIANT: The target root is never asked for, it always has a default.
    fn is_prompted(self) -> bool {
        !matches!(self, Self::Root)
    }
}

type Lookup<'a> = Box<dyn Fn(&str) -> Option<String> + 'a>;

/// Resolve run parameters into a [`RunContext`].
pub struct ContextResolver<'a> {
    defaults: HashMap<Parameter, String>,
    overrides: HashMap<Parameter, String>,
    lookup: Lookup<'a>,
}

impl Default for ContextResolver<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> ContextResolver<'a> {
    /// Construct new resolver that reads the process environment.
    pub fn new() -> Self {
        Self {
            defaults: HashMap::new(),
            overrides: HashMap::new(),
            lookup: Box::new(|key| std::env::var(key).ok()),
        }
    }

    /// Replace environment lookup.
    pub fn with_lookup(mut self, lookup: impl Fn(&str) -> Option<String> + 'a) -> Self {
        self.lookup = Box::new(lookup);
        self
    }

    /// Offer default value for parameter. Empty values are ignored.
    pub fn with_default(mut self, parameter: Parameter, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.defaults.insert(parameter, value);
        }
        self
    }

    /// Force value of parameter, e.g., from the command line.
    pub fn with_override(mut self, parameter: Parameter, value: Option<String>) -> Self {
        if let Some(value) = value.filter(|value| !value.is_empty()) {
            self.overrides.insert(parameter, value);
        }
        self
    }

    /// Resolve listed parameters.
    ///
    /// Parameters that are not listed stay empty in the returned context,
    /// except for the target root which falls back to `/`.
    ///
    /// # Errors
    ///
    /// - Return [`ContextError::MissingParameter`] if a required parameter
    ///   resolves to nothing.
    /// - Return [`ContextError::Prompt`] if prompting the operator fails.
    pub fn resolve(&self, parameters: &[Parameter], prompt: &dyn Prompt) -> Result<RunContext> {
        let mut ctx = RunContext::new("/");
        for parameter in parameters {
            let value = self.resolve_one(*parameter, prompt)?;
            match parameter {
                Parameter::Root => ctx.root = PathBuf::from(value),
                Parameter::Disk => ctx.disk = value,
                Parameter::Pool => ctx.pool = value,
                Parameter::SwapSize => ctx.swap_size = value,
                Parameter::Hostname => ctx.hostname = value,
                Parameter::Username => ctx.username = value,
                Parameter::KeysAccount => ctx.keys_account = Some(value).filter(|v| !v.is_empty()),
            }
        }

        debug!("resolved run context: {ctx:?}");
        Ok(ctx)
    }

    fn resolve_one(&self, parameter: Parameter, prompt: &dyn Prompt) -> Result<String> {
        if let Some(value) = self.overrides.get(&parameter) {
            return Ok(value.clone());
        }

        if let Some(value) = (self.lookup)(parameter.env_var()).filter(|v| !v.trim().is_empty()) {
            debug!("{} taken from {}", parameter.question(), parameter.env_var());
            return Ok(value.trim().to_owned());
        }

        let default = self.defaults.get(&parameter).map(String::as_str);
        if !parameter.is_prompted() {
            return Ok(default.unwrap_or("/").to_owned());
        }

        let default = match default {
            Some(default) => Some(default),
            None if parameter.is_optional() => Some(""),
            None => None,
        };

        let value = prompt.text(parameter.question(), default)?.trim().to_owned();
        if value.is_empty() && !parameter.is_optional() {
            return Err(ContextError::MissingParameter {
                parameter: parameter.question(),
                env_var: parameter.env_var(),
            });
        }

        Ok(value)
    }
}

/// Run parameter resolution error types.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// Required parameter has no value.
    #[error("no value for {parameter:?}, set {env_var} or answer the prompt")]
    MissingParameter {
        parameter: &'static str,
        env_var: &'static str,
    },

    /// Operator could not be prompted.
    #[error(transparent)]
    Prompt(#[from] PromptError),
}

/// Friendly result alias :3
pub type Result<T, E = ContextError> = std::result::Result<T, E>;
