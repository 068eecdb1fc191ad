// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Remote public key authorization.
//!
//! Public SSH keys of an account are fetched over HTTPS and authorized for the
//! primary user. The remote is an optional collaborator: if it cannot be
//! reached, the step is deferred to the operator instead of failing the run.

use crate::{
    context::RunContext,
    drafter::write_managed,
    pipeline::{ActionTaken, ProbeResult, Result, Step, StepError, StepMeta},
    steps::require,
    system::{CommandRunner, Invocation, SystemRunner},
};

use std::{
    fs::{metadata, set_permissions, Permissions},
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

const KEYS_MODE: u32 = 0o600;
const SSH_DIR_MODE: u32 = 0o700;

/// Primary user's `authorized_keys`, filled from a remote account.
#[derive(Debug, Clone)]
pub struct AuthorizedKeysStep<R = SystemRunner> {
    meta: StepMeta,
    runner: R,
    url: String,
}

impl<R: CommandRunner> AuthorizedKeysStep<R> {
    /// Construct new key step. URL may carry run parameter markers.
    pub fn new(runner: R, url: impl Into<String>) -> Self {
        Self {
            meta: StepMeta::new("authorized-keys"),
            runner,
            url: url.into(),
        }
    }

    /// Require other steps to have succeeded first.
    pub fn after(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.meta = self.meta.after(ids);
        self
    }

    fn ssh_dir(ctx: &RunContext) -> Result<PathBuf> {
        let user = require(&ctx.username, "primary user")?;
        Ok(PathBuf::from("/home").join(user).join(".ssh"))
    }

    fn fetch(&self, ctx: &RunContext) -> Result<Result<String, String>> {
        let url = ctx.expand(&self.url);
        let fetch = Invocation::new("curl").args(["-fsSL", "--proto", "=https", &url]);

        // INVARIANT: Any failure to fetch keys is a reason to defer, never an error.
        let output = match self.runner.run(&fetch) {
            Ok(output) => output,
            Err(error) => return Ok(Err(error.to_string())),
        };

        if !output.success {
            return Ok(Err(format!("failed to fetch {url}: {}", output.message())));
        }

        if output.stdout.trim().is_empty() {
            return Ok(Err(format!("no public keys are published at {url}")));
        }

        Ok(Ok(output.stdout))
    }
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    set_permissions(path, Permissions::from_mode(mode)).map_err(|err| StepError::Io {
        source: err,
        path: path.to_path_buf(),
    })
}

impl<R: CommandRunner> Step for AuthorizedKeysStep<R> {
    fn meta(&self) -> &StepMeta {
        &self.meta
    }

    fn describe(&self, ctx: &RunContext) -> String {
        format!("Authorizing keys of {}", ctx.expand(&self.url))
    }

    fn probe(&self, ctx: &RunContext) -> Result<ProbeResult> {
        let path = ctx.target_path(Self::ssh_dir(ctx)?.join("authorized_keys"));
        let meta = match metadata(&path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(ProbeResult::Absent),
            Err(err) => return Err(StepError::Io { source: err, path }),
        };

        if meta.len() == 0 {
            return Ok(ProbeResult::PresentIncorrect("authorized_keys is empty".into()));
        }

        let mode = meta.permissions().mode() & 0o777;
        if mode != KEYS_MODE {
            return Ok(ProbeResult::PresentIncorrect(format!(
                "authorized_keys has mode {mode:o}, expected {KEYS_MODE:o}"
            )));
        }

        Ok(ProbeResult::PresentCorrect)
    }

    fn apply(&self, probe: &ProbeResult, ctx: &RunContext) -> Result<ActionTaken> {
        if ctx.keys_account.is_none() {
            return Ok(ActionTaken::Deferred("no key account was given".into()));
        }

        let user = require(&ctx.username, "primary user")?;
        let ssh_dir = Self::ssh_dir(ctx)?;
        let host_dir = ctx.target_path(&ssh_dir);
        let keys = host_dir.join("authorized_keys");

        // INVARIANT: Keys already on disk are never replaced, only fixed up.
        if metadata(&keys).map(|meta| meta.len() == 0).unwrap_or(true) {
            let fetched = match self.fetch(ctx)? {
                Ok(fetched) => fetched,
                Err(reason) => {
                    warn!("{reason}");
                    return Ok(ActionTaken::Deferred(reason));
                }
            };
            write_managed(&keys, fetched)?;
            info!("authorized {} keys for {user}", ctx.expand(&self.url));
        }

        set_mode(&host_dir, SSH_DIR_MODE)?;
        set_mode(&keys, KEYS_MODE)?;
        self.runner.run_checked(
            &Invocation::new("chown")
                .arg("-R")
                .arg(format!("{user}:{user}"))
                .arg(ssh_dir.to_string_lossy())
                .in_target(&ctx.root),
        )?;

        Ok(ActionTaken::for_probe(probe))
    }
}
