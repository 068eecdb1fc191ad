// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT


use anyhow::Result;
use std::{
    cell::RefCell,
    collections::BTreeSet,
    fs::write,
    path::{Path, PathBuf},
    rc::Rc,
};
use tempfile::TempDir;
use zprov::{
    context::RunContext,
    prompt::{Prompt, Result as PromptResult},
    system::{CommandOutput, CommandRunner, Invocation, Result as SystemResult},
};

pub(crate) const MKINITCPIO_CONF: &str = "\
# vim:set ft=sh
MODULES=()
BINARIES=()
FILES=()
HOOKS=(base udev autodetect microcode modconf kms keyboard keymap consolefont block filesystems fsck)
";

pub(crate) const KEYS: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIGx alice@zephyrus\n";

/// Freshly pacstrapped system in a temporary directory.
pub(crate) struct TargetRoot {
    dir: TempDir,
}

impl TargetRoot {
    pub(crate) fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        mkdirp::mkdirp(dir.path().join("etc"))?;
        mkdirp::mkdirp(dir.path().join("boot"))?;
        write(dir.path().join("etc/mkinitcpio.conf"), MKINITCPIO_CONF)?;
        write(dir.path().join("boot/vmlinuz-linux"), "")?;

        Ok(Self { dir })
    }

    pub(crate) fn path(&self) -> &Path {
        self.dir.path()
    }

    pub(crate) fn join(&self, path: impl AsRef<Path>) -> PathBuf {
        self.dir.path().join(path)
    }

    pub(crate) fn ctx(&self) -> RunContext {
        let mut ctx = RunContext::new(self.path());
        ctx.pool = "zroot".into();
        ctx.hostname = "zephyrus".into();
        ctx.username = "alice".into();
        ctx
    }
}

#[derive(Debug, Default)]
struct HostState {
    root: PathBuf,
    packages: BTreeSet<String>,
    units: BTreeSet<String>,
    broken: BTreeSet<String>,
    offline: bool,
    calls: Vec<String>,
}

/// Simulated host tools acting on a [`TargetRoot`].
///
/// Tools that write into the target system, e.g., `zgenhostid`, write real
/// files beneath the root so that file based probes see their effects.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeHost {
    state: Rc<RefCell<HostState>>,
}

impl FakeHost {
    pub(crate) fn new(root: &TargetRoot) -> Self {
        let state = HostState {
            root: root.path().to_path_buf(),
            ..HostState::default()
        };

        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    /// Make program exit non-zero.
    pub(crate) fn break_program(&self, program: &str) {
        self.state.borrow_mut().broken.insert(program.to_owned());
    }

    pub(crate) fn repair_program(&self, program: &str) {
        self.state.borrow_mut().broken.remove(program);
    }

    /// Make remote key lookups fail.
    pub(crate) fn go_offline(&self) {
        self.state.borrow_mut().offline = true;
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    pub(crate) fn enabled_units(&self) -> Vec<String> {
        self.state.borrow().units.iter().cloned().collect()
    }

    fn dispatch(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let mut state = self.state.borrow_mut();
        if state.broken.contains(program) {
            return Ok(CommandOutput::failure(1, format!("{program}: simulated failure")));
        }

        let args = args
            .iter()
            .filter(|arg| !arg.starts_with("--root="))
            .map(String::as_str)
            .collect::<Vec<_>>();
        let output = match (program, args.as_slice()) {
            ("pacman", ["--sysroot", _, "-Qq", packages @ ..]) => {
                let installed = packages
                    .iter()
                    .filter(|package| state.packages.contains(**package))
                    .map(|package| format!("{package}\n"))
                    .collect::<String>();
                match installed.lines().count() == packages.len() {
                    true => CommandOutput::success(installed),
                    false => CommandOutput {
                        success: false,
                        code: Some(1),
                        stdout: installed,
                        stderr: "error: package was not found\n".into(),
                    },
                }
            }
            ("pacman", ["--sysroot", _, "-S", "--needed", "--noconfirm", packages @ ..]) => {
                state.packages.extend(packages.iter().map(|package| package.to_string()));
                CommandOutput::success("")
            }
            ("zgenhostid", ["-f"]) => {
                write(state.root.join("etc/hostid"), [0x5au8, 0x7e, 0x1d, 0x00])?;
                CommandOutput::success("")
            }
            ("mkinitcpio", ["-P"]) => {
                write(state.root.join("boot/initramfs-linux.img"), "")?;
                CommandOutput::success("")
            }
            ("systemctl", ["is-enabled", unit]) => match state.units.contains(*unit) {
                true => CommandOutput::success("enabled\n"),
                false => CommandOutput {
                    success: false,
                    code: Some(1),
                    stdout: "disabled\n".into(),
                    stderr: String::new(),
                },
            },
            ("systemctl", ["enable", unit]) => {
                state.units.insert(unit.to_string());
                CommandOutput::success("")
            }
            ("curl", _) if state.offline => {
                CommandOutput::failure(6, "curl: (6) Could not resolve host: github.com")
            }
            ("curl", _) => CommandOutput::success(KEYS),
            ("chown", _) => CommandOutput::success(""),
            ("lsblk", _) => CommandOutput::success(""),
            (program, args) => {
                CommandOutput::failure(127, format!("unexpected call: {program} {}", args.join(" ")))
            }
        };

        Ok(output)
    }
}

impl CommandRunner for FakeHost {
    fn run(&self, invocation: &Invocation) -> SystemResult<CommandOutput> {
        self.state.borrow_mut().calls.push(invocation.to_string());

        // INVARIANT: arch-chroot only changes where a command runs, not what it does.
        let (program, args) = match (invocation.program(), invocation.arguments()) {
            ("arch-chroot", [_, program, args @ ..]) => (program.as_str(), args),
            (program, args) => (program, args),
        };

        Ok(self
            .dispatch(program, args)
            .unwrap_or_else(|error| CommandOutput::failure(1, error.to_string())))
    }
}

/// Operator that takes every default, and declines every confirmation.
pub(crate) struct Cautious;

impl Prompt for Cautious {
    fn text(&self, _question: &str, default: Option<&str>) -> PromptResult<String> {
        Ok(default.unwrap_or_default().to_owned())
    }

    fn confirm(&self, _question: &str, _default: bool) -> PromptResult<bool> {
        Ok(false)
    }
}
