// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! External command execution.
//!
//! Every mutation zprov performs on a system object goes through an external
//! tool, e.g., `zpool`, `parted`, `systemctl`. This module provides the one
//! seam through which those tools are invoked, so steps can be exercised
//! against a scripted runner instead of a real machine.
//!
//! Commands block until they exit. A per-command timeout can be configured,
//! but none is applied by default: a hung tool hangs the whole run.

use indicatif::{ProgressBar, ProgressStyle};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::Path,
    process::{Command, Output, Stdio},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, instrument};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A single call into an external program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
}

impl Invocation {
    /// Construct new invocation of target program without arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append a listing of arguments.
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run invocation inside target root through `arch-chroot`.
    ///
    /// Left untouched if target root is the host root.
    pub fn in_target(self, root: &Path) -> Self {
        if root == Path::new("/") {
            return self;
        }

        Invocation::new("arch-chroot")
            .arg(root.to_string_lossy())
            .arg(self.program)
            .args(self.args)
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }
}

impl Display for Invocation {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(&self.program)?;
        for arg in &self.args {
            write!(fmt, " {arg}")?;
        }

        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful exit with given standard output.
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed exit with given code and standard error.
    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Diagnostic message of the command, as the tool printed it.
    ///
    /// Prefers standard error, falls back to standard output, and finally to
    /// the exit code if the tool printed nothing at all.
    pub fn message(&self) -> String {
        // INVARIANT: Chomp trailing newlines only, keep the rest verbatim.
        let stderr = self.stderr.trim_end_matches(['\r', '\n']);
        if !stderr.is_empty() {
            return stderr.to_owned();
        }

        let stdout = self.stdout.trim_end_matches(['\r', '\n']);
        if !stdout.is_empty() {
            return stdout.to_owned();
        }

        match self.code {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".into(),
        }
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Run external commands.
pub trait CommandRunner {
    /// Run invocation to completion.
    ///
    /// A non-zero exit status is __not__ an error here. Probes rely on failed
    /// queries to detect absent resources.
    ///
    /// # Errors
    ///
    /// - Return [`SystemError::Missing`] if program is not installed.
    /// - Return [`SystemError::Spawn`] if program cannot be started.
    /// - Return [`SystemError::TimedOut`] if program exceeds timeout.
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;

    /// Run invocation to completion, treating non-zero exit as failure.
    ///
    /// # Errors
    ///
    /// - Return [`SystemError::Failed`] with the tool's own message if the
    ///   command exits unsuccessfully.
    /// - Any error of [`CommandRunner::run`].
    fn run_checked(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let output = self.run(invocation)?;
        if !output.success {
            return Err(SystemError::Failed {
                command: invocation.to_string(),
                message: output.message(),
            });
        }

        Ok(output)
    }
}

/// Command runner backed by real processes.
///
/// Shows a spinner on the terminal while a command runs.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    timeout: Option<Duration>,
}

impl SystemRunner {
    /// Construct new runner that blocks on every command.
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill commands that run longer than timeout.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn spinner(invocation: &Invocation) -> ProgressBar {
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.green} {elapsed:.dim} {msg}") {
            bar.set_style(style);
        }
        bar.set_message(invocation.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));
        bar
    }
}

impl CommandRunner for SystemRunner {
    #[instrument(skip(self, invocation), fields(command = %invocation), level = "debug")]
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        debug!("run {invocation}");
        let bar = Self::spinner(invocation);
        let result = match self.timeout {
            Some(timeout) => run_with_timeout(invocation, timeout),
            None => run_blocking(invocation),
        };
        bar.finish_and_clear();

        if let Ok(output) = &result {
            debug!("{} exited with {:?}", invocation.program(), output.code);
        }

        result
    }
}

fn command(invocation: &Invocation) -> Command {
    let mut command = Command::new(invocation.program());
    command.args(invocation.arguments()).stdin(Stdio::null());
    command
}

fn spawn_error(invocation: &Invocation, error: io::Error) -> SystemError {
    if error.kind() == io::ErrorKind::NotFound {
        return SystemError::Missing {
            program: invocation.program().to_owned(),
        };
    }

    SystemError::Spawn {
        source: error,
        program: invocation.program().to_owned(),
    }
}

fn run_blocking(invocation: &Invocation) -> Result<CommandOutput> {
    command(invocation)
        .output()
        .map(CommandOutput::from)
        .map_err(|err| spawn_error(invocation, err))
}

// INVARIANT: Output goes to temporary files rather than pipes, so a chatty
// command cannot stall on a full pipe while we poll it.
fn run_with_timeout(invocation: &Invocation, timeout: Duration) -> Result<CommandOutput> {
    let mut stdout = tempfile::tempfile()?;
    let mut stderr = tempfile::tempfile()?;
    let mut child = command(invocation)
        .stdout(Stdio::from(stdout.try_clone()?))
        .stderr(Stdio::from(stderr.try_clone()?))
        .spawn()
        .map_err(|err| spawn_error(invocation, err))?;

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }

        if started.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SystemError::TimedOut {
                command: invocation.to_string(),
                timeout,
            });
        }

        thread::sleep(POLL_INTERVAL);
    };

    Ok(CommandOutput {
        success: status.success(),
        code: status.code(),
        stdout: read_capture(&mut stdout)?,
        stderr: read_capture(&mut stderr)?,
    })
}

fn read_capture(file: &mut File) -> Result<String> {
    let mut buffer = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// External command error types.
#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    /// Program is not installed.
    #[error("required program {program:?} is not installed")]
    Missing { program: String },

    /// Program could not be started.
    #[error("failed to spawn {program:?}")]
    Spawn {
        #[source]
        source: io::Error,
        program: String,
    },

    /// Program exited unsuccessfully.
    #[error("command `{command}` failed:\n{message}")]
    Failed { command: String, message: String },

    /// Program ran longer than allowed.
    #[error("command `{command}` timed out after {}s", timeout.as_secs())]
    TimedOut { command: String, timeout: Duration },

    /// Output of program could not be captured.
    #[error("failed to capture command output")]
    Capture(#[from] io::Error),
}

/// Friendly result alias :3
pub type Result<T, E = SystemError> = std::result::Result<T, E>;

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::{cell::RefCell, rc::Rc};

    type Handler = Box<dyn FnMut(&Invocation) -> Result<CommandOutput>>;

    /// Scripted command runner that records every invocation.
    #[derive(Clone)]
    pub(crate) struct FakeRunner {
        handler: Rc<RefCell<Handler>>,
        calls: Rc<RefCell<Vec<String>>>,
    }

    impl FakeRunner {
        pub(crate) fn new(
            handler: impl FnMut(&Invocation) -> Result<CommandOutput> + 'static,
        ) -> Self {
            Self {
                handler: Rc::new(RefCell::new(Box::new(handler))),
                calls: Rc::new(RefCell::new(Vec::new())),
            }
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
            self.calls.borrow_mut().push(invocation.to_string());
            let mut handler = self.handler.borrow_mut();
            (*handler)(invocation)
        }
    }
}
