// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Precondition checks.
//!
//! Before a phase touches anything, the host is checked against a list of
//! [`Requirement`]s. Requirements come in two severities:
//!
//! - __Fatal__: the phase cannot possibly succeed without it, e.g., running as
//!   root, or having `zpool` installed. Every fatal requirement is checked,
//!   and all unmet ones are reported together.
//! - __Advisory__: the phase will probably work, but the operator should know
//!   about it, e.g., the hardware differs from what the profile was written
//!   for. The operator is asked whether to continue anyway.
//!
//! Fatal requirements are always evaluated before advisory ones.

use crate::prompt::{Prompt, PromptError};

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{metadata, read_to_string},
    os::unix::fs::MetadataExt,
    path::Path,
};
use tracing::{debug, warn};

/// Facts about the host that requirements are checked against.
pub trait Environment {
    /// Effective user id of this process, if it can be determined.
    fn effective_uid(&self) -> Option<u32>;

    /// Check if program can be found on `PATH`.
    fn has_tool(&self, program: &str) -> bool;

    /// Check if host was booted through UEFI.
    fn is_uefi(&self) -> bool;

    /// Product name of host hardware, if firmware reports one.
    fn hardware_model(&self) -> Option<String>;
}

/// The machine zprov is running on.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostEnvironment;

impl Environment for HostEnvironment {
    // INVARIANT: procfs entries of a process are owned by its effective uid.
    fn effective_uid(&self) -> Option<u32> {
        metadata("/proc/self").ok().map(|meta| meta.uid())
    }

    fn has_tool(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }

    fn is_uefi(&self) -> bool {
        Path::new("/sys/firmware/efi").is_dir()
    }

    fn hardware_model(&self) -> Option<String> {
        read_to_string("/sys/class/dmi/id/product_name")
            .ok()
            .map(|name| name.trim().to_owned())
            .filter(|name| !name.is_empty())
    }
}

/// How bad an unmet requirement is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Phase cannot run.
    Fatal,

    /// Operator decides whether phase runs.
    Advisory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Check {
    Superuser,
    Tool(String),
    Uefi,
    HardwareModel(String),
}

/// A single precondition of a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    check: Check,
    severity: Severity,
}

impl Requirement {
    /// Process must run as root.
    pub fn superuser() -> Self {
        Self {
            check: Check::Superuser,
            severity: Severity::Fatal,
        }
    }

    /// Program must be installed.
    pub fn tool(program: impl Into<String>) -> Self {
        Self {
            check: Check::Tool(program.into()),
            severity: Severity::Fatal,
        }
    }

    /// Host must have booted through UEFI.
    pub fn uefi() -> Self {
        Self {
            check: Check::Uefi,
            severity: Severity::Fatal,
        }
    }

    /// Host hardware should match expected model.
    pub fn hardware_model(expected: impl Into<String>) -> Self {
        Self {
            check: Check::HardwareModel(expected.into()),
            severity: Severity::Advisory,
        }
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Check if environment satisfies requirement.
    pub fn is_met(&self, env: &dyn Environment) -> bool {
        match &self.check {
            Check::Superuser => env.effective_uid() == Some(0),
            Check::Tool(program) => env.has_tool(program),
            Check::Uefi => env.is_uefi(),
            Check::HardwareModel(expected) => env
                .hardware_model()
                .is_some_and(|model| model.trim() == expected.trim()),
        }
    }

    /// Explain to operator why requirement is not met.
    pub fn message(&self, env: &dyn Environment) -> String {
        match &self.check {
            Check::Superuser => "must be run as root".into(),
            Check::Tool(program) => format!("required program {program:?} is not installed"),
            Check::Uefi => "host was not booted in UEFI mode".into(),
            Check::HardwareModel(expected) => format!(
                "hardware is {:?}, but profile was written for {expected:?}",
                env.hardware_model().unwrap_or_else(|| "unknown".into())
            ),
        }
    }
}

/// Outcome of a successful precondition check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Phase may run.
    Proceed,

    /// Operator chose not to run phase after an advisory warning.
    Declined,
}

/// Check every requirement against environment.
///
/// # Errors
///
/// - Return [`PreflightError::Unmet`] listing every unmet fatal requirement.
/// - Return [`PreflightError::Prompt`] if operator cannot be asked about an
///   unmet advisory requirement.
pub fn check_all(
    requirements: &[Requirement],
    env: &dyn Environment,
    prompt: &dyn Prompt,
) -> Result<Verdict> {
    let unmet = requirements
        .iter()
        .filter(|requirement| requirement.severity() == Severity::Fatal)
        .filter(|requirement| !requirement.is_met(env))
        .map(|requirement| requirement.message(env))
        .collect::<Vec<_>>();
    if !unmet.is_empty() {
        return Err(PreflightError::Unmet(UnmetRequirements(unmet)));
    }

    for requirement in requirements
        .iter()
        .filter(|requirement| requirement.severity() == Severity::Advisory)
    {
        if requirement.is_met(env) {
            continue;
        }

        let message = requirement.message(env);
        warn!("{message}");
        if !prompt.confirm(&format!("{message}. Continue anyway?"), false)? {
            return Ok(Verdict::Declined);
        }
    }

    debug!("all {} requirements met", requirements.len());
    Ok(Verdict::Proceed)
}

/// Listing of unmet fatal requirements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmetRequirements(pub Vec<String>);

impl Display for UnmetRequirements {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        for message in &self.0 {
            write!(fmt, "\n  - {message}")?;
        }

        Ok(())
    }
}

/// Precondition check error types.
#[derive(Debug, thiserror::Error)]
pub enum PreflightError {
    /// Fatal requirements are not met.
    #[error("host does not meet requirements:{0}")]
    Unmet(UnmetRequirements),

    /// Operator could not be asked to confirm.
    #[error(transparent)]
    Prompt(#[from] PromptError),
}

/// Friendly result alias :3
pub type Result<T, E = PreflightError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::{scripted::ScriptedPrompt, AssumeYes};
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    #[derive(Default)]
    struct FakeEnvironment {
        uid: u32,
        tools: Vec<&'static str>,
        uefi: bool,
        model: Option<&'static str>,
    }

    impl Environment for FakeEnvironment {
        fn effective_uid(&self) -> Option<u32> {
            Some(self.uid)
        }

        fn has_tool(&self, program: &str) -> bool {
            self.tools.iter().any(|tool| *tool == program)
        }

        fn is_uefi(&self) -> bool {
            self.uefi
        }

        fn hardware_model(&self) -> Option<String> {
            self.model.map(str::to_owned)
        }
    }

    fn laptop() -> FakeEnvironment {
        FakeEnvironment {
            uid: 0,
            tools: vec!["zpool", "zfs"],
            uefi: true,
            model: Some("ROG Zephyrus G14 GA402RJ"),
        }
    }

    #[test_case(Requirement::superuser(), true; "superuser")]
    #[test_case(Requirement::tool("zpool"), true; "installed tool")]
    #[test_case(Requirement::tool("parted"), false; "missing tool")]
    #[test_case(Requirement::uefi(), true; "uefi")]
    #[test_case(Requirement::hardware_model("ROG Zephyrus G14 GA402RJ"), true; "matching model")]
    #[test_case(Requirement::hardware_model("ThinkPad X1"), false; "other model")]
    #[test]
    fn requirement_is_checked_against_environment(requirement: Requirement, expect: bool) {
        pretty_assertions::assert_eq!(requirement.is_met(&laptop()), expect);
    }

    #[test]
    fn every_unmet_fatal_requirement_is_reported() {
        let env = FakeEnvironment {
            uid: 1000,
            ..FakeEnvironment::default()
        };
        let prompt = ScriptedPrompt::default();
        let result = check_all(
            &[
                Requirement::superuser(),
                Requirement::tool("zpool"),
                Requirement::uefi(),
                Requirement::hardware_model("ThinkPad X1"),
            ],
            &env,
            &prompt,
        );

        match result {
            Err(PreflightError::Unmet(unmet)) => assert_eq!(
                unmet.0,
                vec![
                    "must be run as root",
                    "required program \"zpool\" is not installed",
                    "host was not booted in UEFI mode",
                ]
            ),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(prompt.asked.borrow().is_empty());
    }

    #[test]
    fn advisory_mismatch_asks_operator() -> anyhow::Result<()> {
        let requirements = [Requirement::superuser(), Requirement::hardware_model("ThinkPad X1")];

        let prompt = ScriptedPrompt::with_confirmations([false]);
        assert_eq!(check_all(&requirements, &laptop(), &prompt)?, Verdict::Declined);
        assert_eq!(prompt.asked.borrow().len(), 1);

        assert_eq!(check_all(&requirements, &laptop(), &AssumeYes)?, Verdict::Proceed);

        Ok(())
    }

    #[test]
    fn unmet_requirements_render_as_list() {
        let error = PreflightError::Unmet(UnmetRequirements(vec![
            "must be run as root".into(),
            "host was not booted in UEFI mode".into(),
        ]));
        assert_eq!(
            error.to_string(),
            "host does not meet requirements:\n  - must be run as root\n  - host was not booted in UEFI mode"
        );
    }
}
