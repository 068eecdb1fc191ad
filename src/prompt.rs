// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Operator interaction.
//!
//! Zprov only talks to the operator in two situations: when a required
//! parameter was not supplied through the environment, and when something is
//! about to happen that cannot be undone. Both go through [`Prompt`] so the
//! rest of the crate never touches the terminal directly.

use inquire::{Confirm, InquireError, Text};

/// Ask the operator for input.
pub trait Prompt {
    /// Read a line of input, offering an optional default.
    ///
    /// # Errors
    ///
    /// - Return [`PromptError`] if no answer can be obtained.
    fn text(&self, message: &str, default: Option<&str>) -> Result<String>;

    /// Ask a yes/no question.
    ///
    /// # Errors
    ///
    /// - Return [`PromptError`] if no answer can be obtained.
    fn confirm(&self, message: &str, default: bool) -> Result<bool>;
}

/// Prompt through the terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct InquirePrompt;

impl Prompt for InquirePrompt {
    fn text(&self, message: &str, default: Option<&str>) -> Result<String> {
        let mut prompt = Text::new(message);
        if let Some(default) = default {
            prompt = prompt.with_default(default);
        }

        Ok(prompt.prompt()?)
    }

    fn confirm(&self, message: &str, default: bool) -> Result<bool> {
        match Confirm::new(message).with_default(default).prompt() {
            Ok(answer) => Ok(answer),
            // INVARIANT: Escaping out of a confirmation is a "no".
            Err(InquireError::OperationCanceled) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }
}

/// Never prompt.
///
/// Accepts every default and confirms every question. Fails for parameters
/// that have no default at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeYes;

impl Prompt for AssumeYes {
    fn text(&self, message: &str, default: Option<&str>) -> Result<String> {
        default.map(str::to_owned).ok_or_else(|| PromptError::NoDefault {
            message: message.to_owned(),
        })
    }

    fn confirm(&self, _message: &str, _default: bool) -> Result<bool> {
        Ok(true)
    }
}

/// Operator interaction error types.
#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    /// Terminal prompt failed or was interrupted.
    #[error(transparent)]
    Inquire(#[from] InquireError),

    /// Non-interactive run hit a question without a default answer.
    #[error("no answer for {message:?} while running non-interactively")]
    NoDefault { message: String },
}

/// Friendly result alias :3
pub type Result<T, E = PromptError> = std::result::Result<T, E>;
