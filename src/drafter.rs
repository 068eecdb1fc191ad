// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration file drafting.
//!
//! Utilities to edit small text configuration files in place without
//! resorting to substring surgery.
//!
//! # Shell Array Directives
//!
//! Files like `mkinitcpio.conf` are sourced by a shell, and carry their
//! interesting state in array assignments:
//!
//! ```text
//! HOOKS=(base udev autodetect modconf block filesystems keyboard fsck)
//! ```
//!
//! Such a directive is parsed into an ordered [`TokenList`] before any
//! decision is made about it. Edits are performed on the token list, and only
//! the directive itself is rewritten. Every other line of the file, comments
//! included, is left exactly as it was. Because the file is sourced, a later
//! assignment overrides an earlier one. Thus, the last uncommented directive
//! is the one that counts.
//!
//! # Backups
//!
//! Before any file is rewritten, its original content is copied next to it
//! with a timestamp in the name, e.g., `mkinitcpio.conf.20250101T120000.bak`.

use crate::pipeline::ProbeResult;

use chrono::Local;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{copy, read_to_string, write},
    io,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// Where a token belongs in its list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Immediately before anchor token, or at the end if anchor is missing.
    Before(String),

    /// Anywhere, appended at the end when missing.
    Append,
}

/// Ordered list of tokens.
///
/// # Invariant
///
/// - Placing a token never duplicates it.
/// - Tokens that are not placed keep their relative order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TokenList {
    tokens: Vec<String>,
    changed: bool,
}

impl TokenList {
    /// Construct new token list.
    pub fn new(tokens: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            changed: false,
        }
    }

    /// Tokens in order.
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Check if list was edited.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Classify token against its desired placement.
    pub fn classify(&self, token: &str, placement: &Placement) -> ProbeResult {
        let positions = self.positions(token);
        let Some(&position) = positions.first() else {
            return ProbeResult::Absent;
        };

        if positions.len() > 1 {
            return ProbeResult::PresentIncorrect(format!(
                "{token} is listed {} times",
                positions.len()
            ));
        }

        match placement {
            Placement::Before(anchor) => match self.tokens.iter().position(|t| t == anchor) {
                Some(anchor_position) if anchor_position != position + 1 => {
                    ProbeResult::PresentIncorrect(format!(
                        "{token} is not immediately before {anchor}"
                    ))
                }
                _ => ProbeResult::PresentCorrect,
            },
            Placement::Append => ProbeResult::PresentCorrect,
        }
    }

    /// Place token exactly once according to placement.
    pub fn place(&mut self, token: &str, placement: &Placement) {
        if self.classify(token, placement).is_satisfied() {
            return;
        }

        self.tokens.retain(|t| t != token);
        let anchor = match placement {
            Placement::Before(anchor) => self.tokens.iter().position(|t| t == anchor),
            Placement::Append => None,
        };

        match anchor {
            Some(index) => self.tokens.insert(index, token.to_owned()),
            None => self.tokens.push(token.to_owned()),
        }
        self.changed = true;
    }

    /// Remove every occurrence of token.
    pub fn remove(&mut self, token: &str) {
        let before = self.tokens.len();
        self.tokens.retain(|t| t != token);
        if self.tokens.len() != before {
            self.changed = true;
        }
    }

    fn positions(&self, token: &str) -> Vec<usize> {
        self.tokens
            .iter()
            .enumerate()
            .filter(|(_, t)| *t == token)
            .map(|(index, _)| index)
            .collect()
    }
}

/// Configuration file split around one shell array directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayDocument {
    key: String,
    lines: Vec<String>,
    directive: Option<Directive>,
    trailing_newline: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Directive {
    start: usize,
    end: usize,
    tokens: TokenList,
    trailer: String,
}

impl ArrayDocument {
    /// Parse content, locating the last uncommented `key=(...)` directive.
    ///
    /// Directives may span multiple lines.
    pub fn parse(content: &str, key: impl Into<String>) -> Self {
        let key = key.into();
        let lines = content.lines().map(str::to_owned).collect::<Vec<_>>();
        let opener = format!("{key}=(");

        let mut directive = None;
        let mut index = 0;
        while index < lines.len() {
            let line = lines[index].trim_start();
            if !line.starts_with(&opener) {
                index += 1;
                continue;
            }

            // INVARIANT: Accumulate lines until the closing parenthesis.
            let mut body = line[opener.len()..].to_owned();
            let start = index;
            while !body.contains(')') && index + 1 < lines.len() {
                index += 1;
                body.push(' ');
                body.push_str(&lines[index]);
            }

            let (inner, trailer) = match body.split_once(')') {
                Some((inner, trailer)) => (inner.to_owned(), trailer.to_owned()),
                None => (body, String::new()),
            };
            directive = Some(Directive {
                start,
                end: index,
                tokens: TokenList::new(inner.split_whitespace()),
                trailer,
            });
            index += 1;
        }

        Self {
            key,
            lines,
            directive,
            trailing_newline: content.ends_with('\n'),
        }
    }

    /// Tokens of directive, if present.
    pub fn tokens(&self) -> Option<&TokenList> {
        self.directive.as_ref().map(|directive| &directive.tokens)
    }

    /// Mutable tokens of directive, if present.
    pub fn tokens_mut(&mut self) -> Option<&mut TokenList> {
        self.directive.as_mut().map(|directive| &mut directive.tokens)
    }
}

impl Display for ArrayDocument {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let mut out = Vec::with_capacity(self.lines.len());
        for (index, line) in self.lines.iter().enumerate() {
            match &self.directive {
                Some(directive) if index == directive.start => out.push(format!(
                    "{}=({}){}",
                    self.key,
                    directive.tokens.tokens().join(" "),
                    directive.trailer
                )),
                Some(directive) if index > directive.start && index <= directive.end => continue,
                _ => out.push(line.clone()),
            }
        }

        fmt.write_str(&out.join("\n"))?;
        if self.trailing_newline {
            fmt.write_str("\n")?;
        }

        Ok(())
    }
}

/// Manage one shell array directive in a configuration file.
#[derive(Debug, Clone)]
pub struct ArrayDrafter {
    path: PathBuf,
    key: String,
}

impl ArrayDrafter {
    /// Construct new drafter for directive `key` of file at `path`.
    pub fn new(path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            key: key.into(),
        }
    }

    /// Read current tokens of directive.
    ///
    /// A missing file, or a file without the directive, yields `None`.
    ///
    /// # Errors
    ///
    /// - Return [`DraftError::Read`] if file exists but cannot be read.
    pub fn current(&self) -> Result<Option<TokenList>> {
        let content = match read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(DraftError::Read {
                    source: err,
                    path: self.path.clone(),
                })
            }
        };

        Ok(ArrayDocument::parse(&content, &self.key).tokens().cloned())
    }

    /// Edit tokens of directive.
    ///
    /// Reads the directive into a [`TokenList`], hands it to the editor, and
    /// writes the file back if and only if the editor changed something. The
    /// original file is backed up first.
    ///
    /// Returns whether the file was rewritten.
    ///
    /// # Errors
    ///
    /// - Return [`DraftError::Read`] if file cannot be read.
    /// - Return [`DraftError::MissingDirective`] if file lacks directive.
    /// - Return [`DraftError::Backup`] if backup cannot be made.
    /// - Return [`DraftError::Write`] if file cannot be written.
    pub fn edit<E>(&self, editor: E) -> Result<bool>
    where
        E: FnOnce(&mut TokenList),
    {
        let content = read_to_string(&self.path).map_err(|err| DraftError::Read {
            source: err,
            path: self.path.clone(),
        })?;

        let mut document = ArrayDocument::parse(&content, &self.key);
        let Some(tokens) = document.tokens_mut() else {
            return Err(DraftError::MissingDirective {
                key: self.key.clone(),
                path: self.path.clone(),
            });
        };

        editor(tokens);
        if !tokens.is_changed() {
            debug!("{} in {:?} unchanged", self.key, self.path.display());
            return Ok(false);
        }

        backup_file(&self.path)?;
        write(&self.path, document.to_string()).map_err(|err| DraftError::Write {
            source: err,
            path: self.path.clone(),
        })?;
        info!("rewrote {} in {:?}", self.key, self.path.display());

        Ok(true)
    }
}

/// Copy file to a timestamped backup next to it.
///
/// Returns the backup's path, or `None` if there was nothing to back up.
///
/// # Errors
///
/// - Return [`DraftError::Backup`] if file cannot be copied.
pub fn backup_file(path: impl AsRef<Path>) -> Result<Option<PathBuf>> {
    let path = path.as_ref();
    if !path.is_file() {
        return Ok(None);
    }

    let stamp = Local::now().format("%Y%m%dT%H%M%S").to_string();
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    // INVARIANT: Never overwrite an earlier backup taken in the same second.
    let mut backup = path.with_file_name(format!("{name}.{stamp}.bak"));
    let mut counter = 1;
    while backup.exists() {
        backup = path.with_file_name(format!("{name}.{stamp}.{counter}.bak"));
        counter += 1;
    }

    copy(path, &backup).map_err(|err| DraftError::Backup {
        source: err,
        path: path.to_path_buf(),
    })?;
    info!("backed up {:?} to {:?}", path.display(), backup.display());

    Ok(Some(backup))
}

/// Write file, creating parent directories and backing up prior content.
///
/// # Errors
///
/// - Return [`DraftError::CreateDir`] if parent directories cannot be made.
/// - Return [`DraftError::Backup`] if backup cannot be made.
/// - Return [`DraftError::Write`] if file cannot be written.
pub fn write_managed(path: impl AsRef<Path>, contents: impl AsRef<str>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        mkdirp::mkdirp(parent).map_err(|err| DraftError::CreateDir {
            source: err,
            path: parent.to_path_buf(),
        })?;
    }

    backup_file(path)?;
    write(path, contents.as_ref()).map_err(|err| DraftError::Write {
        source: err,
        path: path.to_path_buf(),
    })?;

    Ok(())
}

/// Configuration drafting error types.
#[derive(Debug, thiserror::Error)]
pub enum DraftError {
    /// Configuration file cannot be read.
    #[error("failed to read {:?}", path.display())]
    Read {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Configuration file cannot be written.
    #[error("failed to write {:?}", path.display())]
    Write {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Configuration file cannot be backed up.
    #[error("failed to back up {:?}", path.display())]
    Backup {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Parent directory of configuration file cannot be created.
    #[error("failed to create directory {:?}", path.display())]
    CreateDir {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Configuration file has no such directive.
    #[error("no {key}=(...) directive in {:?}", path.display())]
    MissingDirective { key: String, path: PathBuf },
}

/// Friendly result alias :3
pub type Result<T, E = DraftError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;
    use std::fs::read_dir;

    const MKINITCPIO: &str = indoc! {r#"
        # vim:set ft=sh
        MODULES=()
        BINARIES=()
        FILES=()
        #HOOKS=(base udev)
        HOOKS=(base udev autodetect modconf block filesystems keyboard fsck)
        COMPRESSION="zstd"
    "#};

    fn before(anchor: &str) -> Placement {
        Placement::Before(anchor.into())
    }

    #[test_case("base udev keyboard zfs filesystems", ProbeResult::PresentCorrect; "right before anchor")]
    #[test_case("base udev keyboard filesystems", ProbeResult::Absent; "missing")]
    #[test_case("base zfs udev filesystems", ProbeResult::PresentIncorrect("zfs is not immediately before filesystems".into()); "misplaced")]
    #[test_case("base zfs filesystems zfs", ProbeResult::PresentIncorrect("zfs is listed 2 times".into()); "duplicated")]
    #[test_case("base udev zfs", ProbeResult::PresentCorrect; "anchor missing")]
    #[test]
    fn token_list_classify(tokens: &str, expect: ProbeResult) {
        let list = TokenList::new(tokens.split_whitespace());
        pretty_assertions::assert_eq!(list.classify("zfs", &before("filesystems")), expect);
    }

    #[test]
    fn token_list_place_inserts_exactly_once() {
        let mut list = TokenList::new(["base", "udev", "block", "filesystems", "fsck"]);

        list.place("zfs", &before("filesystems"));
        list.place("zfs", &before("filesystems"));
        list.place("zfs", &before("filesystems"));

        assert_eq!(list.tokens(), ["base", "udev", "block", "zfs", "filesystems", "fsck"]);
        assert!(list.is_changed());
    }

    #[test]
    fn token_list_place_moves_misplaced_token() {
        let mut list = TokenList::new(["base", "zfs", "udev", "filesystems", "zfs"]);
        list.place("zfs", &before("filesystems"));
        assert_eq!(list.tokens(), ["base", "udev", "zfs", "filesystems"]);
    }

    #[test]
    fn token_list_place_appends() {
        let mut list = TokenList::new(["nvidia", "nvidia_modeset"]);
        list.place("nvidia_modeset", &Placement::Append);
        assert!(!list.is_changed());

        list.place("nvidia_drm", &Placement::Append);
        assert_eq!(list.tokens(), ["nvidia", "nvidia_modeset", "nvidia_drm"]);
        assert!(list.is_changed());
    }

    #[test]
    fn array_document_rewrites_only_directive() {
        let mut document = ArrayDocument::parse(MKINITCPIO, "HOOKS");
        assert_eq!(
            document.tokens().map(|tokens| tokens.tokens().join(" ")),
            Some("base udev autodetect modconf block filesystems keyboard fsck".to_string())
        );

        if let Some(tokens) = document.tokens_mut() {
            tokens.place("zfs", &before("filesystems"));
        }

        let expect = indoc! {r#"
            # vim:set ft=sh
            MODULES=()
            BINARIES=()
            FILES=()
            #HOOKS=(base udev)
            HOOKS=(base udev autodetect modconf block zfs filesystems keyboard fsck)
            COMPRESSION="zstd"
        "#};
        assert_eq!(document.to_string(), expect);
    }

    #[test]
    fn array_document_collapses_multiline_directive() {
        let content = indoc! {r#"
            HOOKS=(base
                   udev
                   filesystems) # trailing note
            COMPRESSION="zstd"
        "#};
        let mut document = ArrayDocument::parse(content, "HOOKS");
        if let Some(tokens) = document.tokens_mut() {
            tokens.place("zfs", &before("filesystems"));
        }

        let expect = indoc! {r#"
            HOOKS=(base udev zfs filesystems) # trailing note
            COMPRESSION="zstd"
        "#};
        assert_eq!(document.to_string(), expect);
    }

    #[test]
    fn array_document_without_directive() {
        let document = ArrayDocument::parse("# nothing here\n", "HOOKS");
        assert_eq!(document.tokens(), None);
        assert_eq!(document.to_string(), "# nothing here\n");
    }

    #[test]
    fn array_drafter_edits_with_backup() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mkinitcpio.conf");
        write(&path, MKINITCPIO)?;
        let drafter = ArrayDrafter::new(&path, "HOOKS");

        assert!(drafter.edit(|tokens| tokens.place("zfs", &before("filesystems")))?);
        assert!(!drafter.edit(|tokens| tokens.place("zfs", &before("filesystems")))?);

        let tokens = drafter.current()?.unwrap_or_default();
        assert_eq!(tokens.classify("zfs", &before("filesystems")), ProbeResult::PresentCorrect);

        let backups = read_dir(dir.path())?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".bak"))
            .map(|entry| read_to_string(entry.path()))
            .collect::<std::io::Result<Vec<_>>>()?;
        assert_eq!(backups, vec![MKINITCPIO.to_string()]);

        Ok(())
    }

    #[test]
    fn array_drafter_tolerates_missing_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let drafter = ArrayDrafter::new(dir.path().join("etc/mkinitcpio.conf"), "HOOKS");

        assert_eq!(drafter.current()?, None);
        assert!(matches!(
            drafter.edit(|_| {}),
            Err(DraftError::Read { .. })
        ));

        Ok(())
    }

    #[test]
    fn backup_file_never_clobbers() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("loader.conf");
        write(&path, "timeout 3\n")?;

        let first = backup_file(&path)?;
        let second = backup_file(&path)?;
        assert!(first.is_some());
        assert!(second.is_some());
        assert_ne!(first, second);
        assert_eq!(backup_file(dir.path().join("missing.conf"))?, None);

        Ok(())
    }
}
