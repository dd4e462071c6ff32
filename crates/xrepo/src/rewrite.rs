//! Conversion between fully qualified locations and backend-local positions.
//!
//! Two coordinate conventions meet here:
//!
//! - A [`Location`] leaves the proxy fully qualified, with a **1-based line
//!   and 1-based column**, and renders as
//!   `git://github.com/golang/go?go1.7.1#src/bytes/buffer.go:17:6`.
//! - A [`LocalPosition`] is what a pooled backend understands: a
//!   workspace-relative path with a **0-based line and 0-based character**
//!   (UTF-16 code units), exactly as the language server protocol counts.
//!
//! [`Rewriter::to_global`] and [`Rewriter::to_local`] are inverses for any
//! position inside the rewriter's workspace.

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::uri::{RepoUri, UriError};

/// Characters escaped in the path component of a backend-local file URI.
const PATH_ESCAPES: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Errors from location rewriting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RewriteError {
    /// The location belongs to a different repository or revision.
    #[error("location {location} is outside workspace {workspace}")]
    WorkspaceMismatch {
        /// The rejected location.
        location: String,
        /// The rewriter's workspace root.
        workspace: String,
    },

    /// A line or column is out of range for its convention.
    #[error("invalid position: {0}")]
    InvalidPosition(String),

    /// A backend-local file URI could not be interpreted.
    #[error("invalid backend file URI {0:?}")]
    InvalidFileUri(String),

    /// A qualified location string could not be parsed.
    #[error("invalid location {0:?}")]
    InvalidLocation(String),

    /// The embedded repository URI is malformed.
    #[error(transparent)]
    Uri(#[from] UriError),
}

/// A fully qualified source position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    /// `scheme://repository`, e.g. `git://github.com/golang/go`.
    pub repository: String,
    /// Revision, or `None` for the default branch.
    pub revision: Option<String>,
    /// Repository-relative file path.
    pub path: String,
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub column: u32,
}

impl Location {
    /// The file URI (`repository?revision#path`) of this location.
    ///
    /// # Errors
    ///
    /// Returns an error if `repository` is not a valid repository URI.
    pub fn uri(&self) -> Result<RepoUri, RewriteError> {
        let root: RepoUri = self.repository.parse()?;
        Ok(root
            .with_revision(self.revision.clone())
            .with_path(self.path.clone()))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repository)?;
        if let Some(revision) = &self.revision {
            write!(f, "?{revision}")?;
        }
        write!(f, "#{}:{}:{}", self.path, self.line, self.column)
    }
}

impl FromStr for Location {
    type Err = RewriteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RewriteError::InvalidLocation(s.to_string());
        let (rest, column) = s.rsplit_once(':').ok_or_else(invalid)?;
        let (uri, line) = rest.rsplit_once(':').ok_or_else(invalid)?;
        let line: u32 = line.parse().map_err(|_| invalid())?;
        let column: u32 = column.parse().map_err(|_| invalid())?;
        if line == 0 || column == 0 {
            return Err(invalid());
        }

        let uri: RepoUri = uri.parse()?;
        let path = uri.path().ok_or_else(invalid)?.to_string();
        Ok(Self {
            repository: uri.repository_id(),
            revision: uri.revision().map(str::to_string),
            path,
            line,
            column,
        })
    }
}

/// A position as seen by one backend connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalPosition {
    /// Workspace-relative file path.
    pub path: String,
    /// 0-based line.
    pub line: u32,
    /// 0-based character offset in UTF-16 code units.
    pub character: u32,
}

impl LocalPosition {
    /// A position at `line`/`character` in `path`.
    #[must_use]
    pub fn new(path: impl Into<String>, line: u32, character: u32) -> Self {
        Self {
            path: path.into(),
            line,
            character,
        }
    }
}

/// Rewrites positions for one workspace.
#[derive(Debug, Clone)]
pub struct Rewriter {
    root: RepoUri,
}

impl Rewriter {
    /// A rewriter for the workspace rooted at `root` (any path is dropped).
    #[must_use]
    pub fn new(root: &RepoUri) -> Self {
        Self { root: root.root() }
    }

    /// The workspace root this rewriter qualifies against.
    #[must_use]
    pub fn root(&self) -> &RepoUri {
        &self.root
    }

    /// Qualify a backend-local position.
    ///
    /// # Errors
    ///
    /// Returns [`RewriteError::InvalidPosition`] when the line or character
    /// has no 1-based counterpart.
    pub fn to_global(&self, local: &LocalPosition) -> Result<Location, RewriteError> {
        let one_based = |value: u32, what: &str| {
            value.checked_add(1).ok_or_else(|| {
                RewriteError::InvalidPosition(format!("{what} {value} of {} overflows", local.path))
            })
        };
        Ok(Location {
            repository: self.root.repository_id(),
            revision: self.root.revision().map(str::to_string),
            path: local.path.trim_start_matches('/').to_string(),
            line: one_based(local.line, "line")?,
            column: one_based(local.character, "character")?,
        })
    }

    /// Localize a qualified location into this workspace.
    ///
    /// # Errors
    ///
    /// Returns [`RewriteError::WorkspaceMismatch`] for a location in another
    /// repository or revision, or [`RewriteError::InvalidPosition`] for a zero
    /// line or column.
    pub fn to_local(&self, location: &Location) -> Result<LocalPosition, RewriteError> {
        if location.repository != self.root.repository_id()
            || location.revision.as_deref() != self.root.revision()
        {
            return Err(RewriteError::WorkspaceMismatch {
                location: location.to_string(),
                workspace: self.root.to_string(),
            });
        }
        if location.line == 0 || location.column == 0 {
            return Err(RewriteError::InvalidPosition(format!(
                "{location} uses 1-based line and column"
            )));
        }
        Ok(LocalPosition {
            path: location.path.clone(),
            line: location.line - 1,
            character: location.column - 1,
        })
    }

    /// Localize a client request: a file URI in this workspace plus an LSP
    /// position.
    ///
    /// # Errors
    ///
    /// Returns [`RewriteError::WorkspaceMismatch`] when `uri` is not inside
    /// this workspace, or [`RewriteError::InvalidPosition`] when it names no
    /// file.
    pub fn request_to_local(
        &self,
        uri: &RepoUri,
        line: u32,
        character: u32,
    ) -> Result<LocalPosition, RewriteError> {
        if !self.root.same_workspace(uri) {
            return Err(RewriteError::WorkspaceMismatch {
                location: uri.to_string(),
                workspace: self.root.to_string(),
            });
        }
        let path = uri
            .path()
            .ok_or_else(|| RewriteError::InvalidPosition(format!("{uri} names no file")))?;
        Ok(LocalPosition::new(path, line, character))
    }

    /// Convert a raw byte span reported by a backend into a local position
    /// at the span's start.
    ///
    /// # Errors
    ///
    /// Returns [`RewriteError::InvalidPosition`] if the span lies outside
    /// `text` or splits a character.
    pub fn span_to_local(
        path: &str,
        text: &str,
        offset: usize,
        length: usize,
    ) -> Result<LocalPosition, RewriteError> {
        let end = offset.checked_add(length).filter(|end| *end <= text.len());
        if end.is_none() {
            return Err(RewriteError::InvalidPosition(format!(
                "span {offset}+{length} exceeds {path} ({} bytes)",
                text.len()
            )));
        }
        let (line, character) = LineIndex::new(text).position(offset)?;
        Ok(LocalPosition::new(path, line, character))
    }
}

/// The `file:///relative/path` URI a backend uses for a workspace file.
#[must_use]
pub fn local_file_uri(path: &str) -> String {
    format!(
        "file:///{}",
        utf8_percent_encode(path.trim_start_matches('/'), PATH_ESCAPES)
    )
}

/// The workspace-relative path named by a backend-local file URI.
///
/// # Errors
///
/// Returns [`RewriteError::InvalidFileUri`] for anything but a `file://` URI.
pub fn path_from_local_uri(uri: &str) -> Result<String, RewriteError> {
    let rest = uri
        .strip_prefix("file://")
        .ok_or_else(|| RewriteError::InvalidFileUri(uri.to_string()))?;
    let decoded = percent_decode_str(rest)
        .decode_utf8()
        .map_err(|_| RewriteError::InvalidFileUri(uri.to_string()))?;
    let path = decoded.trim_start_matches('/');
    if path.is_empty() {
        return Err(RewriteError::InvalidFileUri(uri.to_string()));
    }
    Ok(path.to_string())
}

/// Maps byte offsets in a text to 0-based line/UTF-16 character positions.
#[derive(Debug, Clone)]
pub struct LineIndex<'a> {
    text: &'a str,
    line_starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    /// Index the line starts of `text`.
    #[must_use]
    pub fn new(text: &'a str) -> Self {
        let line_starts = std::iter::once(0)
            .chain(text.match_indices('\n').map(|(idx, _)| idx + 1))
            .collect();
        Self { text, line_starts }
    }

    /// Number of lines (a trailing newline opens an empty last line).
    #[must_use]
    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    /// The 0-based line and character of byte `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`RewriteError::InvalidPosition`] if `offset` is past the end
    /// or not on a character boundary.
    pub fn position(&self, offset: usize) -> Result<(u32, u32), RewriteError> {
        if offset > self.text.len() || !self.text.is_char_boundary(offset) {
            return Err(RewriteError::InvalidPosition(format!(
                "byte offset {offset} is not a character boundary"
            )));
        }
        let line = self.line_starts.partition_point(|start| *start <= offset) - 1;
        let character = self.text[self.line_starts[line]..offset]
            .encode_utf16()
            .count();
        Ok((to_u32(line)?, to_u32(character)?))
    }

    /// The byte offset of 0-based `line` and UTF-16 `character`.
    ///
    /// # Errors
    ///
    /// Returns [`RewriteError::InvalidPosition`] if the line does not exist or
    /// the character runs past the end of the line.
    pub fn offset(&self, line: u32, character: u32) -> Result<usize, RewriteError> {
        let out_of_range =
            || RewriteError::InvalidPosition(format!("{line}:{character} is out of range"));
        let start = *self
            .line_starts
            .get(line as usize)
            .ok_or_else(out_of_range)?;
        let end = self
            .line_starts
            .get(line as usize + 1)
            .map_or(self.text.len(), |next| next - 1);

        let mut units = 0u32;
        for (idx, c) in self.text[start..end].char_indices() {
            if units == character {
                return Ok(start + idx);
            }
            units += u32::try_from(c.len_utf16()).map_err(|_| out_of_range())?;
            if units > character {
                return Err(out_of_range());
            }
        }
        if units == character {
            Ok(end)
        } else {
            Err(out_of_range())
        }
    }
}

fn to_u32(n: usize) -> Result<u32, RewriteError> {
    u32::try_from(n).map_err(|_| RewriteError::InvalidPosition(format!("{n} overflows u32")))
}
