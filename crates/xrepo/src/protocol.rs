//! Request and response shapes exchanged with proxy clients.
//!
//! Client positions are LSP positions (0-based line and character) inside
//! documents named by repository URIs such as
//! `git://github.com/gorilla/mux?0a192a19#mux.go`.

use lsp_types::{
    HoverContents, HoverProviderCapability, InitializeResult, OneOf, Position, Range,
    ServerCapabilities, ServerInfo,
};
use serde::{Deserialize, Serialize};

use crate::error::ProxyError;
use crate::rewrite::Location;
use crate::uri::RepoUri;

/// Parameters of `initialize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Language mode, e.g. `go`.
    pub mode: String,
    /// Workspace root, e.g. `git://github.com/golang/go?go1.7.1`.
    pub root_uri: RepoUri,
}

/// Capabilities advertised in reply to `initialize`.
#[must_use]
pub fn initialize_result() -> InitializeResult {
    InitializeResult {
        capabilities: ServerCapabilities {
            definition_provider: Some(OneOf::Left(true)),
            hover_provider: Some(HoverProviderCapability::Simple(true)),
            ..Default::default()
        },
        server_info: Some(ServerInfo {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }),
    }
}

/// A document reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextDocument {
    /// Fully qualified file URI.
    pub uri: RepoUri,
}

/// Parameters of `textDocument/definition` and `textDocument/hover`.
///
/// The document is named either by `textDocument.uri` or by a `path`
/// relative to the session's workspace root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionParams {
    /// The document, fully qualified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_document: Option<TextDocument>,
    /// The document, relative to the workspace root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// 0-based position.
    pub position: Position,
}

impl PositionParams {
    /// Params naming `uri` at `line`/`character`.
    #[must_use]
    pub fn new(uri: RepoUri, line: u32, character: u32) -> Self {
        Self {
            text_document: Some(TextDocument { uri }),
            path: None,
            position: Position::new(line, character),
        }
    }

    /// The fully qualified document, resolving `path` against `root`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::InvalidInput`] if neither form names a file.
    pub fn document(&self, root: &RepoUri) -> Result<RepoUri, ProxyError> {
        match (&self.text_document, &self.path) {
            (Some(doc), _) => Ok(doc.uri.clone()),
            (None, Some(path)) if !path.trim_matches('/').is_empty() => {
                Ok(root.with_path(path.as_str()))
            }
            _ => Err(ProxyError::InvalidInput(
                "textDocument.uri or path is required".to_string(),
            )),
        }
    }
}

/// A definition location as sent to clients: the file URI plus a 0-based
/// range collapsed onto the definition's start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireLocation {
    /// `repository?revision#path`.
    pub uri: RepoUri,
    /// 0-based range.
    pub range: Range,
}

impl TryFrom<&Location> for WireLocation {
    type Error = ProxyError;

    fn try_from(location: &Location) -> Result<Self, Self::Error> {
        let start = Position::new(
            location.line.saturating_sub(1),
            location.column.saturating_sub(1),
        );
        Ok(Self {
            uri: location.uri()?,
            range: Range::new(start, start),
        })
    }
}

/// Result of `textDocument/hover`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoverResult {
    /// Hover text as produced by the backend.
    pub contents: HoverContents,
    /// Range the hover applies to, in the requested document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,
    /// Where the symbol under the cursor is defined, possibly in another
    /// repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<WireLocation>,
}
