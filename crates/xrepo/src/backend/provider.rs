//! Language server providers: how to launch a server and how to recognise
//! definitions that live outside the workspace.

use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// Configures one kind of language server.
pub trait LspProvider: Send + Sync {
    /// The command to spawn (e.g. `gopls`).
    fn command(&self) -> &str;

    /// Additional command-line arguments for the server.
    fn args(&self) -> Vec<&str> {
        vec![]
    }

    /// Language identifier sent with `textDocument/didOpen`.
    fn language_id(&self) -> &str;

    /// Passed in the `initializationOptions` field of `InitializeParams`.
    fn initialize_options(&self) -> Option<Value> {
        None
    }

    /// Installation hint shown when the server is not found.
    fn install_hint(&self) -> &str {
        "Please install the language server and ensure it's in your PATH."
    }

    /// The package whose source file is at `path`, when that file lies
    /// outside the workspace in a location the server indexes (a toolchain
    /// or dependency cache).
    fn external_package(&self, _path: &Path) -> Option<ExternalPackage> {
        None
    }
}

/// A package outside the workspace that a definition landed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalPackage {
    /// Import path, e.g. `github.com/gorilla/securecookie`.
    pub package: String,
    /// Revision of the copy the server read, when the location encodes one.
    pub revision: Option<String>,
}

impl ExternalPackage {
    /// A package with no known revision.
    #[must_use]
    pub fn unversioned(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            revision: None,
        }
    }
}

/// A provider assembled from configuration, with no knowledge of external
/// package layouts.
#[derive(Debug, Clone)]
pub struct ConfiguredProvider {
    command: String,
    args: Vec<String>,
    language_id: String,
}

impl ConfiguredProvider {
    /// A provider spawning `command` with `args`.
    #[must_use]
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        language_id: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            language_id: language_id.into(),
        }
    }
}

impl LspProvider for ConfiguredProvider {
    fn command(&self) -> &str {
        &self.command
    }

    fn args(&self) -> Vec<&str> {
        self.args.iter().map(String::as_str).collect()
    }

    fn language_id(&self) -> &str {
        &self.language_id
    }
}

/// Provider for `gopls`.
///
/// Definitions that land in `$GOROOT/src` or the module cache are reported as
/// external packages so the proxy can follow them into their own repository.
#[derive(Debug, Clone)]
pub struct GoplsProvider {
    command: String,
    args: Vec<String>,
    goroot: Option<PathBuf>,
    module_cache: Option<PathBuf>,
}

impl Default for GoplsProvider {
    fn default() -> Self {
        Self {
            command: "gopls".to_string(),
            args: Vec::new(),
            goroot: None,
            module_cache: None,
        }
    }
}

impl GoplsProvider {
    /// Override the command and arguments.
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>, args: Vec<String>) -> Self {
        self.command = command.into();
        self.args = args;
        self
    }

    /// Set the toolchain root and module cache used to recognise external
    /// files.
    #[must_use]
    pub fn with_roots(mut self, goroot: Option<PathBuf>, module_cache: Option<PathBuf>) -> Self {
        self.goroot = goroot;
        self.module_cache = module_cache;
        self
    }

    /// Ask the local Go toolchain for `GOROOT` and `GOMODCACHE`.
    ///
    /// Missing toolchains are not an error: the provider then reports no
    /// external packages.
    pub async fn detect(self) -> Self {
        let output = Command::new("go")
            .args(["env", "GOROOT", "GOMODCACHE"])
            .output()
            .await;
        match output {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let mut lines = stdout.lines().map(str::trim);
                let goroot = lines.next().filter(|l| !l.is_empty()).map(PathBuf::from);
                let module_cache = lines.next().filter(|l| !l.is_empty()).map(PathBuf::from);
                debug!(goroot = ?goroot, module_cache = ?module_cache, "Detected Go environment");
                self.with_roots(goroot, module_cache)
            }
            Ok(output) => {
                debug!(status = %output.status, "go env failed; external packages disabled");
                self
            }
            Err(e) => {
                debug!(error = %e, "go toolchain not available; external packages disabled");
                self
            }
        }
    }

    fn stdlib_package(&self, path: &Path) -> Option<ExternalPackage> {
        let rel = path.strip_prefix(self.goroot.as_ref()?.join("src")).ok()?;
        let dir = normal_components(rel.parent()?)?;
        (!dir.is_empty()).then(|| ExternalPackage::unversioned(dir.join("/")))
    }

    fn module_package(&self, path: &Path) -> Option<ExternalPackage> {
        let rel = path.strip_prefix(self.module_cache.as_ref()?).ok()?;
        let dir = normal_components(rel.parent()?)?;
        let versioned = dir.iter().position(|seg| seg.contains('@'))?;

        let mut segments: Vec<String> = dir[..versioned].to_vec();
        let (module_leaf, version) = dir[versioned].split_once('@')?;
        segments.push(module_leaf.to_string());
        segments.extend(dir[versioned + 1..].iter().cloned());

        // The cache spells upper-case letters as `!` + lower-case.
        Some(ExternalPackage {
            package: unescape_module_path(&segments.join("/")),
            revision: (!version.is_empty()).then(|| module_revision(version)),
        })
    }
}

/// The git revision a module version was built from.
///
/// Pseudo-versions (`v0.0.0-20191109021931-daa7c04131f5`) name a commit by
/// its 12-character prefix; any other version is a tag.
fn module_revision(version: &str) -> String {
    let version = version.strip_suffix("+incompatible").unwrap_or(version);
    if let Some((head, commit)) = version.rsplit_once('-') {
        let timestamp = head.rsplit(['-', '.']).next().unwrap_or_default();
        let is_commit = commit.len() == 12 && commit.bytes().all(|b| b.is_ascii_hexdigit());
        let is_timestamp = timestamp.len() == 14 && timestamp.bytes().all(|b| b.is_ascii_digit());
        if is_commit && is_timestamp {
            return commit.to_string();
        }
    }
    version.to_string()
}

impl LspProvider for GoplsProvider {
    fn command(&self) -> &str {
        &self.command
    }

    fn args(&self) -> Vec<&str> {
        self.args.iter().map(String::as_str).collect()
    }

    fn language_id(&self) -> &str {
        "go"
    }

    fn install_hint(&self) -> &str {
        "Install gopls: go install golang.org/x/tools/gopls@latest"
    }

    fn external_package(&self, path: &Path) -> Option<ExternalPackage> {
        self.stdlib_package(path)
            .or_else(|| self.module_package(path))
    }
}

fn normal_components(path: &Path) -> Option<Vec<String>> {
    path.components()
        .map(|c| match c {
            Component::Normal(s) => s.to_str().map(str::to_string),
            _ => None,
        })
        .collect()
}

fn unescape_module_path(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c == '!' {
            if let Some(next) = chars.next() {
                out.push(next.to_ascii_uppercase());
            }
        } else {
            out.push(c);
        }
    }
    out
}
