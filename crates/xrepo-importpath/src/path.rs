//! Import path syntax helpers.

use crate::error::{Error, Result};

/// Reject import paths that cannot name a package.
pub(crate) fn validate(import_path: &str) -> Result<()> {
    if import_path.is_empty() {
        return Err(Error::invalid(import_path, "empty import path"));
    }
    if import_path.contains("://") {
        return Err(Error::invalid(import_path, "import paths carry no scheme"));
    }
    if import_path.starts_with('/') || import_path.ends_with('/') {
        return Err(Error::invalid(import_path, "leading or trailing slash"));
    }
    if let Some(c) = import_path.chars().find(|c| {
        c.is_whitespace() || c.is_control() || matches!(c, '"' | '\'' | '`' | '\\' | '?' | '#')
    }) {
        return Err(Error::invalid(
            import_path,
            format!("disallowed character {c:?}"),
        ));
    }
    for segment in import_path.split('/') {
        match segment {
            "" => return Err(Error::invalid(import_path, "empty path segment")),
            "." | ".." => return Err(Error::invalid(import_path, "relative path segment")),
            _ => {}
        }
    }
    Ok(())
}

/// Whether `root` is `path` or a whole-segment prefix of it.
pub(crate) fn has_segment_prefix(path: &str, root: &str) -> bool {
    path.strip_prefix(root)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// Every prefix of `import_path` ending on a segment boundary, longest first.
pub(crate) fn prefixes(import_path: &str) -> impl Iterator<Item = &str> {
    let mut end = Some(import_path.len());
    std::iter::from_fn(move || {
        let current = end?;
        let prefix = &import_path[..current];
        end = prefix.rfind('/');
        Some(prefix)
    })
}

/// The part of `import_path` below `root`, without the leading slash.
pub(crate) fn remainder<'a>(import_path: &'a str, root: &str) -> &'a str {
    import_path
        .strip_prefix(root)
        .map_or("", |rest| rest.trim_start_matches('/'))
}
