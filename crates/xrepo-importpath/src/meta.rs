//! `<meta name="go-import">` discovery tag parsing.
//!
//! Only the document head is relevant: scanning stops at `</head>` or at the
//! opening `<body>` tag, whichever comes first. The scanner is lenient in the
//! way browsers are. Unterminated tags end the scan, unknown tags are
//! skipped, and attribute names are case-insensitive.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

use crate::path::has_segment_prefix;

/// The `name` attribute value that marks a discovery tag.
pub const GO_IMPORT: &str = "go-import";

static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_:][-A-Za-z0-9_:.]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#)
        .expect("attribute pattern is a valid regex")
});

/// One `ROOT VCS REPO-URL` triple declared by a discovery tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetaImport {
    /// Import path prefix the repository owns.
    pub root: String,
    /// Version control system name.
    pub vcs: String,
    /// Repository URL.
    pub repo_url: String,
}

impl fmt::Display for MetaImport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.root, self.vcs, self.repo_url)
    }
}

/// Outcome of choosing among the tags of one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// No tag applies to the requested path.
    None,
    /// Exactly one distinct triple claims the longest matching root.
    One(MetaImport),
    /// Several distinct triples claim the longest matching root.
    Ambiguous(Vec<MetaImport>),
}

/// Parse the head of `html` and pick the discovery tag for `import_path`.
///
/// Tags with the wrong number of fields, empty content, or a root that is
/// not a whole-segment prefix of `import_path` are ignored. Identical
/// duplicates count once.
#[must_use]
pub fn select(html: &str, import_path: &str) -> Selection {
    let mut matching: Vec<MetaImport> = Vec::new();
    for tag in head_go_imports(html) {
        if has_segment_prefix(import_path, &tag.root) && !matching.contains(&tag) {
            matching.push(tag);
        }
    }

    let Some(longest) = matching.iter().map(|t| t.root.len()).max() else {
        return Selection::None;
    };
    matching.retain(|t| t.root.len() == longest);

    if matching.len() == 1 {
        Selection::One(matching.remove(0))
    } else {
        Selection::Ambiguous(matching)
    }
}

/// All well-formed `go-import` tags found in the document head, in order.
#[must_use]
pub fn head_go_imports(html: &str) -> Vec<MetaImport> {
    let mut found = Vec::new();
    let mut rest = html;

    while let Some(open) = rest.find('<') {
        rest = &rest[open + 1..];

        if let Some(comment) = rest.strip_prefix("!--") {
            match comment.find("-->") {
                Some(end) => {
                    rest = &comment[end + 3..];
                    continue;
                }
                None => break,
            }
        }

        let Some(end) = tag_end(rest) else { break };
        let tag = &rest[..end];
        rest = &rest[end + 1..];

        let (closing, body) = match tag.strip_prefix('/') {
            Some(body) => (true, body),
            None => (false, tag),
        };
        let name_len = body
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(body.len());
        let name = &body[..name_len];

        if closing {
            if name.eq_ignore_ascii_case("head") {
                break;
            }
            continue;
        }
        if name.eq_ignore_ascii_case("body") {
            break;
        }
        if !name.eq_ignore_ascii_case("meta") {
            continue;
        }

        if let Some(tag) = parse_meta(&body[name_len..]) {
            found.push(tag);
        }
    }

    found
}

/// Index of the `>` closing a tag, skipping quoted attribute values.
fn tag_end(tag: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (idx, c) in tag.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '>') => return Some(idx),
            (None, _) => {}
        }
    }
    None
}

fn parse_meta(attributes: &str) -> Option<MetaImport> {
    let mut name = None;
    let mut content = None;

    for caps in ATTRIBUTE.captures_iter(attributes) {
        let key = caps[1].to_ascii_lowercase();
        let value = caps
            .get(2)
            .or_else(|| caps.get(3))
            .or_else(|| caps.get(4))
            .map_or(String::new(), |m| unescape(m.as_str()));
        match key.as_str() {
            "name" => name = Some(value),
            "content" => content = Some(value),
            _ => {}
        }
    }

    if name.as_deref() != Some(GO_IMPORT) {
        return None;
    }
    let content = content?;
    let fields: Vec<&str> = content.split_whitespace().collect();
    let [root, vcs, repo_url] = fields.as_slice() else {
        return None;
    };
    Some(MetaImport {
        root: (*root).to_string(),
        vcs: (*vcs).to_string(),
        repo_url: (*repo_url).to_string(),
    })
}

/// Decode the handful of character references that appear in URLs.
fn unescape(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&quot;", "\"")
        .replace("&#34;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
