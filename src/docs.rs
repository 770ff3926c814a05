//! Documentation scanning for the cross-reference gate and the cascade.
//!
//! Terms are derived from the changed paths (full path, file name and, for
//! longer names, the stem). Every documentation file under the configured
//! roots is searched for those terms and ranked by hit count.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::vcs::{ChangeKind, ChangedFile};
use crate::Result;

/// Extensions treated as documentation.
const DOC_EXTENSIONS: &[&str] = &["md", "markdown", "mdx", "rst", "txt", "adoc"];

/// Directories never descended into.
const SKIP_DIRS: &[&str] = &[".git", "target", "node_modules", "vendor", "dist", "build"];

/// Stems shorter than this are too generic to search for on their own.
const MIN_STEM_LEN: usize = 6;

/// Path-like tokens in prose: `src/foo.rs`, `docs/guide.md`.
static PATH_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9_.\-]+(?:/[A-Za-z0-9_.\-]+)+").unwrap());

/// A document that mentions something the change touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocCandidate {
    /// Path relative to the environment root.
    pub path: String,
    pub score: usize,
    /// Terms found, most frequent first.
    pub terms: Vec<String>,
}

impl std::fmt::Display for DocCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} hits: {})", self.path, self.score, self.terms.join(", "))
    }
}

/// Search terms for a set of changed files.
pub fn terms_for(changed: &[ChangedFile]) -> Vec<String> {
    let mut terms = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |t: &str| {
        if !t.is_empty() && seen.insert(t.to_string()) {
            terms.push(t.to_string());
        }
    };
    for file in changed {
        let mut paths = vec![file.path.as_str()];
        if let ChangeKind::Renamed { from } = &file.kind {
            paths.push(from.as_str());
        }
        for path in paths {
            push(path);
            let p = Path::new(path);
            if let Some(name) = p.file_name().and_then(|n| n.to_str()) {
                push(name);
            }
            if let Some(stem) = p.file_stem().and_then(|s| s.to_str()) {
                if stem.len() >= MIN_STEM_LEN {
                    push(stem);
                }
            }
        }
    }
    terms
}

fn is_doc_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| DOC_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>, seen: &mut HashSet<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            if name.starts_with('.') || SKIP_DIRS.contains(&name.as_ref()) {
                continue;
            }
            walk(&path, out, seen);
        } else if file_type.is_file() && is_doc_file(&path) && seen.insert(path.clone()) {
            out.push(path);
        }
    }
}

/// Documentation files under `roots` (relative to `root`), in a stable order.
pub fn doc_files(root: &Path, roots: &[String]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut seen = HashSet::new();
    for sub in roots {
        let dir = if sub == "." {
            root.to_path_buf()
        } else {
            root.join(sub)
        };
        if dir.is_dir() {
            walk(&dir, &mut files, &mut seen);
        }
    }
    files.sort();
    files
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
        .trim_start_matches("./")
        .to_string()
}

/// A search term and its whole-token pattern, compiled once per scan.
struct TermPattern {
    term: String,
    re: Option<Regex>,
}

impl TermPattern {
    fn new(term: &str) -> Self {
        let pattern = format!(r"(?:^|[^A-Za-z0-9_\-/]){}(?:$|[^A-Za-z0-9_\-])", regex::escape(term));
        Self {
            term: term.to_string(),
            re: Regex::new(&pattern).ok(),
        }
    }

    /// Whole-token occurrences in `content`.
    fn count(&self, content: &str) -> usize {
        match &self.re {
            Some(re) => re.find_iter(content).count(),
            None => content.matches(self.term.as_str()).count(),
        }
    }
}

/// Rank documentation under `roots` by references to the changed files.
///
/// Documents that are part of the change themselves are skipped.
pub fn scan(
    root: &Path,
    roots: &[String],
    changed: &[ChangedFile],
    max_candidates: usize,
) -> Result<Vec<DocCandidate>> {
    let patterns: Vec<TermPattern> = terms_for(changed)
        .iter()
        .map(|t| TermPattern::new(t))
        .collect();
    if patterns.is_empty() {
        return Ok(Vec::new());
    }
    let changed_paths: HashSet<&str> = changed.iter().map(|c| c.path.as_str()).collect();

    let mut candidates = Vec::new();
    for file in doc_files(root, roots) {
        let rel = relative(root, &file);
        if changed_paths.contains(rel.as_str()) {
            continue;
        }
        let content = match std::fs::read_to_string(&file) {
            Ok(content) => content,
            Err(e) => {
                trace!(file = %file.display(), error = %e, "skipping unreadable doc");
                continue;
            }
        };

        let mut hits: BTreeMap<&str, usize> = BTreeMap::new();
        for pattern in &patterns {
            let n = pattern.count(&content);
            if n > 0 {
                hits.insert(pattern.term.as_str(), n);
            }
        }
        if hits.is_empty() {
            continue;
        }

        let mut ranked: Vec<(&str, usize)> = hits.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        candidates.push(DocCandidate {
            path: rel,
            score: ranked.iter().map(|(_, n)| n).sum(),
            terms: ranked.into_iter().map(|(t, _)| t.to_string()).collect(),
        });
    }

    candidates.sort_by(|a, b| b.score.cmp(&a.score).then(a.path.cmp(&b.path)));
    candidates.truncate(max_candidates);
    debug!(count = candidates.len(), "documentation candidates");
    Ok(candidates)
}

/// Path-like tokens mentioned in a document.
pub fn path_references(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    PATH_TOKEN_RE
        .find_iter(content)
        .map(|m| m.as_str().trim_end_matches('.').to_string())
        .filter(|p| seen.insert(p.clone()))
        .collect()
}

/// Replace whole-token occurrences of the path `from` with `to`.
///
/// Returns the new content and the number of replacements.
pub fn rewrite_path(content: &str, from: &str, to: &str) -> (String, usize) {
    let pattern = format!(r"(^|[^A-Za-z0-9_\-/]){}($|[^A-Za-z0-9_\-])", regex::escape(from));
    let Ok(re) = Regex::new(&pattern) else {
        return (content.to_string(), 0);
    };
    let count = re.find_iter(content).count();
    if count == 0 {
        return (content.to_string(), 0);
    }
    let replaced = re.replace_all(content, |caps: &regex::Captures<'_>| {
        format!("{}{}{}", &caps[1], to, &caps[2])
    });
    (replaced.into_owned(), count)
}
