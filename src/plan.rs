//! Plan documents: parsing, validation and reference resolution.
//!
//! A plan is a TOML file (or JSON, chosen by extension) listing the tasks of
//! one unit of work. `run` accepts either a path to such a file or a tracking
//! reference / slug, which is resolved against the plans directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::util::sanitize_name;
use crate::{Error, Result};

/// Patterns matched against changed paths when the plan does not name any.
pub const DEFAULT_DOC_PATTERNS: &[&str] = &["docs/", ".md"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Derived from the file stem when the document does not set one.
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub tracking_reference: Option<String>,
    /// Branch the environment is created from; the repository HEAD when unset.
    #[serde(default)]
    pub base_branch: Option<String>,
    /// Role name to worker type.
    #[serde(default)]
    pub team_members: BTreeMap<String, String>,
    #[serde(default)]
    pub documentation: DocumentationPolicy,
    #[serde(default)]
    pub policy: FailurePolicy,
    #[serde(default)]
    pub tasks: Vec<TaskDef>,
    #[serde(skip)]
    pub source: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDef {
    pub id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub documentation_required: bool,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentationPolicy {
    /// Only an explicit `false` turns the documentation gate off.
    #[serde(default)]
    pub required: Option<bool>,
    /// Path fragments that count as documentation.
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl DocumentationPolicy {
    pub fn patterns(&self) -> Vec<String> {
        if self.patterns.is_empty() {
            DEFAULT_DOC_PATTERNS.iter().map(|p| p.to_string()).collect()
        } else {
            self.patterns.clone()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailurePolicy {
    /// Keep unaffected branches running after a required task fails.
    #[serde(default)]
    pub continue_on_failure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Toml,
    Json,
}

impl Format {
    fn of(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Format::Json,
            _ => Format::Toml,
        }
    }
}

impl Plan {
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading plan");
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content, path)
    }

    /// Parse plan text; `source` picks the format and the fallback slug.
    pub fn parse(content: &str, source: &Path) -> Result<Self> {
        let parse_err = |message: String| Error::PlanParse {
            path: source.display().to_string(),
            message,
        };
        let mut plan: Plan = match Format::of(source) {
            Format::Toml => toml::from_str(content).map_err(|e| parse_err(e.to_string()))?,
            Format::Json => {
                serde_json::from_str(content).map_err(|e| parse_err(e.to_string()))?
            }
        };

        plan.source = source.to_path_buf();
        if plan.slug.trim().is_empty() {
            let stem = source
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            plan.slug = stem.to_string();
        }
        plan.slug = sanitize_name(&plan.slug);
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<()> {
        if self.slug.is_empty() {
            return Err(Error::Validation(format!(
                "plan {} has no usable slug",
                self.source.display()
            )));
        }
        if self.tasks.is_empty() {
            return Err(Error::Validation(format!("plan '{}' has no tasks", self.slug)));
        }
        for task in &self.tasks {
            if task.id.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "plan '{}' has a task without an id",
                    self.slug
                )));
            }
            if !task.role.is_empty() && !self.team_members.contains_key(&task.role) {
                warn!(task = %task.id, role = %task.role, "role not in team_members, using default worker");
            }
        }
        Ok(())
    }

    /// Whether the documentation gate is enforced for this plan.
    pub fn documentation_required(&self) -> bool {
        self.documentation.required != Some(false)
            || self.tasks.iter().any(|t| t.documentation_required)
    }

    /// Worker type configured for a role.
    pub fn worker_type(&self, role: &str) -> Option<&str> {
        self.team_members.get(role).map(String::as_str)
    }

    /// Key embedded in the published change so a rerun finds it again.
    pub fn idempotency_key(&self) -> String {
        format!("baton:{}", self.slug)
    }

    /// Name used in logs and commit messages.
    pub fn display_name(&self) -> &str {
        self.tracking_reference.as_deref().unwrap_or(&self.slug)
    }
}

fn is_plan_file(path: &Path) -> bool {
    path.is_file()
        && matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("toml") | Some("json")
        )
}

/// Resolve a plan path or tracking reference to exactly one plan document.
///
/// An existing file is used directly. Anything else is matched against the
/// `tracking_reference` and `slug` of every plan in `plans_dir`; zero or
/// several matches is a resolution error.
pub fn resolve(reference: &str, plans_dir: &Path) -> Result<Plan> {
    let direct = Path::new(reference);
    if direct.is_file() {
        return Plan::load(direct);
    }

    let resolution = |reason: String| Error::Resolution {
        reference: reference.to_string(),
        reason,
    };

    if !plans_dir.is_dir() {
        return Err(resolution(format!(
            "not a file and plans directory {} does not exist",
            plans_dir.display()
        )));
    }

    let mut entries: Vec<PathBuf> = std::fs::read_dir(plans_dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| is_plan_file(p))
        .collect();
    entries.sort();

    let wanted = sanitize_name(reference);
    let mut matches = Vec::new();
    for path in entries {
        let plan = match Plan::load(&path) {
            Ok(plan) => plan,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping unreadable plan");
                continue;
            }
        };
        let by_reference = plan.tracking_reference.as_deref() == Some(reference);
        if by_reference || plan.slug == wanted {
            matches.push(plan);
        }
    }

    match matches.len() {
        0 => Err(resolution(format!("no plan in {} matches", plans_dir.display()))),
        1 => Ok(matches.remove(0)),
        n => Err(resolution(format!(
            "{} plans match: {}",
            n,
            matches
                .iter()
                .map(|p| p.source.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}
