//! Finalization: publish, documentation cascade, archive.
//!
//! Publishing is the one step with an external side effect that must not be
//! repeated. The change artifact carries a marker built from the plan's
//! idempotency key; before opening a new one the run record and the remote
//! are both checked for an existing artifact with that marker, and the URL is
//! written to the run record as soon as it is known.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::core::TaskGraph;
use crate::docs::{path_references, rewrite_path};
use crate::orchestration::gates::GateReport;
use crate::plan::Plan;
use crate::state::{RunPhase, RunRecord, RunStore};
use crate::util::blocking;
use crate::vcs::{ChangeKind, VersionControl};
use crate::workspace::EnvironmentHandle;
use crate::{Error, Result};

/// Issue tracker boundary.
pub trait Tracker: Send + Sync {
    /// Close the plan's tracking reference.
    fn close(&self, reference: &str) -> Result<()>;

    /// Raise a follow-up item for work the cascade could not do itself.
    fn raise_follow_up(&self, title: &str, body: &str) -> Result<()>;
}

/// Tracker that only records through the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTracker;

impl Tracker for LogTracker {
    fn close(&self, reference: &str) -> Result<()> {
        info!(reference, "tracking reference closed");
        Ok(())
    }

    fn raise_follow_up(&self, title: &str, body: &str) -> Result<()> {
        info!(title, body, "follow-up raised");
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeReport {
    /// Documents rewritten in the environment.
    pub edited: Vec<String>,
    /// Titles of the follow-ups raised.
    pub follow_ups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The plan was archived by an earlier run; nothing was touched.
    AlreadyFinalized,
    Finalized {
        artifact_url: String,
        cascade: CascadeReport,
        /// Where the plan document went, if it was still present.
        archived_to: Option<PathBuf>,
    },
}

pub struct Finalizer {
    vcs: Arc<dyn VersionControl>,
    tracker: Arc<dyn Tracker>,
    store: RunStore,
    archive_dir: PathBuf,
}

impl Finalizer {
    pub fn new(
        vcs: Arc<dyn VersionControl>,
        tracker: Arc<dyn Tracker>,
        store: RunStore,
        archive_dir: PathBuf,
    ) -> Self {
        Self {
            vcs,
            tracker,
            store,
            archive_dir,
        }
    }

    pub async fn finalize(
        &self,
        plan: &Plan,
        env: &EnvironmentHandle,
        graph: &TaskGraph,
        report: &GateReport,
        record: &mut RunRecord,
    ) -> Result<FinalizeOutcome> {
        if record.archived {
            info!(slug = %plan.slug, "plan already archived, skipping finalization");
            return Ok(FinalizeOutcome::AlreadyFinalized);
        }

        record.phase = RunPhase::Finalizing;
        let artifact_url = self.publish(plan, env, graph, report, record).await?;
        let cascade = self.cascade(plan, env, report).await;
        let archived_to = self.archive(plan, record)?;

        info!(slug = %plan.slug, url = %artifact_url, "plan finalized");
        Ok(FinalizeOutcome::Finalized {
            artifact_url,
            cascade,
            archived_to,
        })
    }

    async fn publish(
        &self,
        plan: &Plan,
        env: &EnvironmentHandle,
        graph: &TaskGraph,
        report: &GateReport,
        record: &mut RunRecord,
    ) -> Result<String> {
        if let Some(url) = &record.artifact {
            info!(url = %url, "reusing recorded change artifact");
            return Ok(url.clone());
        }

        let vcs = self.vcs.clone();
        let root = env.root.clone();
        let branch = env.branch.clone();
        let marker = artifact_marker(plan);
        let title = artifact_title(plan);
        let body = artifact_body(plan, graph, report);
        let commit_message = format!("baton: finalize {}", plan.display_name());

        let url = blocking(move || {
            vcs.commit_all(&root, &commit_message);
            vcs.push(&root, &branch)?;
            if let Some(url) = vcs.find_change_artifact(&root, &branch, &marker)? {
                info!(url = %url, "found existing change artifact");
                return Ok(url);
            }
            vcs.open_change_artifact(&root, &branch, &title, &body)
        })
        .await
        .map_err(|e| match e {
            Error::Finalization(_) => e,
            other => Error::Finalization(other.to_string()),
        })?;

        record.artifact = Some(url.clone());
        record.touch();
        self.store.save(record)?;
        Ok(url)
    }

    /// Best-effort documentation fixes for the advisory candidates.
    async fn cascade(&self, plan: &Plan, env: &EnvironmentHandle, report: &GateReport) -> CascadeReport {
        let mut out = CascadeReport::default();
        if report.advisory.is_empty() {
            return out;
        }

        let mut renamed: HashMap<&str, &str> = HashMap::new();
        let mut deleted: Vec<&str> = Vec::new();
        for file in &report.changed {
            match &file.kind {
                ChangeKind::Renamed { from } => {
                    renamed.insert(from.as_str(), file.path.as_str());
                }
                ChangeKind::Deleted => deleted.push(file.path.as_str()),
                _ => {}
            }
        }

        for candidate in &report.advisory {
            let path = env.root.join(&candidate.path);
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    warn!(doc = %candidate.path, error = %e, "cascade could not read document");
                    continue;
                }
            };

            let plan_edit = plan_doc_edit(&content, &renamed, &deleted);
            if plan_edit.replacements > 0 {
                match fs::write(&path, &plan_edit.content) {
                    Ok(()) => {
                        debug!(doc = %candidate.path, replacements = plan_edit.replacements, "document updated");
                        out.edited.push(candidate.path.clone());
                    }
                    Err(e) => warn!(doc = %candidate.path, error = %e, "cascade could not write document"),
                }
            }

            let notes = if plan_edit.unresolved.is_empty() && plan_edit.replacements == 0 {
                vec![format!("mentions {}", candidate.terms.join(", "))]
            } else {
                plan_edit.unresolved
            };
            if notes.is_empty() {
                continue;
            }
            let title = format!("Review {} after {}", candidate.path, plan.display_name());
            let body = notes.join("\n");
            match self.tracker.raise_follow_up(&title, &body) {
                Ok(()) => out.follow_ups.push(title),
                Err(e) => warn!(doc = %candidate.path, error = %e, "could not raise follow-up"),
            }
        }

        if !out.edited.is_empty() {
            let vcs = self.vcs.clone();
            let root = env.root.clone();
            let branch = env.branch.clone();
            let message = format!("baton: update documentation references for {}", plan.display_name());
            let pushed = blocking(move || {
                if vcs.commit_all(&root, &message) {
                    vcs.push(&root, &branch)?;
                }
                Ok(())
            })
            .await;
            if let Err(e) = pushed {
                warn!(error = %e, "cascade edits committed but not pushed");
            }
        }
        out
    }

    fn archive(&self, plan: &Plan, record: &mut RunRecord) -> Result<Option<PathBuf>> {
        let archived_to = if plan.source.is_file() {
            match archive_plan(&plan.source, &self.archive_dir) {
                Ok(dest) => Some(dest),
                Err(e) => {
                    warn!(plan = %plan.source.display(), error = %e, "could not archive plan document");
                    None
                }
            }
        } else {
            debug!(plan = %plan.source.display(), "plan document already gone");
            None
        };

        record.archived = true;
        record.phase = RunPhase::Finalized;
        record.touch();
        self.store.save(record)?;

        if let Some(reference) = &plan.tracking_reference {
            if let Err(e) = self.tracker.close(reference) {
                warn!(reference = %reference, error = %e, "could not close tracking reference");
            }
        }
        Ok(archived_to)
    }
}

/// Text edits planned for one document.
struct DocEdit {
    content: String,
    replacements: usize,
    unresolved: Vec<String>,
}

fn plan_doc_edit(content: &str, renamed: &HashMap<&str, &str>, deleted: &[&str]) -> DocEdit {
    let mut edit = DocEdit {
        content: content.to_string(),
        replacements: 0,
        unresolved: Vec::new(),
    };
    let mentioned = path_references(content);

    for (from, to) in renamed {
        if mentioned.iter().any(|m| m == from) {
            let (rewritten, n) = rewrite_path(&edit.content, from, to);
            edit.content = rewritten;
            edit.replacements += n;
            continue;
        }
        // A bare file name could refer to more than one file.
        let name = Path::new(from).file_name().and_then(|n| n.to_str()).unwrap_or(from);
        if name != *from && content.contains(name) {
            edit.unresolved.push(format!("mentions {}, which moved from {} to {}", name, from, to));
        }
    }
    for path in deleted {
        if mentioned.iter().any(|m| m == path) {
            edit.unresolved.push(format!("references deleted file {}", path));
        }
    }
    edit
}

/// Move `source` into `archive_dir`, prefixing a timestamp when the name is taken.
pub fn archive_plan(source: &Path, archive_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(archive_dir)?;
    let name = source
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Validation(format!("invalid plan path {}", source.display())))?;
    let mut dest = archive_dir.join(name);
    if dest.exists() {
        dest = archive_dir.join(format!("{}-{}", Utc::now().format("%Y%m%d%H%M%S"), name));
    }
    if fs::rename(source, &dest).is_err() {
        // Across filesystems rename fails; fall back to copy and remove.
        fs::copy(source, &dest)?;
        fs::remove_file(source)?;
    }
    info!(from = %source.display(), to = %dest.display(), "plan archived");
    Ok(dest)
}

/// Marker embedded in the artifact body and searched for on rerun.
pub fn artifact_marker(plan: &Plan) -> String {
    format!("<!-- {} -->", plan.idempotency_key())
}

fn artifact_title(plan: &Plan) -> String {
    match &plan.tracking_reference {
        Some(reference) if reference != &plan.slug => format!("{}: {}", reference, plan.slug),
        _ => plan.slug.clone(),
    }
}

fn artifact_body(plan: &Plan, graph: &TaskGraph, report: &GateReport) -> String {
    let mut body = String::new();
    body.push_str(&format!("Plan `{}`\n\n", plan.slug));
    for task in graph.tasks() {
        body.push_str(&format!("- [{}] {} {}\n", task.status, task.id, task.subject));
    }
    let passed: Vec<&str> = report
        .results
        .iter()
        .filter(|r| r.passed)
        .map(|r| r.name.as_str())
        .collect();
    body.push_str(&format!("\nGates passed: {}\n", passed.join(", ")));
    if !report.advisory.is_empty() {
        body.push_str("\nDocuments that may need review:\n");
        for candidate in &report.advisory {
            body.push_str(&format!("- {}\n", candidate));
        }
    }
    body.push_str(&format!("\n{}\n", artifact_marker(plan)));
    body
}
