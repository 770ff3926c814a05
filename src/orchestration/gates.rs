//! Gate pipeline.
//!
//! Stages run in a fixed order once no task is running: completion, build,
//! documentation (all hard), then the advisory cross-reference scan. The scan
//! starts with the pipeline so it overlaps the build, and is aborted when a
//! hard stage fails.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::{TaskGraph, TaskStatus};
use crate::docs::{self, DocCandidate};
use crate::plan::Plan;
use crate::util::{blocking, tail, OUTPUT_TAIL_CHARS};
use crate::vcs::{ChangedFile, VersionControl};
use crate::workspace::EnvironmentHandle;
use crate::{Error, Result};

pub const COMPLETION: &str = "completion";
pub const BUILD: &str = "build";
pub const DOCUMENTATION: &str = "documentation";
pub const CROSS_REFERENCE: &str = "cross_reference";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub passed: bool,
    /// A failed hard gate halts the pipeline.
    pub hard: bool,
    pub findings: Vec<String>,
    /// Captured command output, for gates that run one.
    pub output: Option<String>,
}

impl GateResult {
    fn hard(name: &str, passed: bool, findings: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            passed,
            hard: true,
            findings,
            output: None,
        }
    }

    /// Findings joined for a one-line report.
    pub fn summary(&self) -> String {
        self.findings.join(", ")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateReport {
    pub results: Vec<GateResult>,
    /// Stages not run because an earlier hard gate failed.
    pub skipped: Vec<String>,
    pub advisory: Vec<DocCandidate>,
    pub changed: Vec<ChangedFile>,
}

impl GateReport {
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed || !r.hard)
    }

    pub fn failure(&self) -> Option<&GateResult> {
        self.results.iter().find(|r| r.hard && !r.passed)
    }

    pub fn result(&self, name: &str) -> Option<&GateResult> {
        self.results.iter().find(|r| r.name == name)
    }

    pub fn to_error(&self) -> Option<Error> {
        self.failure().map(|r| Error::GateFailure {
            gate: r.name.clone(),
            summary: r.summary(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub output: String,
}

/// Commands the gates delegate to.
#[async_trait]
pub trait GateCommands: Send + Sync {
    async fn build_and_test(&self, root: &Path) -> Result<CommandOutput>;

    async fn scan_docs(&self, root: &Path, changed: &[ChangedFile]) -> Result<Vec<DocCandidate>>;
}

/// Runs the configured build command through `sh -c` and scans docs natively.
pub struct ShellGates {
    build_command: String,
    build_timeout: Duration,
    doc_roots: Vec<String>,
    max_candidates: usize,
}

impl ShellGates {
    pub fn from_config(config: &Config) -> Self {
        let g = &config.gates;
        Self {
            build_command: g.build_command.clone(),
            build_timeout: Duration::from_secs(g.build_timeout_secs),
            doc_roots: g.doc_roots.clone(),
            max_candidates: g.max_candidates,
        }
    }
}

#[async_trait]
impl GateCommands for ShellGates {
    async fn build_and_test(&self, root: &Path) -> Result<CommandOutput> {
        debug!(command = %self.build_command, root = %root.display(), "running build");
        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.build_command)
            .current_dir(root)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.build_timeout, child)
            .await
            .map_err(|_| Error::Timeout(self.build_timeout))??;

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            output: tail(&text, OUTPUT_TAIL_CHARS),
        })
    }

    async fn scan_docs(&self, root: &Path, changed: &[ChangedFile]) -> Result<Vec<DocCandidate>> {
        let root = root.to_path_buf();
        let changed = changed.to_vec();
        let roots = self.doc_roots.clone();
        let max = self.max_candidates;
        blocking(move || docs::scan(&root, &roots, &changed, max)).await
    }
}

/// Completion findings: one entry per required task that did not complete.
pub fn completion_findings(graph: &TaskGraph) -> Vec<String> {
    graph
        .tasks()
        .filter(|t| !t.optional)
        .filter_map(|t| match t.status {
            TaskStatus::Completed => None,
            TaskStatus::Failed => Some(format!("{} failed", t.id)),
            TaskStatus::Blocked => Some(format!("{} blocked", t.id)),
            // Still running when the loop stopped.
            TaskStatus::InProgress => Some(format!("{} interrupted", t.id)),
            TaskStatus::Pending | TaskStatus::Ready => Some(format!("{} not run", t.id)),
        })
        .collect()
}

/// Whether a changed path counts as documentation under `pattern`.
///
/// `docs/` style patterns match a directory anywhere in the path, `.md`
/// style patterns match an extension, anything else matches a substring.
pub fn matches_doc_pattern(path: &str, pattern: &str) -> bool {
    if pattern.ends_with('/') {
        path.starts_with(pattern) || path.contains(&format!("/{}", pattern))
    } else if pattern.starts_with('.') && !pattern.contains('/') {
        path.ends_with(pattern)
    } else {
        path.contains(pattern)
    }
}

fn documentation_gate(plan: &Plan, changed: &Result<Vec<ChangedFile>>) -> GateResult {
    if !plan.documentation_required() {
        return GateResult::hard(
            DOCUMENTATION,
            true,
            vec!["documentation not required by plan".to_string()],
        );
    }
    let changed = match changed {
        Ok(changed) => changed,
        Err(e) => {
            return GateResult::hard(
                DOCUMENTATION,
                false,
                vec![format!("could not compute diff: {}", e)],
            );
        }
    };

    let patterns = plan.documentation.patterns();
    let docs: Vec<String> = changed
        .iter()
        .filter(|c| patterns.iter().any(|p| matches_doc_pattern(&c.path, p)))
        .map(|c| c.path.clone())
        .collect();
    if docs.is_empty() {
        GateResult::hard(
            DOCUMENTATION,
            false,
            vec![format!(
                "no documentation changes matching {}",
                patterns.join(", ")
            )],
        )
    } else {
        GateResult::hard(DOCUMENTATION, true, docs)
    }
}

pub struct GatePipeline {
    commands: Arc<dyn GateCommands>,
    vcs: Arc<dyn VersionControl>,
    scan_timeout: Duration,
}

impl GatePipeline {
    pub fn new(
        commands: Arc<dyn GateCommands>,
        vcs: Arc<dyn VersionControl>,
        scan_timeout: Duration,
    ) -> Self {
        Self {
            commands,
            vcs,
            scan_timeout,
        }
    }

    /// Run every stage against a settled graph.
    pub async fn run(&self, plan: &Plan, env: &EnvironmentHandle, graph: &TaskGraph) -> GateReport {
        let mut report = GateReport::default();

        let vcs = self.vcs.clone();
        let root: PathBuf = env.root.clone();
        let base = env.base_commit.clone();
        let changed = blocking(move || vcs.changed_files(&root, &base)).await;
        if let Ok(files) = &changed {
            report.changed = files.clone();
        }

        let scan = {
            let commands = self.commands.clone();
            let root = env.root.clone();
            let files = report.changed.clone();
            let limit = self.scan_timeout;
            tokio::spawn(async move {
                tokio::time::timeout(limit, commands.scan_docs(&root, &files)).await
            })
        };

        let remaining = [BUILD, DOCUMENTATION, CROSS_REFERENCE];

        let findings = completion_findings(graph);
        let completion = GateResult::hard(COMPLETION, findings.is_empty(), findings);
        if !self.record(&mut report, completion) {
            scan.abort();
            report.skipped = remaining.iter().map(|s| s.to_string()).collect();
            return report;
        }

        let build = self.build_gate(env).await;
        if !self.record(&mut report, build) {
            scan.abort();
            report.skipped = remaining[1..].iter().map(|s| s.to_string()).collect();
            return report;
        }

        if !self.record(&mut report, documentation_gate(plan, &changed)) {
            scan.abort();
            report.skipped = vec![CROSS_REFERENCE.to_string()];
            return report;
        }

        let mut cross = GateResult {
            name: CROSS_REFERENCE.to_string(),
            passed: true,
            hard: false,
            findings: Vec::new(),
            output: None,
        };
        match scan.await {
            Ok(Ok(Ok(candidates))) => {
                cross.findings = candidates.iter().map(|c| c.to_string()).collect();
                report.advisory = candidates;
            }
            Ok(Ok(Err(e))) => cross.output = Some(format!("scan failed: {}", e)),
            Ok(Err(_)) => {
                cross.output = Some(format!(
                    "scan timed out after {}s",
                    self.scan_timeout.as_secs()
                ))
            }
            Err(e) => cross.output = Some(format!("scan task failed: {}", e)),
        }
        if let Some(note) = &cross.output {
            warn!(note = %note, "cross-reference scan incomplete");
        }
        self.record(&mut report, cross);
        report
    }

    async fn build_gate(&self, env: &EnvironmentHandle) -> GateResult {
        match self.commands.build_and_test(&env.root).await {
            Ok(out) => {
                let passed = out.exit_code == 0;
                let findings = if passed {
                    Vec::new()
                } else {
                    vec![format!("build exited with status {}", out.exit_code)]
                };
                GateResult {
                    output: Some(out.output),
                    ..GateResult::hard(BUILD, passed, findings)
                }
            }
            Err(e) => GateResult::hard(BUILD, false, vec![format!("build did not run: {}", e)]),
        }
    }

    /// Append a result and log it. Returns whether the pipeline may continue.
    fn record(&self, report: &mut GateReport, result: GateResult) -> bool {
        let proceed = result.passed || !result.hard;
        if result.passed {
            info!(gate = %result.name, findings = result.findings.len(), "gate passed");
        } else {
            warn!(gate = %result.name, summary = %result.summary(), "gate failed");
        }
        report.results.push(result);
        proceed
    }
}
