use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use baton::config::Config;
use baton::core::{Task, TaskGraph};
use baton::orchestration::{
    FinalizeOutcome, LogTracker, Orchestrator, RunReport, RunSettings, ShellGates, TmuxRuntime,
};
use baton::plan::{self, Plan};
use baton::state::{RunRecord, RunStore};
use baton::util::sanitize_name;
use baton::vcs::GitVcs;
use baton::Result;

/// Baton - drive a task plan to a finished change with autonomous workers
#[derive(Parser, Debug)]
#[command(name = "baton")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    BATON_DEBUG=1   Enable debug logging (alternative to --debug)\n    BATON_LOG       Log filter directive, e.g. baton=trace"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.baton/baton.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.baton/baton.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Repository to work in (default: current directory)
    #[arg(long, global = true)]
    pub repo: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Execute a plan end to end
    Run {
        /// Plan file path or tracking reference
        plan: String,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show task state for a plan, or every recorded run
    Status {
        /// Plan file path or tracking reference
        plan: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Ask a running plan to stop
    Abort {
        /// Plan file path or tracking reference
        plan: String,
    },

    /// Parse a plan and check its dependency graph without running it
    Validate {
        /// Plan file path or tracking reference
        plan: String,
    },
}

struct Context {
    config: Config,
    repo: PathBuf,
}

impl Context {
    fn load(cli: &Cli) -> Result<Self> {
        let config = match &cli.config {
            Some(path) => Config::load_from(path)?,
            None => Config::load()?,
        };
        let repo = match &cli.repo {
            Some(path) => path.clone(),
            None => std::env::current_dir()?,
        };
        Ok(Self { config, repo })
    }

    fn resolve(&self, reference: &str) -> Result<Plan> {
        plan::resolve(reference, &self.config.plans_path(&self.repo))
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    baton::log::init_with_debug(cli.debug);

    let result = Context::load(&cli).and_then(|ctx| match cli.command.clone() {
        Command::Run { plan, json } => run_plan(&ctx, &plan, json),
        Command::Status { plan, json } => show_status(&ctx, plan.as_deref(), json),
        Command::Abort { plan } => abort_plan(&ctx, &plan),
        Command::Validate { plan } => validate_plan(&ctx, &plan),
    });

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("error: {}", e);
            if !baton::log::is_debug() {
                eprintln!("Re-run with --debug for details in ~/.baton/baton.log");
            }
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run_plan(ctx: &Context, reference: &str, json: bool) -> Result<u8> {
    let plan = ctx.resolve(reference)?;
    info!(slug = %plan.slug, source = %plan.source.display(), "run command");
    ctx.config.ensure_dirs()?;

    let vcs = Arc::new(
        GitVcs::new(&ctx.repo, ctx.config.worktrees_dir()?)?.with_remote(&ctx.config.remote),
    );
    let runtime = Arc::new(TmuxRuntime::new(ctx.config.clone(), &plan.slug));
    let gates = Arc::new(ShellGates::from_config(&ctx.config));
    let orchestrator = Orchestrator::new(
        RunSettings::from_config(&ctx.config)?,
        runtime,
        vcs,
        gates,
        Arc::new(LogTracker),
        RunStore::open_default()?,
    );

    let cancel = orchestrator.cancel_token();
    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, aborting run");
                cancel.cancel();
            }
        });
        orchestrator.run(&plan).await
    })?;

    if json {
        print_report_json(&report)?;
    } else {
        print_report(&report);
    }
    Ok(report.exit_code() as u8)
}

fn print_report(report: &RunReport) {
    println!();
    println!("Plan:    {}", report.slug);
    println!("Run:     {}", report.run_id.short());
    println!("Status:  {}", report.status);
    println!("Tasks:   {}", report.summary);
    print_tasks(&report.tasks);

    if let Some(gates) = &report.gates {
        println!();
        println!("Gates:");
        for result in &gates.results {
            let mark = match (result.passed, result.hard) {
                (true, _) => "pass",
                (false, true) => "FAIL",
                (false, false) => "note",
            };
            println!("  {:<4}  {}", mark, result.name);
            for finding in &result.findings {
                println!("        {}", finding);
            }
            if !result.passed {
                if let Some(output) = &result.output {
                    println!();
                    println!("{}", baton::util::tail(output, 2000));
                }
            }
        }
        if !gates.skipped.is_empty() {
            println!("  skipped: {}", gates.skipped.join(", "));
        }
    }

    if let Some(FinalizeOutcome::Finalized {
        artifact_url,
        cascade,
        archived_to,
    }) = &report.finalize
    {
        println!();
        println!("Change:  {}", artifact_url);
        if !cascade.edited.is_empty() {
            println!("Docs updated: {}", cascade.edited.join(", "));
        }
        for follow_up in &cascade.follow_ups {
            println!("Follow-up: {}", follow_up);
        }
        if let Some(path) = archived_to {
            println!("Plan archived to {}", path.display());
        }
    }
    if let Some(reason) = &report.halt_reason {
        println!();
        println!("Halted: {}", reason);
    }
    if let Some(root) = &report.preserved {
        println!("Environment kept for inspection: {}", root.display());
    }
}

fn print_report_json(report: &RunReport) -> Result<()> {
    let output = serde_json::json!({
        "run_id": report.run_id.to_string(),
        "slug": report.slug,
        "status": report.status,
        "success": report.is_success(),
        "summary": report.summary,
        "artifact": report.artifact_url(),
        "preserved": report.preserved,
        "halt_reason": report.halt_reason,
        "gates": report.gates,
        "tasks": report.tasks,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn print_tasks(tasks: &[Task]) {
    for task in tasks {
        let mut line = format!("  [{:<11}] {:<12} {}", task.status.to_string(), task.id.as_str(), task.subject);
        if let Some(err) = &task.error {
            line.push_str(&format!("  ({})", err));
        }
        println!("{}", line);
    }
}

fn print_record(record: &RunRecord) {
    println!("Plan:    {}", record.slug);
    println!("Run:     {} ({})", record.run_id.short(), record.phase);
    println!("Updated: {}", record.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(env) = &record.environment {
        println!("Root:    {}", env.root.display());
    }
    if let Some(url) = &record.artifact {
        println!("Change:  {}", url);
    }
    if let Some(reason) = &record.halt_reason {
        println!("Halted:  {}", reason);
    }
    print_tasks(&record.graph);
}

fn show_status(ctx: &Context, reference: Option<&str>, json: bool) -> Result<u8> {
    let store = RunStore::open_default()?;

    let Some(reference) = reference else {
        let records = store.list()?;
        if json {
            println!("{}", serde_json::to_string_pretty(&records)?);
        } else if records.is_empty() {
            println!("No recorded runs");
        } else {
            for record in &records {
                let summary = TaskGraph::restore(record.graph.clone())
                    .map(|g| g.summary().to_string())
                    .unwrap_or_default();
                println!("  {:<24} {:<10} {}", record.slug, record.phase.to_string(), summary);
            }
        }
        return Ok(0);
    };

    let plan = ctx.resolve(reference);
    let slug = match &plan {
        Ok(plan) => plan.slug.clone(),
        Err(_) => sanitize_name(reference),
    };
    if let Some(record) = store.load(&slug)? {
        if json {
            println!("{}", serde_json::to_string_pretty(&record)?);
        } else {
            print_record(&record);
        }
        return Ok(0);
    }

    let plan = plan?;
    let graph = TaskGraph::from_plan(&plan)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&graph.snapshot())?);
    } else {
        println!("Plan:    {} (not started)", plan.slug);
        print_tasks(&graph.snapshot());
    }
    Ok(0)
}

fn abort_plan(ctx: &Context, reference: &str) -> Result<u8> {
    let slug = match ctx.resolve(reference) {
        Ok(plan) => plan.slug,
        Err(_) => sanitize_name(reference),
    };
    let store = RunStore::open_default()?;
    match store.load(&slug)? {
        Some(record) if record.phase.is_live() => {
            store.request_abort(&slug)?;
            println!("Abort requested for {} (run {})", slug, record.run_id.short());
        }
        _ => println!("No active run for {}", slug),
    }
    Ok(0)
}

fn validate_plan(ctx: &Context, reference: &str) -> Result<u8> {
    let plan = ctx.resolve(reference)?;
    let graph = TaskGraph::from_plan(&plan)?;
    let order: Vec<String> = graph
        .topological_order()?
        .iter()
        .map(|t| t.id.to_string())
        .collect();
    println!(
        "Plan {} is valid: {} tasks, {} dependencies",
        plan.slug,
        graph.len(),
        graph.edge_count()
    );
    println!("Order: {}", order.join(" -> "));
    if !plan.documentation_required() {
        println!("Documentation gate disabled by plan");
    }
    Ok(0)
}
