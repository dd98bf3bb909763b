use crate::config::types::EvaluatorConfig;
use crate::core::evaluator::Evaluator;
use crate::core::project::Project;
use crate::core::submission::{Submission, SubmissionId};
use crate::core::types::{EvaluationEvent, RunReport};
use crate::runtime::isolate::{IsolatedRunner, NoChanges, RunOutcome};
use crate::safety::workspace::WorkspaceManager;
use crate::trace::operation::MethodCall;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./instant.json when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate once and print the trace
    Run {
        #[command(flatten)]
        input: ProjectArgs,
        /// Pretty-print the JSON output
        #[arg(long)]
        pretty: bool,
    },
    /// Re-evaluate every time a source file changes
    Watch {
        #[command(flatten)]
        input: ProjectArgs,
        /// Polling interval in milliseconds
        #[arg(long, default_value_t = 300)]
        interval_ms: u64,
    },
    /// Remove working directories left behind by earlier runs
    Cleanup {
        /// Only remove directories older than this many seconds
        #[arg(long, default_value_t = 0)]
        max_age_secs: u64,
    },
}

#[derive(Args, Clone)]
struct ProjectArgs {
    /// WebAssembly text sources holding module fields
    #[arg(required = true)]
    sources: Vec<PathBuf>,
    /// Instructions forming the body of the evaluation entry point
    #[arg(long, conflicts_with = "eval_file")]
    eval: Option<String>,
    /// File holding the evaluation instructions
    #[arg(long)]
    eval_file: Option<PathBuf>,
    /// Binary dependency (.wasm or .wat) importable under its file stem
    #[arg(long = "reference")]
    references: Vec<PathBuf>,
    /// Compiler options, e.g. "-O2 -g"
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    options: String,
}

impl ProjectArgs {
    fn project(&self) -> Project {
        let mut project = Project::new().with_compiler_options(self.options.clone());
        for source in &self.sources {
            project = project.with_source_file(source);
        }
        for reference in &self.references {
            project = project.with_reference(reference);
        }
        project
    }

    fn eval_code(&self) -> Result<String> {
        match (&self.eval, &self.eval_file) {
            (Some(code), _) => Ok(code.clone()),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display())),
            (None, None) => Ok(String::new()),
        }
    }

    fn submission(&self) -> Result<Arc<Submission>> {
        Ok(Arc::new(Submission::new(
            SubmissionId::allocate(),
            self.project(),
            self.eval_code()?,
        )))
    }

    /// Files whose modification re-triggers evaluation
    fn watched_files(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .chain(self.eval_file.iter())
            .chain(self.references.iter())
            .map(PathBuf::as_path)
            .collect()
    }
}

/// Machine-readable result of one evaluation
#[derive(Serialize)]
struct RunSummary<'a> {
    submission: SubmissionId,
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<&'a RunReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    diagnostics: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    trace: BTreeMap<u32, MethodCall>,
}

pub fn run() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EvaluatorConfig::load_from_file(path)?,
        None => EvaluatorConfig::load_default()?,
    };

    match cli.command {
        Commands::Run { input, pretty } => run_once(&config, &input, pretty),
        Commands::Watch { input, interval_ms } => {
            watch(config, &input, Duration::from_millis(interval_ms.max(10)))
        }
        Commands::Cleanup { max_age_secs } => {
            let manager = WorkspaceManager::new(config.workspace_root.clone())?;
            let cleaned = manager.cleanup_old_workspaces(Duration::from_secs(max_age_secs))?;
            eprintln!(
                "Removed {} workspace(s) under {}",
                cleaned,
                manager.base_dir().display()
            );
            Ok(())
        }
    }
}

fn run_once(config: &EvaluatorConfig, input: &ProjectArgs, pretty: bool) -> Result<()> {
    let runner = IsolatedRunner::new(config)?;
    let submission = input.submission()?;
    let result = runner.run(&submission);

    let mut summary = RunSummary {
        submission: submission.id(),
        outcome: "completed",
        report: result.report.as_ref(),
        diagnostics: Vec::new(),
        error: None,
        trace: submission.root_calls(),
    };
    let faulted = matches!(result.outcome, RunOutcome::Faulted(_));
    match &result.outcome {
        RunOutcome::Completed => {}
        RunOutcome::Aborted => summary.outcome = "aborted",
        RunOutcome::NoChanges(NoChanges::MissingDependency(path)) => {
            summary.outcome = "no_changes";
            summary.error = Some(format!("missing dependency {}", path.display()));
        }
        RunOutcome::NoChanges(NoChanges::CompileErrors(diagnostics)) => {
            summary.outcome = "no_changes";
            summary.diagnostics = diagnostics.iter().map(ToString::to_string).collect();
        }
        RunOutcome::Faulted(e) => {
            summary.outcome = "failed";
            summary.error = Some(e.to_string());
        }
    }

    let json = if pretty {
        serde_json::to_string_pretty(&summary)?
    } else {
        serde_json::to_string(&summary)?
    };
    println!("{}", json);

    if faulted {
        std::process::exit(1);
    }
    Ok(())
}

fn latest_modification(files: &[&Path]) -> Option<SystemTime> {
    files
        .iter()
        .filter_map(|file| std::fs::metadata(file).and_then(|m| m.modified()).ok())
        .max()
}

fn watch(config: EvaluatorConfig, input: &ProjectArgs, interval: Duration) -> Result<()> {
    let mut evaluator = Evaluator::new(config)?;
    let events = evaluator.subscribe();
    evaluator.start()?;

    let files = input.watched_files();
    let ticker = crossbeam_channel::tick(interval);
    let mut seen: Option<SystemTime> = None;

    eprintln!("Watching {} file(s), press Ctrl-C to stop", files.len());
    loop {
        crossbeam_channel::select! {
            recv(ticker) -> _ => {
                let modified = latest_modification(&files);
                if modified.is_none() || modified == seen {
                    continue;
                }
                seen = modified;

                match input.submission() {
                    Ok(submission) => evaluator.push(submission),
                    Err(e) => log::warn!("Skipping change: {:#}", e),
                }
            }
            recv(events) -> event => {
                let event = event.context("evaluator stopped publishing events")?;
                print_event(&event)?;
            }
        }
    }
}

fn print_event(event: &EvaluationEvent) -> Result<()> {
    let summary = match event {
        EvaluationEvent::Completed(done) => {
            if done.submission.is_canceled() {
                log::debug!("Submission {} superseded", done.submission.id());
                return Ok(());
            }
            RunSummary {
                submission: done.submission.id(),
                outcome: "completed",
                report: Some(&done.report),
                diagnostics: Vec::new(),
                error: None,
                trace: done.submission.root_calls(),
            }
        }
        EvaluationEvent::Failed(failed) => RunSummary {
            submission: failed.submission.id(),
            outcome: "failed",
            report: failed.report.as_ref(),
            diagnostics: Vec::new(),
            error: Some(failed.error.to_string()),
            trace: failed.submission.root_calls(),
        },
    };
    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}
