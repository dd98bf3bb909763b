//! Isolated runs.
//!
//! A run moves through a fixed sequence of stages, tracked in the type of its
//! [`IsolatedContext`]: a fresh working directory, staged dependencies, a
//! compiled and instantiated unit, and finally the invocation. A stage that
//! cannot proceed ends the run with a [`RunOutcome`] instead of the next
//! context. Whatever happens, the context is dropped before the run returns,
//! which releases the wasmtime store first and the working directory second.

use crate::config::types::{EvalError, EvaluatorConfig};
use crate::core::hook::{self, Aborted};
use crate::core::submission::Submission;
use crate::core::types::RunReport;
use crate::runtime::compiler::{has_errors, CompilerOptions, Diagnostic};
use crate::runtime::host::{self, RunState};
use crate::runtime::wrapper::{self, ENTRY_EXPORT, UNIT_FILE_NAME};
use crate::safety::workspace::{Workspace, WorkspaceManager};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use wasmtime::{Engine, Instance, Linker, Module, Store, Trap};

/// Why a run was skipped without producing anything
#[derive(Debug)]
pub enum NoChanges {
    MissingDependency(PathBuf),
    CompileErrors(Vec<Diagnostic>),
}

#[derive(Debug)]
pub enum RunOutcome {
    /// The entry point returned normally
    Completed,
    /// A hook observed cancellation and unwound the guest
    Aborted,
    /// Nothing ran; no event is published
    NoChanges(NoChanges),
    Faulted(EvalError),
}

#[derive(Debug)]
pub struct RunResult {
    pub outcome: RunOutcome,
    /// Absent when no working directory could be created
    pub report: Option<RunReport>,
}

type Stage<S> = std::result::Result<IsolatedContext<S>, RunOutcome>;

/// Type-state marker: working directory created, nothing staged
pub struct Fresh;

/// Type-state marker: every dependency resolved to a loadable path
pub struct Staged {
    dependencies: Vec<PathBuf>,
}

/// Type-state marker: unit compiled, linked and instantiated
pub struct Compiled {
    store: Store<RunState>,
    instance: Instance,
}

/// One run's exclusive resources. `state` is declared first so the store
/// is gone before the working directory is removed.
pub struct IsolatedContext<S> {
    state: S,
    workspace: Workspace,
}

impl IsolatedContext<Fresh> {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            state: Fresh,
            workspace,
        }
    }

    /// Resolve every dependency, copying untrusted ones into the workspace.
    /// The first missing one ends the run before anything is compiled.
    pub fn stage_dependencies(
        mut self,
        references: &[PathBuf],
        config: &EvaluatorConfig,
    ) -> Stage<Staged> {
        let mut dependencies = Vec::with_capacity(references.len());
        for reference in references {
            if !reference.exists() {
                return Err(RunOutcome::NoChanges(NoChanges::MissingDependency(
                    reference.clone(),
                )));
            }
            if config.is_trusted_reference(reference) {
                dependencies.push(reference.clone());
            } else {
                let staged = self
                    .workspace
                    .stage_file(reference)
                    .map_err(RunOutcome::Faulted)?;
                dependencies.push(staged);
            }
        }

        Ok(IsolatedContext {
            state: Staged { dependencies },
            workspace: self.workspace,
        })
    }
}

impl IsolatedContext<Staged> {
    /// Assemble, compile and instantiate the evaluation unit with its dependencies
    pub fn compile(
        mut self,
        sources: &[String],
        eval_code: &str,
        compiler_options: &str,
        submission_id: u32,
    ) -> Stage<Compiled> {
        let (options, diagnostics) = CompilerOptions::parse(compiler_options);
        if has_errors(&diagnostics) {
            return Err(RunOutcome::NoChanges(NoChanges::CompileErrors(diagnostics)));
        }
        for warning in &diagnostics {
            log::debug!("{}", warning);
        }

        let unit = wrapper::assemble(sources, eval_code);
        let unit_path = self
            .workspace
            .write_file(UNIT_FILE_NAME, unit.as_bytes())
            .map_err(RunOutcome::Faulted)?;

        let engine = Engine::new(&options.engine_config()).map_err(engine_fault)?;
        let module = Module::from_file(&engine, &unit_path).map_err(compile_errors)?;

        let mut linker = Linker::new(&engine);
        host::define_hooks(&mut linker).map_err(engine_fault)?;
        let mut store = Store::new(&engine, RunState::default());
        host::define_submission_global(&mut linker, &mut store, submission_id)
            .map_err(engine_fault)?;

        for dependency in &self.state.dependencies {
            let name = module_name(dependency);
            let dependency_module = Module::from_file(&engine, dependency)
                .map_err(|e| compile_error(format!("cannot load {}: {:#}", dependency.display(), e)))?;
            let instance = linker
                .instantiate(&mut store, &dependency_module)
                .map_err(|e| compile_error(format!("cannot link {}: {:#}", name, e)))?;
            linker
                .instance(&mut store, &name, instance)
                .map_err(|e| compile_error(format!("cannot register {}: {:#}", name, e)))?;
        }

        // Unresolved imports and start-function failures surface here. The
        // submission is not registered yet, so a hook called from a start
        // function aborts and the unit counts as not compiling.
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(compile_errors)?;

        Ok(IsolatedContext {
            state: Compiled { store, instance },
            workspace: self.workspace,
        })
    }
}

impl IsolatedContext<Compiled> {
    /// Register `submission` with the hooks and call the entry point
    pub fn invoke(mut self, submission: &Arc<Submission>) -> RunOutcome {
        let Compiled { store, instance } = &mut self.state;
        let entry = match instance.get_typed_func::<(), ()>(&mut *store, ENTRY_EXPORT) {
            Ok(entry) => entry,
            Err(_) => return RunOutcome::Faulted(EvalError::EntryPointMissing(ENTRY_EXPORT.into())),
        };

        let registration = hook::load_submission(Arc::clone(submission));
        let result = entry.call(&mut *store, ());
        drop(registration);

        match result {
            Ok(()) => RunOutcome::Completed,
            Err(error) => classify_fault(error, store.data().aborted),
        }
    }
}

fn classify_fault(error: anyhow::Error, aborted: bool) -> RunOutcome {
    if aborted || error.downcast_ref::<Aborted>().is_some() {
        return RunOutcome::Aborted;
    }
    let trap = error.downcast_ref::<Trap>().map(ToString::to_string);
    RunOutcome::Faulted(EvalError::Runtime {
        message: format!("{:#}", error),
        trap,
    })
}

fn engine_fault(error: anyhow::Error) -> RunOutcome {
    RunOutcome::Faulted(EvalError::Engine(format!("{:#}", error)))
}

fn compile_error(message: String) -> RunOutcome {
    RunOutcome::NoChanges(NoChanges::CompileErrors(vec![Diagnostic::error(message)]))
}

fn compile_errors(error: anyhow::Error) -> RunOutcome {
    compile_error(format!("{:#}", error))
}

/// Import module name a dependency is registered under
fn module_name(dependency: &Path) -> String {
    dependency
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Executes submissions one at a time, each in a context of its own
pub struct IsolatedRunner {
    workspaces: WorkspaceManager,
    config: EvaluatorConfig,
}

impl IsolatedRunner {
    pub fn new(config: &EvaluatorConfig) -> crate::config::types::Result<Self> {
        Ok(Self {
            workspaces: WorkspaceManager::new(config.workspace_root.clone())?,
            config: config.clone(),
        })
    }

    /// Remove working directories abandoned by earlier processes
    pub fn sweep_stale_workspaces(&self) -> usize {
        let Some(max_age) = self.config.stale_workspace_max_age_secs else {
            return 0;
        };
        match self
            .workspaces
            .cleanup_old_workspaces(Duration::from_secs(max_age))
        {
            Ok(0) => 0,
            Ok(cleaned) => {
                log::info!("Swept {} stale workspace(s)", cleaned);
                cleaned
            }
            Err(e) => {
                log::warn!("Stale workspace sweep failed: {}", e);
                0
            }
        }
    }

    /// Run `submission` to completion. The sink is always unwound afterwards.
    pub fn run(&self, submission: &Arc<Submission>) -> RunResult {
        let started_at = Utc::now();
        let workspace = match self.workspaces.create_workspace() {
            Ok(workspace) => workspace,
            Err(e) => {
                return RunResult {
                    outcome: RunOutcome::Faulted(e),
                    report: None,
                }
            }
        };
        let run_id = workspace.run_id().to_string();
        log::debug!("Submission {} runs in {}", submission.id(), run_id);

        let outcome = match self.execute(workspace, submission) {
            Ok(outcome) | Err(outcome) => outcome,
        };
        submission.with_sink(|sink| sink.unwind());

        match &outcome {
            RunOutcome::NoChanges(NoChanges::MissingDependency(path)) => log::debug!(
                "Submission {} skipped: dependency {} is missing",
                submission.id(),
                path.display()
            ),
            RunOutcome::NoChanges(NoChanges::CompileErrors(diagnostics)) => log::debug!(
                "Submission {} skipped: {} compile diagnostic(s)",
                submission.id(),
                diagnostics.len()
            ),
            RunOutcome::Aborted => log::debug!("Submission {} aborted", submission.id()),
            _ => {}
        }

        let report = RunReport {
            submission_id: submission.id(),
            run_id,
            submitted_at: submission.created_at(),
            started_at,
            finished_at: Utc::now(),
            aborted: matches!(outcome, RunOutcome::Aborted),
        };
        RunResult {
            outcome,
            report: Some(report),
        }
    }

    fn execute(
        &self,
        workspace: Workspace,
        submission: &Arc<Submission>,
    ) -> std::result::Result<RunOutcome, RunOutcome> {
        let project = submission.project();
        let context = IsolatedContext::new(workspace)
            .stage_dependencies(&project.references, &self.config)?;
        let sources = project.read_sources().map_err(RunOutcome::Faulted)?;
        let context = context.compile(
            &sources,
            submission.eval_code(),
            &project.compiler_options,
            submission.id().get(),
        )?;
        Ok(context.invoke(submission))
    }
}
