use crate::{
    app::ApplicationConfig,
    buildenv::{BuildEnvironment, BuildError, ScopedDir},
    config::{ConfigErrors, Context, Layout},
    container::{
        definition::{self, DefinitionRequest, BIND_MOUNT_DIR},
        engine::ContainerEngine,
        ContainerDescriptor, ContainerError, MpiModel,
    },
    executors::{JobDescriptor, JobManagers, LaunchError},
    implementation::MpiRelease,
    matrix::{ExperimentConfig, Matrix},
    process::{self, ProcessError, RunOutput},
    results::{self, ExperimentResult, LedgerError, Outcome},
};
use chrono::{SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// launchers that reject their arguments print a usage banner and may still exit with 0
static USAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*[Uu]sage:").unwrap());

#[derive(Debug, Error)]
/// Everything that ends a matrix cell early
pub enum ExperimentError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("Failed to prepare {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ExperimentError {
    /// captured output of the external command that failed, if any
    pub fn output(&self) -> Option<&RunOutput> {
        match self {
            Self::Build(error) => error.output(),
            Self::Container(error) => error.output(),
            Self::Launch(error) => error.output(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Progress of one matrix cell
pub enum State {
    Pending,
    HostMpiReady,
    ContainerReady,
    Submitted,
    Finished(Outcome),
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("PENDING"),
            Self::HostMpiReady => f.write_str("HOST_MPI_READY"),
            Self::ContainerReady => f.write_str("CONTAINER_READY"),
            Self::Submitted => f.write_str("SUBMITTED"),
            Self::Finished(outcome) => write!(f, "{outcome}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// cells in the matrix
    pub total: usize,
    /// cells skipped because the ledger already has a result for them
    pub skipped: usize,
    pub executed: usize,
    /// executed cells where every iteration passed
    pub cells_passed: usize,
    pub pass: usize,
    pub fail: usize,
    pub error: usize,
}

impl RunSummary {
    fn count(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Pass => self.pass += 1,
            Outcome::Fail => self.fail += 1,
            Outcome::Error => self.error += 1,
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} cells executed ({} already recorded), {} passed | runs: {} PASS, {} FAIL, {} ERROR",
            self.executed,
            self.total,
            self.skipped,
            self.cells_passed,
            self.pass,
            self.fail,
            self.error
        )
    }
}

/// Classify a finished job: the reason is `None` for a pass
pub fn classify(output: &RunOutput, expected: &[String]) -> (Outcome, Option<String>) {
    let failure = if output.timed_out {
        Some(format!("timeout after {:?}", output.runtime))
    } else if output.status != Some(0) {
        Some(match output.status {
            Some(code) => format!("exit status {code}"),
            None => String::from("killed by signal"),
        })
    } else if USAGE.is_match(&output.stdout) || USAGE.is_match(&output.stderr) {
        Some(String::from("launcher printed a usage message"))
    } else if !expected.is_empty()
        && !expected
            .iter()
            .any(|pattern| output.stdout.contains(pattern) || output.stderr.contains(pattern))
    {
        Some(String::from("expected output not found"))
    } else {
        None
    };

    match failure {
        Some(reason) => (Outcome::Fail, Some(reason)),
        None => (Outcome::Pass, None),
    }
}

/// Directory of an MPI installation that holds its `bin` and `lib` directories
fn mpi_root(release: &MpiRelease, install_dir: &Path) -> PathBuf {
    let bin_dir = release.implementation.bin_dir(install_dir);

    bin_dir
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| install_dir.to_path_buf())
}

/// Drives every pending cell of a matrix through build, containerization, launch and recording
pub struct Orchestrator<'a> {
    ctx: &'a Context,
    matrix: &'a Matrix,
    app: &'a ApplicationConfig,
    results: PathBuf,
    errors: PathBuf,
    engine: ContainerEngine,
    jobs: JobManagers,
}

impl<'a> Orchestrator<'a> {
    /// Error details of failing cells go to `errors/` next to the results file
    pub fn new(
        ctx: &'a Context,
        matrix: &'a Matrix,
        app: &'a ApplicationConfig,
        results: PathBuf,
    ) -> Self {
        let errors = results
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("errors");

        Self {
            ctx,
            matrix,
            app,
            results,
            errors,
            engine: ContainerEngine::new(&ctx.tool),
            jobs: JobManagers::detect(ctx),
        }
    }

    /// Run every cell without a recorded result. Only a broken ledger aborts the run.
    pub fn run(&self) -> Result<RunSummary, LedgerError> {
        let existing = results::load(&self.results)?;
        let cells = self.matrix.cells();
        let mut summary = RunSummary {
            total: cells.len(),
            ..RunSummary::default()
        };

        let pending = results::prune(cells, &existing);
        summary.skipped = summary.total - pending.len();
        info!(
            pending = pending.len(),
            skipped = summary.skipped,
            jobs = self.jobs.name(),
            results = ?self.results,
            "Starting experiments"
        );

        for cell in pending.iter() {
            let outcomes = self.run_cell(cell);
            summary.executed += 1;

            if outcomes.iter().all(|(outcome, _)| *outcome == Outcome::Pass) {
                summary.cells_passed += 1;
            }

            for (outcome, note) in outcomes {
                summary.count(outcome);
                results::append(&self.results, &ExperimentResult::new(cell, outcome, note))?;
            }
        }

        info!(summary = %summary, "Experiments done");
        Ok(summary)
    }

    fn transition(cell: &ExperimentConfig, state: &mut State, next: State) {
        debug!(cell = %cell.name(), from = %state, to = %next, "State transition");
        *state = next;
    }

    /// Outcome and note of every iteration; a failure before submission yields a single ERROR
    #[instrument(skip_all, fields(cell = %cell.name()))]
    pub fn run_cell(&self, cell: &ExperimentConfig) -> Vec<(Outcome, String)> {
        let scope = match self.layout(cell) {
            Ok(scope) => scope,
            Err(error) => return vec![self.record_error(cell, &error)],
        };
        let layout = match scope {
            Some(ref scoped) => Layout::new(scoped.path()),
            None => self.ctx.workspace.layout(),
        };

        let outcomes = match self.drive(cell, &layout) {
            Ok(outcomes) => outcomes,
            Err(error) => vec![self.record_error(cell, &error)],
        };

        // dropping the scope removes the per cell directories of non-persistent runs
        drop(scope);
        outcomes
    }

    /// per cell scratch layout unless artifacts persist in the workspace
    fn layout(&self, cell: &ExperimentConfig) -> Result<Option<ScopedDir>, ExperimentError> {
        if self.ctx.persistent {
            return Ok(None);
        }

        let path = self
            .ctx
            .workspace
            .root
            .join("scratch")
            .join(format!("run-{}", cell.name()));
        if path.exists() {
            fs::remove_dir_all(&path).map_err(|source| ExperimentError::Io {
                path: path.clone(),
                source,
            })?;
        }

        ScopedDir::create(&path)
            .map(Some)
            .map_err(|source| ExperimentError::Io { path, source })
    }

    fn drive(
        &self,
        cell: &ExperimentConfig,
        layout: &Layout,
    ) -> Result<Vec<(Outcome, String)>, ExperimentError> {
        let mut state = State::Pending;
        info!(cell = %cell, "Starting experiment");

        let mut host = BuildEnvironment::for_release(layout, &cell.host);
        host.ensure_installed(&cell.host, &self.ctx.tool)?;
        Self::transition(cell, &mut state, State::HostMpiReady);

        let mut container = self.prepare_container(cell, layout)?;
        if self.ctx.model == MpiModel::Bind {
            // the host side of the cell is what runs inside a bind image
            let mount = container
                .mpi_mount_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(BIND_MOUNT_DIR));
            container.bind(mpi_root(&cell.host, &host.install_dir), mount);
        }
        debug!(
            image = ?container.image,
            source = ?container.registry_url,
            mpi = ?container.install_dir,
            binds = ?container.bind_mounts,
            "Container ready"
        );
        Self::transition(cell, &mut state, State::ContainerReady);

        let mut outcomes = Vec::with_capacity(self.ctx.nrun);
        for iteration in 0..self.ctx.nrun {
            let mut job = JobDescriptor {
                name: cell.name(),
                ranks: self.ctx.ranks,
                nodes: self.ctx.nodes,
                host: cell.host.clone(),
                host_install: host.install_dir.clone(),
                container: container.clone(),
                app_args: self.app.args.clone(),
                job_dir: layout.scratch_dir(&cell.name()).join("jobs"),
                batch_script: None,
                stdout: String::new(),
                stderr: String::new(),
            };

            let result = self.launch(&mut job);
            Self::transition(cell, &mut state, State::Submitted);
            debug!(
                script = ?job.batch_script,
                stdout = job.stdout.len(),
                stderr = job.stderr.len(),
                "Job returned"
            );

            let label = format!("run-{iteration}");
            let expected = self.app.expected_patterns(job.ranks);
            let (outcome, note) = match result {
                Ok(output) => match classify(&output, &expected) {
                    (outcome, None) => (outcome, self.app.note(&output)),
                    (outcome, Some(reason)) => {
                        warn!(iteration = iteration, reason = %reason, "Job failed");
                        self.dump(cell, &label, &reason, Some(&output));
                        (outcome, reason)
                    }
                },
                Err(error) => {
                    let message = error.to_string();
                    error!(iteration = iteration, error = %message, "Job could not be launched");
                    self.dump(cell, &label, &message, error.output());
                    (Outcome::Error, message)
                }
            };

            Self::transition(cell, &mut state, State::Finished(outcome));
            info!(iteration = iteration, outcome = %outcome, note = %note, "Experiment finished");
            outcomes.push((outcome, note));
        }

        Ok(outcomes)
    }

    fn launch(&self, job: &mut JobDescriptor) -> Result<RunOutput, ExperimentError> {
        let invocation = self.jobs.submit(job, self.ctx, &self.engine)?;
        let output = process::run(&invocation, self.ctx.job_timeout)?;

        Ok(self.jobs.collect(job, output)?)
    }

    fn image_name(&self, cell: &ExperimentConfig) -> String {
        match self.ctx.model {
            MpiModel::Hybrid => format!("{}-{}", cell.container.key(), self.app.category),
            MpiModel::Bind => format!("{}-{}-bind", cell.container.key(), self.app.category),
        }
    }

    /// Build, pull or reuse the image for the container side of `cell`
    fn prepare_container(
        &self,
        cell: &ExperimentConfig,
        layout: &Layout,
    ) -> Result<ContainerDescriptor, ExperimentError> {
        let release = &cell.container;
        let name = self.image_name(cell);
        let mut descriptor = ContainerDescriptor::new(
            &name,
            &layout.images_dir(),
            layout.scratch_dir(&name),
            self.ctx.distro.clone(),
            self.ctx.model,
            self.app.container_exe(),
        );
        if self.ctx.model == MpiModel::Bind {
            descriptor.mpi_mount_dir = Some(PathBuf::from(BIND_MOUNT_DIR));
        }

        if self.ctx.persistent && descriptor.image.exists() {
            let metadata = self.engine.inspect(&descriptor.image)?;
            descriptor.restore(&metadata, release.implementation, &release.version)?;
            info!(image = %descriptor.name, app = ?descriptor.app_exe, "Reusing existing image");

            return Ok(descriptor);
        }

        if !self.ctx.tool.build_privilege {
            let key = format!("{}-{}", release.key(), self.app.category);
            let url = self
                .ctx
                .image_registry
                .get(&key)
                .ok_or(ContainerError::NoRegistryEntry(key))?;

            self.engine.pull(url, &descriptor.image)?;
            descriptor.registry_url = Some(url.clone());

            return Ok(descriptor);
        }

        // bind images carry an application compiled on the host against the container's MPI
        let app_host_path = if self.ctx.model == MpiModel::Bind {
            let mut mpi = BuildEnvironment::for_release(layout, release);
            mpi.ensure_installed(release, &self.ctx.tool)?;
            let bin_dir = release.implementation.bin_dir(&mpi.install_dir);
            descriptor.install_dir = mpi.install_dir;

            let dir = layout.apps_dir().join(&name);
            let mut env = BuildEnvironment::new(
                dir.clone(),
                dir.join("install"),
                descriptor.build_dir.clone(),
            );
            Some(self.app.build_on_host(&mut env, &bin_dir)?)
        } else {
            None
        };

        let template = definition::load_template(
            &self.ctx.workspace.templates_dir(),
            release.implementation,
            self.app.category,
            self.ctx.model,
        )
        .map_err(ContainerError::from)?;
        let request = DefinitionRequest {
            release,
            model: self.ctx.model,
            distro: &descriptor.distro,
            app: self.app,
            configure_args: release.implementation.configure_args(&self.ctx.tool),
            app_host_path: app_host_path.as_deref(),
        };
        definition::generate(&template, &request, &descriptor.definition)
            .map_err(ContainerError::from)?;

        self.engine.build(&descriptor.definition, &descriptor.image)?;

        if let Some(ref key) = self.ctx.signing {
            self.engine.sign(&descriptor.image, key)?;
        }
        if let Some(ref registry) = self.ctx.push_registry {
            self.engine.push(&descriptor.image, registry)?;
        }

        Ok(descriptor)
    }

    fn record_error(&self, cell: &ExperimentConfig, error: &ExperimentError) -> (Outcome, String) {
        error!(cell = %cell.name(), error = %error, "Experiment failed");
        self.dump(cell, "setup", &error.to_string(), error.output());

        (Outcome::Error, error.to_string())
    }

    /// Persist the details of a failure into `errors/<cell>/<label>/`
    fn dump(
        &self,
        cell: &ExperimentConfig,
        label: &str,
        message: &str,
        output: Option<&RunOutput>,
    ) {
        let dir = self.errors.join(cell.name()).join(label);

        let written = fs::create_dir_all(&dir)
            .and_then(|_| {
                let recorded = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
                fs::write(dir.join("error.txt"), format!("[{recorded}] {message}\n"))
            })
            .and_then(|_| output.map_or(Ok(()), |output| output.dump(&dir)));

        match written {
            Ok(()) => debug!(dir = ?dir, "Saved error details"),
            Err(error) => warn!(error = ?error, dir = ?dir, "Failed to save error details"),
        }
    }
}

#[cfg(test)]
mod orchestrator_test;
