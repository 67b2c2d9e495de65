pub mod native;
pub mod slurm;

use crate::{
    config::Context,
    container::{engine::ContainerEngine, ContainerDescriptor},
    implementation::MpiRelease,
    process::{prepend_path, Invocation, ProcessError, RunOutput},
};
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("Failed to prepare {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("No free batch script path for {0}")]
    ScriptCollision(PathBuf),
    #[error("Job output {path} is unreadable: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Submission failed, the job never ran")]
    Submission { output: RunOutput },
}

impl LaunchError {
    pub fn output(&self) -> Option<&RunOutput> {
        match self {
            Self::Submission { output } => Some(output),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
/// One parallel job: host MPI, target image and application
pub struct JobDescriptor {
    pub name: String,
    pub ranks: usize,
    pub nodes: usize,
    pub host: MpiRelease,
    /// install prefix of the host MPI
    pub host_install: PathBuf,
    pub container: ContainerDescriptor,
    pub app_args: Vec<String>,
    /// scratch directory for scripts and job output
    pub job_dir: PathBuf,
    pub batch_script: Option<PathBuf>,
    pub stdout: String,
    pub stderr: String,
}

impl JobDescriptor {
    /// launcher of the host MPI
    pub fn launcher(&self) -> PathBuf {
        self.host
            .implementation
            .bin_dir(&self.host_install)
            .join(self.host.implementation.launcher())
    }

    /// `PATH`/`LD_LIBRARY_PATH` pointing at the host MPI, followed by the implementation's settings
    /// and their copies exported into the container
    pub fn environment(&self, ctx: &Context, engine: &ContainerEngine) -> Vec<(String, String)> {
        let implementation = self.host.implementation;
        let mut env = vec![
            (
                String::from("PATH"),
                prepend_path("PATH", &implementation.bin_dir(&self.host_install)),
            ),
            (
                String::from("LD_LIBRARY_PATH"),
                prepend_path("LD_LIBRARY_PATH", &implementation.lib_dir(&self.host_install)),
            ),
        ];
        let settings = implementation.launch_env(&ctx.tool, &ctx.ofi);
        let forwarded: Vec<(String, String)> = settings
            .iter()
            .map(|(key, value)| (format!("{}{key}", engine.env_prefix()), value.clone()))
            .collect();
        env.extend(settings);
        env.extend(forwarded);

        env
    }

    /// launcher arguments after `-np`, ending with the container command
    pub fn launch_args(&self, ctx: &Context, engine: &ContainerEngine) -> Vec<OsString> {
        let mut argv: Vec<OsString> = self
            .host
            .implementation
            .launch_args(&ctx.tool)
            .into_iter()
            .map(OsString::from)
            .collect();

        argv.extend(engine.exec_args(
            &self.container.image,
            &self.container.bind_mounts,
            &self.container.app_exe,
            &self.app_args,
        ));

        argv
    }
}

#[derive(Debug, Clone)]
/// Job manager backends, selected once per run
pub enum JobManagers {
    Native(native::NativeLauncher),
    Slurm(slurm::SlurmLauncher),
}

impl JobManagers {
    /// Slurm when it is enabled and `sbatch` is on PATH, direct launch otherwise
    pub fn detect(ctx: &Context) -> Self {
        match slurm::SlurmLauncher::detect(&ctx.tool) {
            Some(launcher) => {
                info!(sbatch = ?launcher.sbatch, "Submitting jobs through Slurm");
                Self::Slurm(launcher)
            }
            None => {
                debug!("Launching jobs directly");
                Self::Native(native::NativeLauncher)
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Native(_) => "native",
            Self::Slurm(_) => "slurm",
        }
    }

    /// Command executing `job`, the caller runs it under the job timeout
    pub fn submit(
        &self,
        job: &mut JobDescriptor,
        ctx: &Context,
        engine: &ContainerEngine,
    ) -> Result<Invocation, LaunchError> {
        match self {
            Self::Native(launcher) => Ok(launcher.submit(job, ctx, engine)),
            Self::Slurm(launcher) => launcher.submit(job, ctx, engine),
        }
    }

    /// Fill the job's output buffers from the finished submission
    pub fn collect(
        &self,
        job: &mut JobDescriptor,
        output: RunOutput,
    ) -> Result<RunOutput, LaunchError> {
        let output = match self {
            Self::Native(launcher) => launcher.collect(output),
            Self::Slurm(launcher) => launcher.collect(job, output)?,
        };

        job.stdout.clone_from(&output.stdout);
        job.stderr.clone_from(&output.stderr);

        Ok(output)
    }
}

pub(crate) fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> LaunchError + '_ {
    move |source| LaunchError::Io {
        path: path.to_path_buf(),
        source,
    }
}
