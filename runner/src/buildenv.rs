pub mod archive;
pub mod fetch;

use crate::{
    config::{Layout, ToolConfig},
    implementation::{Implementation, InstallFlow, InstallerMode, MpiRelease},
    process::{self, is_executable, Invocation, ProcessError, RunOutput, BUILD_TIMEOUT},
};
use archive::{detect_format, extraction_flag, is_archive, ArchiveError};
use fetch::{artifact_name, FetchError};
use std::{
    fs,
    ops::Deref,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// default concurrency of `make`
pub const MAKE_JOBS: usize = 4;

const EXTRACT_DIR: &str = "src";
const INSTALLER_SCRIPT: &str = "install.sh";

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("Extracting {archive} produced {entries} top-level entries, expected exactly one")]
    InconsistentLayout { archive: PathBuf, entries: usize },
    #[error("Nothing was fetched, unable to unpack")]
    NotFetched,
    #[error("{0} has neither a Makefile nor an installer")]
    NoBuildSystem(PathBuf),
    #[error("{step} failed")]
    StepFailed { step: &'static str, output: RunOutput },
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("Failed to prepare {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BuildError {
    /// captured output of the failing external command, if any
    pub fn output(&self) -> Option<&RunOutput> {
        match self {
            Self::StepFailed { output, .. } => Some(output),
            Self::Fetch(FetchError::Transfer { output, .. }) => Some(output),
            _ => None,
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug)]
/// A directory that is removed when dropped
pub struct ScopedDir {
    path: PathBuf,
}

impl ScopedDir {
    pub fn create(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        fs::create_dir_all(&path)?;

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Deref for ScopedDir {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        &self.path
    }
}

impl Drop for ScopedDir {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = ?self.path, "Removed directory"),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => error!(error = ?error, path = ?self.path, "Failed to remove directory"),
        }
    }
}

#[derive(Debug, Clone)]
/// One software build, from fetching the sources to installing them.
///
/// Each step only writes the fields it owns: `fetch` sets `source_path`, `unpack` sets
/// `source_dir`, everything else is fixed at construction.
pub struct BuildEnvironment {
    pub source_path: Option<PathBuf>,
    pub source_dir: Option<PathBuf>,
    pub scratch_dir: PathBuf,
    pub install_dir: PathBuf,
    pub build_dir: PathBuf,
    /// `KEY=VALUE` overrides applied to every step
    pub env: Vec<(String, String)>,
    pub jobs: usize,
}

impl BuildEnvironment {
    pub fn new(build_dir: PathBuf, install_dir: PathBuf, scratch_dir: PathBuf) -> Self {
        Self {
            source_path: None,
            source_dir: None,
            scratch_dir,
            install_dir,
            build_dir,
            env: Vec::new(),
            jobs: MAKE_JOBS,
        }
    }

    /// directories of `release` inside `layout`
    pub fn for_release(layout: &Layout, release: &MpiRelease) -> Self {
        Self::new(
            layout.build_dir(release),
            layout.install_dir(release),
            layout.scratch_dir(&release.key()),
        )
    }

    fn stamp(&self, url: &str) -> PathBuf {
        self.install_dir
            .join(format!(".{}.installed", artifact_name(url)))
    }

    /// whether the package behind `url` was already installed into `install_dir`
    pub fn is_installed(&self, url: &str) -> bool {
        self.stamp(url).is_file()
    }

    fn mark_installed(&self, url: &str) -> Result<(), BuildError> {
        let stamp = self.stamp(url);
        fs::create_dir_all(&self.install_dir)
            .and_then(|_| fs::write(&stamp, url))
            .map_err(|error| BuildError::io(&stamp, error))
    }

    fn step(&self, step: &'static str, invocation: Invocation) -> Result<RunOutput, BuildError> {
        let invocation = invocation.envs(self.env.iter().cloned());
        let output = process::run(&invocation, BUILD_TIMEOUT)?;

        if output.success() {
            Ok(output)
        } else {
            error!(step = step, status = ?output.status, timed_out = output.timed_out, "Build step failed");
            Err(BuildError::StepFailed { step, output })
        }
    }

    fn source_dir(&self) -> Result<&Path, BuildError> {
        self.source_dir.as_deref().ok_or(BuildError::NotFetched)
    }

    #[instrument(skip(self), level = "debug")]
    pub fn fetch(&mut self, url: &str) -> Result<(), BuildError> {
        fs::create_dir_all(&self.build_dir).map_err(|error| BuildError::io(&self.build_dir, error))?;
        self.source_path = Some(fetch::fetch(url, &self.build_dir)?);

        Ok(())
    }

    /// Extract the fetched archive; bare files and directories are used as is
    #[instrument(skip(self), level = "debug")]
    pub fn unpack(&mut self) -> Result<(), BuildError> {
        let source = self.source_path.clone().ok_or(BuildError::NotFetched)?;

        if source.is_dir() {
            debug!(source = ?source, "Source is a directory, nothing to unpack");
            self.source_dir = Some(source);
            return Ok(());
        }

        let name = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        if !is_archive(&name) {
            debug!(source = ?source, "Source is a bare file, nothing to unpack");
            self.source_dir = Some(self.build_dir.clone());
            return Ok(());
        }

        let flag = extraction_flag(detect_format(&name)?);
        let target = self.build_dir.join(EXTRACT_DIR);

        if target.exists() {
            fs::remove_dir_all(&target).map_err(|error| BuildError::io(&target, error))?;
        }
        fs::create_dir_all(&target).map_err(|error| BuildError::io(&target, error))?;

        info!(archive = ?source, "Unpacking");
        self.step(
            "unpack",
            Invocation::new("tar")
                .arg("-C")
                .arg(&target)
                .arg(flag)
                .arg(&source),
        )?;

        let entries = fs::read_dir(&target)
            .map_err(|error| BuildError::io(&target, error))?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .collect::<Vec<_>>();

        match entries.as_slice() {
            [single] => {
                self.source_dir = Some(single.clone());
                Ok(())
            }
            _ => Err(BuildError::InconsistentLayout {
                archive: source,
                entries: entries.len(),
            }),
        }
    }

    /// Run `./configure --prefix=<install_dir>` when the source ships one
    #[instrument(skip(self), level = "debug")]
    pub fn configure(&self, extra_args: &[String]) -> Result<(), BuildError> {
        let source_dir = self.source_dir()?;
        let configure = source_dir.join("configure");

        if !is_executable(&configure) {
            debug!(source = ?source_dir, "No configure script, skipping");
            return Ok(());
        }

        info!(prefix = ?self.install_dir, "Configuring");
        self.step(
            "configure",
            Invocation::new(&configure)
                .arg(format!("--prefix={}", self.install_dir.display()))
                .args(extra_args)
                .current_dir(source_dir),
        )?;

        Ok(())
    }

    fn has_makefile(&self) -> Result<bool, BuildError> {
        Ok(self.source_dir()?.join("Makefile").is_file())
    }

    #[instrument(skip(self), level = "debug")]
    pub fn compile(&self) -> Result<(), BuildError> {
        if !self.has_makefile()? {
            debug!("No Makefile, nothing to compile");
            return Ok(());
        }

        info!(jobs = self.jobs, "Compiling");
        self.step(
            "compile",
            Invocation::new("make")
                .arg(format!("-j{}", self.jobs))
                .current_dir(self.source_dir()?),
        )?;

        Ok(())
    }

    /// `make install`, or the implementation's installer when no Makefile exists
    #[instrument(skip(self), level = "debug")]
    pub fn install(&self, implementation: Implementation) -> Result<(), BuildError> {
        fs::create_dir_all(&self.install_dir)
            .map_err(|error| BuildError::io(&self.install_dir, error))?;

        if self.has_makefile()? {
            info!(prefix = ?self.install_dir, "Installing");
            self.step(
                "install",
                Invocation::new("make")
                    .arg("install")
                    .current_dir(self.source_dir()?),
            )?;

            return Ok(());
        }

        match self.run_installer(implementation, InstallerMode::Install) {
            // an installer that ran and failed may have left a partial tree behind
            Err(error) if error.output().is_some() => {
                warn!(error = %error, prefix = ?self.install_dir, "Installer failed, rolling back");
                if let Err(rollback) = self.uninstall(implementation) {
                    error!(error = %rollback, prefix = ?self.install_dir, "Rollback failed");
                }

                Err(error)
            }
            result => result,
        }
    }

    /// Remove an installation made by the implementation's installer
    fn uninstall(&self, implementation: Implementation) -> Result<(), BuildError> {
        self.run_installer(implementation, InstallerMode::Uninstall)
    }

    fn run_installer(
        &self,
        implementation: Implementation,
        mode: InstallerMode,
    ) -> Result<(), BuildError> {
        let source_dir = self.source_dir()?;
        let installer = source_dir.join(INSTALLER_SCRIPT);

        let config = match implementation.installer_config(&self.install_dir, mode) {
            Some(config) if installer.is_file() => config,
            _ => return Err(BuildError::NoBuildSystem(source_dir.to_path_buf())),
        };

        fs::create_dir_all(&self.scratch_dir)
            .map_err(|error| BuildError::io(&self.scratch_dir, error))?;
        let config_path = self.scratch_dir.join(match mode {
            InstallerMode::Install => "silent_install.cfg",
            InstallerMode::Uninstall => "silent_uninstall.cfg",
        });
        fs::write(&config_path, config).map_err(|error| BuildError::io(&config_path, error))?;

        info!(installer = ?installer, mode = ?mode, "Running silent installer");
        self.step(
            match mode {
                InstallerMode::Install => "install",
                InstallerMode::Uninstall => "uninstall",
            },
            Invocation::new(&installer)
                .arg("--silent")
                .arg(&config_path)
                .current_dir(source_dir),
        )?;

        Ok(())
    }

    /// Run a shell command inside the source directory
    pub fn run_in_source(&self, step: &'static str, command: &str) -> Result<RunOutput, BuildError> {
        self.step(
            step,
            Invocation::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(self.source_dir()?),
        )
    }

    /// Fetch, unpack, configure, compile and install `release` unless it is already installed.
    /// Returns whether anything was built.
    #[instrument(skip_all, fields(release = %release))]
    pub fn ensure_installed(
        &mut self,
        release: &MpiRelease,
        tool: &ToolConfig,
    ) -> Result<bool, BuildError> {
        if self.is_installed(&release.url) {
            info!(prefix = ?self.install_dir, "Already installed, skipping build");
            return Ok(false);
        }

        let implementation = release.implementation;
        self.fetch(&release.url)?;
        self.unpack()?;

        if implementation.install_flow() == InstallFlow::Autotools {
            self.configure(&implementation.configure_args(tool))?;
            self.compile()?;
        }

        self.install(implementation)?;
        self.mark_installed(&release.url)?;
        info!(prefix = ?self.install_dir, "Installed");

        Ok(true)
    }
}
