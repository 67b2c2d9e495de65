use super::{ContainerError, ImageMetadata, MpiModel};
use crate::{
    config::{SigningKey, ToolConfig},
    implementation,
    process::{self, Invocation, RunOutput, BUILD_TIMEOUT, DEFAULT_TIMEOUT},
};
use std::{
    collections::HashMap,
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info, instrument};

pub const LABEL_IMPLEMENTATION: &str = "MPI_Implementation";
pub const LABEL_VERSION: &str = "MPI_Version";
pub const LABEL_DIRECTORY: &str = "MPI_Directory";
pub const LABEL_DISTRO: &str = "Linux_distro";
pub const LABEL_MODEL: &str = "Model";
pub const LABEL_APP_EXE: &str = "App_exe";

#[derive(Debug, Clone)]
/// The external container tool (Singularity or Apptainer) and how it may be invoked
pub struct ContainerEngine {
    pub program: String,
    /// run builds through `sudo -n`
    pub sudo: bool,
    /// run builds with `--fakeroot`
    pub fakeroot: bool,
}

impl ContainerEngine {
    pub fn new(tool: &ToolConfig) -> Self {
        let fakeroot = tool.fakeroot && !tool.force_unprivileged;

        Self {
            program: tool.container_engine.clone(),
            sudo: !fakeroot && tool.needs_sudo(&tool.container_engine),
            fakeroot,
        }
    }

    /// prefix forwarding host variables into the container environment
    pub fn env_prefix(&self) -> &'static str {
        match Path::new(&self.program).file_name() {
            Some(name) if name == "apptainer" => "APPTAINERENV_",
            _ => "SINGULARITYENV_",
        }
    }

    fn execute(
        &self,
        operation: &'static str,
        image: &Path,
        invocation: Invocation,
        timeout: Duration,
    ) -> Result<RunOutput, ContainerError> {
        let output = process::run(&invocation, timeout)?;

        if output.success() {
            Ok(output)
        } else {
            Err(ContainerError::Engine {
                operation,
                image: image.to_path_buf(),
                output,
            })
        }
    }

    fn prepare(image: &Path) -> Result<(), ContainerError> {
        if let Some(parent) = image.parent() {
            fs::create_dir_all(parent).map_err(|source| ContainerError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        Ok(())
    }

    /// Build `image` from `definition`
    #[instrument(skip(self), level = "debug")]
    pub fn build(&self, definition: &Path, image: &Path) -> Result<RunOutput, ContainerError> {
        Self::prepare(image)?;

        let mut invocation = Invocation::new(&self.program).arg("build");
        if self.fakeroot {
            invocation = invocation.arg("--fakeroot");
        }
        invocation = invocation.arg(image).arg(definition);
        if self.sudo {
            invocation = invocation.with_sudo();
        }

        info!(image = ?image, definition = ?definition, "Building image");
        self.execute("build", image, invocation, BUILD_TIMEOUT)
    }

    #[instrument(skip(self), level = "debug")]
    pub fn pull(&self, url: &str, image: &Path) -> Result<RunOutput, ContainerError> {
        Self::prepare(image)?;

        info!(image = ?image, url = url, "Pulling image");
        self.execute(
            "pull",
            image,
            Invocation::new(&self.program).arg("pull").arg(image).arg(url),
            BUILD_TIMEOUT,
        )
    }

    /// Sign `image` with the key at `key.index`, the passphrase goes through stdin
    pub fn sign(&self, image: &Path, key: &SigningKey) -> Result<RunOutput, ContainerError> {
        let mut invocation = Invocation::new(&self.program)
            .arg("sign")
            .arg("--keyidx")
            .arg(key.index.to_string())
            .arg(image);
        if let Some(ref passphrase) = key.passphrase {
            invocation = invocation.stdin(format!("{passphrase}\n"));
        }

        info!(image = ?image, keyidx = key.index, "Signing image");
        self.execute("sign", image, invocation, DEFAULT_TIMEOUT)
    }

    /// Push `image` to `registry`, tagged with the image name
    pub fn push(&self, image: &Path, registry: &str) -> Result<RunOutput, ContainerError> {
        let name = image
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target = format!("{}/{name}:latest", registry.trim_end_matches('/'));

        info!(image = ?image, target = %target, "Pushing image");
        self.execute(
            "push",
            image,
            Invocation::new(&self.program).arg("push").arg(image).arg(target),
            BUILD_TIMEOUT,
        )
    }

    /// Recover the configuration an image was built with from its labels
    pub fn inspect(&self, image: &Path) -> Result<ImageMetadata, ContainerError> {
        let output = self.execute(
            "inspect",
            image,
            Invocation::new(&self.program)
                .arg("inspect")
                .arg("--labels")
                .arg(image),
            DEFAULT_TIMEOUT,
        )?;

        parse_labels(image, &output.stdout)
    }

    /// Arguments running `exe` inside `image`, to be appended to the launcher command line
    pub fn exec_args(
        &self,
        image: &Path,
        binds: &[(PathBuf, PathBuf)],
        exe: &Path,
        args: &[String],
    ) -> Vec<OsString> {
        let mut argv = vec![OsString::from(&self.program), OsString::from("exec")];

        for (host, container) in binds {
            argv.push(OsString::from("--bind"));
            argv.push(OsString::from(format!(
                "{}:{}",
                host.display(),
                container.display()
            )));
        }

        argv.push(image.as_os_str().to_owned());
        argv.push(exe.as_os_str().to_owned());
        argv.extend(args.iter().map(OsString::from));

        argv
    }
}

/// Parse `key: value` lines as printed by `inspect --labels`
pub fn parse_labels(image: &Path, output: &str) -> Result<ImageMetadata, ContainerError> {
    let labels: HashMap<&str, &str> = output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .filter(|(key, _)| !key.is_empty())
        .collect();
    debug!(image = ?image, labels = labels.len(), "Parsed image labels");

    let label = |label: &'static str| {
        labels
            .get(label)
            .copied()
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ContainerError::MissingLabel {
                image: image.to_path_buf(),
                label,
            })
    };
    let invalid = |label: &'static str, value: &str| ContainerError::InvalidLabel {
        image: image.to_path_buf(),
        label,
        value: value.to_owned(),
    };

    let id = label(LABEL_IMPLEMENTATION)?;
    let model = label(LABEL_MODEL)?;
    let distro = label(LABEL_DISTRO)?;

    Ok(ImageMetadata {
        implementation: implementation::lookup(id).map_err(|_| invalid(LABEL_IMPLEMENTATION, id))?,
        version: label(LABEL_VERSION)?.to_owned(),
        model: model
            .parse::<MpiModel>()
            .map_err(|_| invalid(LABEL_MODEL, model))?,
        distro: distro.parse().map_err(|_| invalid(LABEL_DISTRO, distro))?,
        app_exe: PathBuf::from(label(LABEL_APP_EXE)?),
        mpi_dir: labels
            .get(LABEL_DIRECTORY)
            .filter(|value| !value.is_empty())
            .map(|value| PathBuf::from(*value)),
    })
}
