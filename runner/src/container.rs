pub mod definition;
pub mod engine;

use crate::{
    config::{ConfigErrors, Distro},
    implementation::Implementation,
    process::{ProcessError, RunOutput},
};
use definition::TemplateError;
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
/// Where the MPI used inside the container comes from
pub enum MpiModel {
    /// MPI is built into the image
    Hybrid,
    /// the host MPI is bind-mounted at launch
    Bind,
}

impl MpiModel {
    pub fn id(self) -> &'static str {
        match self {
            Self::Hybrid => "hybrid",
            Self::Bind => "bind",
        }
    }
}

impl fmt::Display for MpiModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for MpiModel {
    type Err = ConfigErrors;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "hybrid" => Ok(Self::Hybrid),
            "bind" => Ok(Self::Bind),
            _ => Err(ConfigErrors::InvalidValue {
                key: String::from("model"),
                value: value.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("Container {operation} of {image} failed")]
    Engine {
        operation: &'static str,
        image: PathBuf,
        output: RunOutput,
    },
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("Image {image} has no `{label}` label")]
    MissingLabel { image: PathBuf, label: &'static str },
    #[error("Image {image} has an invalid `{label}` label: `{value}`")]
    InvalidLabel {
        image: PathBuf,
        label: &'static str,
        value: String,
    },
    #[error("No registry entry `{0}`, unable to pull an image without build privileges")]
    NoRegistryEntry(String),
    #[error("Image {image} was built for {found}, expected {expected}")]
    Mismatch {
        image: PathBuf,
        expected: String,
        found: String,
    },
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ContainerError {
    /// captured output of the failing engine command, if any
    pub fn output(&self) -> Option<&RunOutput> {
        match self {
            Self::Engine { output, .. } => Some(output),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Configuration of an image recovered from its labels
pub struct ImageMetadata {
    pub implementation: Implementation,
    pub version: String,
    pub model: MpiModel,
    pub distro: Distro,
    pub app_exe: PathBuf,
    /// MPI prefix inside the image, the mount point for bind images
    pub mpi_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
/// One container image plus what is needed to rebuild or launch it
pub struct ContainerDescriptor {
    pub name: String,
    pub image: PathBuf,
    pub build_dir: PathBuf,
    pub install_dir: PathBuf,
    pub definition: PathBuf,
    pub distro: Distro,
    /// where the image is pulled from when it cannot be built locally
    pub registry_url: Option<String>,
    pub model: MpiModel,
    pub app_exe: PathBuf,
    pub mpi_mount_dir: Option<PathBuf>,
    /// `(host, container)` paths mounted at launch
    pub bind_mounts: Vec<(PathBuf, PathBuf)>,
}

impl ContainerDescriptor {
    /// Descriptor of image `name` stored in `images_dir`, with its build files under `build_dir`
    pub fn new(
        name: &str,
        images_dir: &Path,
        build_dir: PathBuf,
        distro: Distro,
        model: MpiModel,
        app_exe: PathBuf,
    ) -> Self {
        Self {
            name: name.to_owned(),
            image: images_dir.join(format!("{name}.sif")),
            definition: build_dir.join(format!("{name}.def")),
            install_dir: build_dir.join("install"),
            build_dir,
            distro,
            registry_url: None,
            model,
            app_exe,
            mpi_mount_dir: None,
            bind_mounts: Vec::new(),
        }
    }

    /// Mount `host` at `container` when the image is run
    pub fn bind(&mut self, host: PathBuf, container: PathBuf) {
        self.mpi_mount_dir.get_or_insert_with(|| container.clone());
        self.bind_mounts.push((host, container));
    }

    /// Take over the configuration a persisted image was built with.
    ///
    /// The image must hold `implementation`/`version` in the same model; its application binary,
    /// distribution and MPI mount point replace the ones derived from the current run.
    pub fn restore(
        &mut self,
        metadata: &ImageMetadata,
        implementation: Implementation,
        version: &str,
    ) -> Result<(), ContainerError> {
        if metadata.implementation != implementation
            || metadata.version != version
            || metadata.model != self.model
        {
            return Err(ContainerError::Mismatch {
                image: self.image.clone(),
                expected: format!("{implementation}-{version} ({})", self.model),
                found: format!(
                    "{}-{} ({})",
                    metadata.implementation, metadata.version, metadata.model
                ),
            });
        }

        if metadata.app_exe != self.app_exe {
            warn!(
                image = ?self.image,
                built = ?metadata.app_exe,
                configured = ?self.app_exe,
                "Image was built for another application binary"
            );
        }

        self.app_exe.clone_from(&metadata.app_exe);
        self.distro.clone_from(&metadata.distro);
        if self.model == MpiModel::Bind && metadata.mpi_dir.is_some() {
            self.mpi_mount_dir.clone_from(&metadata.mpi_dir);
        }

        Ok(())
    }
}
