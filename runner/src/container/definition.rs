use super::MpiModel;
use crate::{
    app::{ApplicationConfig, TestCategory},
    buildenv::{
        archive::{detect_format, extraction_flag, ArchiveError},
        fetch::{artifact_name, classify, SourceKind},
    },
    config::Distro,
    implementation::{Implementation, InstallFlow, InstallerMode, MpiRelease},
};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

pub const TAG_MPI_IMPLEMENTATION: &str = "@MPI_IMPLEMENTATION@";
pub const TAG_MPI_VERSION: &str = "@MPI_VERSION@";
pub const TAG_MPI_URL: &str = "@MPI_URL@";
pub const TAG_MPI_TARBALL: &str = "@MPI_TARBALL@";
pub const TAG_TAR_ARGS: &str = "@TAR_ARGS@";
pub const TAG_MPI_CONFIGURE_ARGS: &str = "@MPI_CONFIGURE_ARGS@";
pub const TAG_INSTALL_CONFIG: &str = "@INSTALL_CONFIG@";
pub const TAG_DISTRO_NAME: &str = "@DISTRO_NAME@";
pub const TAG_DISTRO_CODENAME: &str = "@DISTRO_CODENAME@";
pub const TAG_APP_NAME: &str = "@APP_NAME@";
pub const TAG_APP_FETCH: &str = "@APP_FETCH@";
pub const TAG_APP_COMPILE: &str = "@APP_COMPILE@";
pub const TAG_APP_BINARY: &str = "@APP_BINARY@";
pub const TAG_APP_EXE: &str = "@APP_EXE@";
pub const TAG_APP_HOST_PATH: &str = "@APP_HOST_PATH@";
pub const TAG_MPI_MOUNT_DIR: &str = "@MPI_MOUNT_DIR@";

/// tags every definition has, whatever the model
const COMMON_TAGS: [&str; 6] = [
    TAG_MPI_IMPLEMENTATION,
    TAG_MPI_VERSION,
    TAG_DISTRO_NAME,
    TAG_DISTRO_CODENAME,
    TAG_APP_NAME,
    TAG_APP_EXE,
];

const HYBRID_TAGS: [&str; 6] = [
    TAG_MPI_URL,
    TAG_MPI_TARBALL,
    TAG_TAR_ARGS,
    TAG_APP_FETCH,
    TAG_APP_COMPILE,
    TAG_APP_BINARY,
];

const BIND_TAGS: [&str; 2] = [TAG_APP_HOST_PATH, TAG_MPI_MOUNT_DIR];

/// MPI prefix inside hybrid images
pub const IMAGE_MPI_DIR: &str = "/opt/mpi";
/// mount point of the host MPI inside bind images
pub const BIND_MOUNT_DIR: &str = "/opt/mpi";

const HYBRID_AUTOTOOLS: &str = include_str!("../../templates/hybrid_autotools.def");
const HYBRID_INSTALLER: &str = include_str!("../../templates/hybrid_installer.def");
const BIND: &str = include_str!("../../templates/bind.def");

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Template lacks required placeholder {0}")]
    MissingPlaceholder(&'static str),
    #[error("Required field `{0}` is not set")]
    MissingField(&'static str),
    #[error("Application source {0} cannot be fetched inside an image")]
    UnsupportedAppSource(String),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
/// Per-build values substituted into a definition template
pub struct DefinitionRequest<'a> {
    pub release: &'a MpiRelease,
    pub model: MpiModel,
    pub distro: &'a Distro,
    pub app: &'a ApplicationConfig,
    pub configure_args: Vec<String>,
    /// application compiled on the host, bind model only
    pub app_host_path: Option<&'a Path>,
}

/// Placeholders a template for `implementation` in `model` must contain
pub fn required_tags(implementation: Implementation, model: MpiModel) -> Vec<&'static str> {
    let mut tags = COMMON_TAGS.to_vec();

    match model {
        MpiModel::Hybrid => {
            tags.extend(HYBRID_TAGS);
            tags.push(implementation.template_tag());
        }
        MpiModel::Bind => tags.extend(BIND_TAGS),
    }

    tags.sort_unstable();
    tags.dedup();
    tags
}

/// Template for `implementation`/`category`/`model`.
///
/// `<templates_dir>/<impl>-<category>-<model>.def` wins over the built-in template.
pub fn load_template(
    templates_dir: &Path,
    implementation: Implementation,
    category: TestCategory,
    model: MpiModel,
) -> Result<String, TemplateError> {
    let custom = templates_dir.join(format!("{implementation}-{category}-{model}.def"));

    if custom.is_file() {
        debug!(template = ?custom, "Using custom template");
        return fs::read_to_string(&custom).map_err(|source| TemplateError::Io {
            path: custom,
            source,
        });
    }

    Ok(String::from(match (model, implementation.install_flow()) {
        (MpiModel::Bind, _) => BIND,
        (MpiModel::Hybrid, InstallFlow::Autotools) => HYBRID_AUTOTOOLS,
        (MpiModel::Hybrid, InstallFlow::SilentInstaller) => HYBRID_INSTALLER,
    }))
}

/// shell lines fetching the application inside the image, leaving the shell in its source dir
fn app_fetch(app: &ApplicationConfig) -> Result<String, TemplateError> {
    let name = artifact_name(&app.url);

    match classify(&app.url) {
        Ok(SourceKind::Http) => Ok(format!(
            "wget -q {url}\n    mkdir -p app-src && tar -C app-src {flag} {name}\n    cd app-src/*",
            url = app.url,
            flag = extraction_flag(detect_format(&name)?),
        )),
        Ok(SourceKind::SourceControl) => Ok(format!(
            "git clone {url} {name}\n    cd {name}",
            url = app.url.strip_prefix("git+").unwrap_or(&app.url),
        )),
        Ok(SourceKind::File) | Err(_) => Err(TemplateError::UnsupportedAppSource(app.url.clone())),
    }
}

/// Substitute all placeholders of `template` for `request`
pub fn render(template: &str, request: &DefinitionRequest) -> Result<String, TemplateError> {
    let release = request.release;

    for (field, value) in [
        ("MPI version", &release.version),
        ("MPI URL", &release.url),
        ("MPI tarball", &release.tarball),
    ] {
        if value.is_empty() {
            return Err(TemplateError::MissingField(field));
        }
    }

    for tag in required_tags(release.implementation, request.model) {
        if !template.contains(tag) {
            return Err(TemplateError::MissingPlaceholder(tag));
        }
    }

    let mut substitutions = vec![
        (TAG_MPI_IMPLEMENTATION, release.implementation.id().to_owned()),
        (TAG_MPI_VERSION, release.version.clone()),
        (TAG_MPI_URL, release.url.clone()),
        (TAG_MPI_TARBALL, release.tarball.clone()),
        (TAG_DISTRO_NAME, request.distro.name.clone()),
        (TAG_DISTRO_CODENAME, request.distro.codename.clone()),
        (TAG_APP_NAME, request.app.name.clone()),
        (
            TAG_APP_EXE,
            request.app.container_exe().display().to_string(),
        ),
        (TAG_MPI_CONFIGURE_ARGS, request.configure_args.join(" ")),
    ];

    match request.model {
        MpiModel::Hybrid => {
            substitutions.push((
                TAG_TAR_ARGS,
                extraction_flag(detect_format(&release.tarball)?).to_owned(),
            ));
            substitutions.push((TAG_APP_FETCH, app_fetch(request.app)?));
            substitutions.push((TAG_APP_COMPILE, request.app.compile.clone()));
            substitutions.push((TAG_APP_BINARY, request.app.binary.clone()));
            if let Some(config) = release
                .implementation
                .installer_config(Path::new(IMAGE_MPI_DIR), InstallerMode::Install)
            {
                substitutions.push((TAG_INSTALL_CONFIG, config.trim_end().to_owned()));
            }
        }
        MpiModel::Bind => {
            let host_path = request
                .app_host_path
                .ok_or(TemplateError::MissingField("application host path"))?;
            substitutions.push((TAG_APP_HOST_PATH, host_path.display().to_string()));
            substitutions.push((TAG_MPI_MOUNT_DIR, BIND_MOUNT_DIR.to_owned()));
        }
    }

    Ok(substitutions
        .into_iter()
        .fold(template.to_owned(), |content, (tag, value)| {
            content.replace(tag, &value)
        }))
}

/// Render `template` for `request` into `definition`
pub fn generate(
    template: &str,
    request: &DefinitionRequest,
    definition: &Path,
) -> Result<(), TemplateError> {
    let content = render(template, request)?;
    let io_error = |source| TemplateError::Io {
        path: definition.to_path_buf(),
        source,
    };

    if let Some(parent) = definition.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }
    fs::write(definition, content).map_err(io_error)?;
    info!(definition = ?definition, "Generated container definition");

    Ok(())
}
