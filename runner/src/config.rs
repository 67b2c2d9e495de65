use crate::{
    container::MpiModel,
    implementation::MpiRelease,
    probe::{self, Capabilities},
    process::JOB_TIMEOUT,
};
use itertools::Itertools;
use std::{
    collections::BTreeMap,
    env, fmt, fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const WORKSPACE_ENV: &str = "MPICOMPAT_WORKSPACE";
pub const SIGN_PASSPHRASE_ENV: &str = "MPICOMPAT_SIGN_PASSPHRASE";
pub const SIGN_KEYIDX_ENV: &str = "MPICOMPAT_SIGN_KEYIDX";

const KEY_BUILD_PRIVILEGE: &str = "build_privilege";
const KEY_SUDO_COMMANDS: &str = "sudo_commands";
const KEY_FORCE_UNPRIVILEGED: &str = "force_unprivileged";
const KEY_FAKEROOT: &str = "fakeroot";
const KEY_SLURM: &str = "slurm";
const KEY_INFINIBAND: &str = "infiniband";
const KEY_FORCE_INFINIBAND: &str = "force_infiniband";
const KEY_CONTAINER_ENGINE: &str = "container_engine";

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: expected `key = value`")]
    InvalidLine { path: PathBuf, line: usize },
    #[error("Invalid value `{value}` for `{key}`")]
    InvalidValue { key: String, value: String },
    #[error("Matrix configuration mixes {first} and {second}")]
    MixedImplementations { first: String, second: String },
    #[error("Unable to derive an MPI implementation and version from `{0}`")]
    UnknownImplementation(String),
    #[error("Matrix configuration {0} does not declare any version")]
    EmptyMatrix(PathBuf),
    #[error("Application configuration is invalid: {0}")]
    InvalidApplicationConfig(#[from] serde_yaml::Error),
    #[error("Application configuration is missing `{0}`")]
    MissingField(&'static str),
    #[error("Invalid output pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
    #[error("{path}:{line}: OFI settings must be `KEY=VALUE`")]
    InvalidOfiConfig { path: PathBuf, line: usize },
    #[error("Distribution `{0}` must be given as `name:codename`")]
    InvalidDistro(String),
    #[error("Environment variable {var} has invalid value `{value}`")]
    InvalidEnv { var: &'static str, value: String },
    #[error("Neither MPICOMPAT_WORKSPACE nor HOME is set")]
    NoWorkspace,
}

impl ConfigErrors {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Parse `key = value` lines, skipping blanks and `#` comments.
/// Returns the 1-based number of the first malformed line as error.
pub fn parse_key_values(content: &str, separator: char) -> Result<Vec<(String, String)>, usize> {
    content
        .lines()
        .enumerate()
        .map(|(number, line)| (number + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(number, line)| match line.split_once(separator) {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_owned(), value.trim().to_owned()))
            }
            _ => Err(number),
        })
        .collect()
}

fn read_optional(path: &Path) -> Result<Option<String>, ConfigErrors> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
        Err(error) => Err(ConfigErrors::io(path, error)),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigErrors> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        _ => Err(ConfigErrors::InvalidValue {
            key: key.to_owned(),
            value: value.to_owned(),
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Persisted, human editable capabilities of this installation.
///
/// Read once at startup and treated as immutable for the rest of the run. The only write path is
/// `persist`, used after capabilities were auto detected for the first time.
pub struct ToolConfig {
    /// container images can be built locally
    pub build_privilege: bool,
    /// commands that have to be prefixed with `sudo`
    pub sudo_commands: Vec<String>,
    /// never elevate privileges, even when `sudo_commands` lists the engine
    pub force_unprivileged: bool,
    /// build images with `--fakeroot`
    pub fakeroot: bool,
    pub slurm: bool,
    pub infiniband: bool,
    pub force_infiniband: bool,
    pub container_engine: String,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            build_privilege: false,
            sudo_commands: Vec::new(),
            force_unprivileged: false,
            fakeroot: false,
            slurm: false,
            infiniband: false,
            force_infiniband: false,
            container_engine: String::from("singularity"),
        }
    }
}

impl ToolConfig {
    /// Parse the content of a tool configuration file, returning the capability keys that were
    /// absent and still need to be probed.
    pub fn parse(path: &Path, content: &str) -> Result<(Self, Vec<&'static str>), ConfigErrors> {
        let values: BTreeMap<String, String> = parse_key_values(content, '=')
            .map_err(|line| ConfigErrors::InvalidLine {
                path: path.to_path_buf(),
                line,
            })?
            .into_iter()
            .collect();

        let mut config = Self::default();
        let mut missing = Vec::new();

        for key in [KEY_BUILD_PRIVILEGE, KEY_FAKEROOT, KEY_SLURM, KEY_INFINIBAND] {
            if !values.contains_key(key) {
                missing.push(key);
            }
        }

        for (key, value) in values.iter() {
            match key.as_str() {
                KEY_BUILD_PRIVILEGE => config.build_privilege = parse_bool(key, value)?,
                KEY_FORCE_UNPRIVILEGED => config.force_unprivileged = parse_bool(key, value)?,
                KEY_FAKEROOT => config.fakeroot = parse_bool(key, value)?,
                KEY_SLURM => config.slurm = parse_bool(key, value)?,
                KEY_INFINIBAND => config.infiniband = parse_bool(key, value)?,
                KEY_FORCE_INFINIBAND => config.force_infiniband = parse_bool(key, value)?,
                KEY_SUDO_COMMANDS => {
                    config.sudo_commands = value
                        .split(',')
                        .map(str::trim)
                        .filter(|command| !command.is_empty())
                        .map(str::to_owned)
                        .collect()
                }
                KEY_CONTAINER_ENGINE => {
                    if value.is_empty() {
                        return Err(ConfigErrors::InvalidValue {
                            key: key.clone(),
                            value: value.clone(),
                        });
                    }
                    config.container_engine = value.clone();
                }
                unknown => warn!(key = unknown, path = ?path, "Ignoring unknown configuration key"),
            }
        }

        Ok((config, missing))
    }

    /// Load the tool configuration, probing and persisting capabilities that are not recorded yet.
    pub fn load_or_probe(path: &Path, scratch: &Path) -> Result<Self, ConfigErrors> {
        let content = read_optional(path)?.unwrap_or_default();
        let (mut config, missing) = Self::parse(path, &content)?;

        if missing.is_empty() {
            debug!(path = ?path, "Loaded tool configuration");
            return Ok(config);
        }

        info!(missing = %missing.iter().join(", "), "Detecting capabilities");
        let detected = probe::detect(&config.container_engine, scratch);
        config.apply(&detected, &missing);
        config.persist(path)?;

        Ok(config)
    }

    fn apply(&mut self, detected: &Capabilities, missing: &[&'static str]) {
        for key in missing {
            match *key {
                KEY_BUILD_PRIVILEGE => {
                    self.build_privilege = detected.build_privilege;
                    if detected.needs_sudo && !self.sudo_commands.contains(&self.container_engine)
                    {
                        self.sudo_commands.push(self.container_engine.clone());
                    }
                }
                KEY_FAKEROOT => self.fakeroot = detected.fakeroot,
                KEY_SLURM => self.slurm = detected.slurm,
                KEY_INFINIBAND => self.infiniband = detected.infiniband,
                _ => {}
            }
        }
    }

    /// Write the configuration back to `path`
    pub fn persist(&self, path: &Path) -> Result<(), ConfigErrors> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| ConfigErrors::io(parent, error))?;
        }

        fs::write(path, self.to_string()).map_err(|error| ConfigErrors::io(path, error))?;
        info!(path = ?path, "Saved tool configuration");

        Ok(())
    }

    /// whether `command` has to run with elevated privileges
    pub fn needs_sudo(&self, command: &str) -> bool {
        !self.force_unprivileged && self.sudo_commands.iter().any(|entry| entry == command)
    }

    pub fn infiniband_enabled(&self) -> bool {
        self.infiniband || self.force_infiniband
    }
}

impl fmt::Display for ToolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# capabilities of this installation, edit with care")?;
        writeln!(f, "{KEY_BUILD_PRIVILEGE} = {}", self.build_privilege)?;
        writeln!(f, "{KEY_SUDO_COMMANDS} = {}", self.sudo_commands.join(","))?;
        writeln!(f, "{KEY_FORCE_UNPRIVILEGED} = {}", self.force_unprivileged)?;
        writeln!(f, "{KEY_FAKEROOT} = {}", self.fakeroot)?;
        writeln!(f, "{KEY_SLURM} = {}", self.slurm)?;
        writeln!(f, "{KEY_INFINIBAND} = {}", self.infiniband)?;
        writeln!(f, "{KEY_FORCE_INFINIBAND} = {}", self.force_infiniband)?;
        writeln!(f, "{KEY_CONTAINER_ENGINE} = {}", self.container_engine)
    }
}

/// Load OFI settings (`KEY=VALUE`) forwarded to Intel MPI jobs; a missing file means no settings
pub fn load_ofi(path: &Path) -> Result<Vec<(String, String)>, ConfigErrors> {
    match read_optional(path)? {
        Some(content) => {
            parse_key_values(&content, '=').map_err(|line| ConfigErrors::InvalidOfiConfig {
                path: path.to_path_buf(),
                line,
            })
        }
        None => Ok(Vec::new()),
    }
}

/// Load the version keyed image registry (`<impl>-<version>-<category> = <url>`)
pub fn load_registry(path: &Path) -> Result<BTreeMap<String, String>, ConfigErrors> {
    match read_optional(path)? {
        Some(content) => parse_key_values(&content, '=')
            .map(|entries| entries.into_iter().collect())
            .map_err(|line| ConfigErrors::InvalidLine {
                path: path.to_path_buf(),
                line,
            }),
        None => Ok(BTreeMap::new()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Distro {
    pub name: String,
    pub codename: String,
}

impl FromStr for Distro {
    type Err = ConfigErrors;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.split_once(':') {
            Some((name, codename)) if !name.is_empty() && !codename.is_empty() => Ok(Self {
                name: name.to_owned(),
                codename: codename.to_owned(),
            }),
            _ => Err(ConfigErrors::InvalidDistro(value.to_owned())),
        }
    }
}

impl fmt::Display for Distro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.codename)
    }
}

impl Default for Distro {
    fn default() -> Self {
        Self {
            name: String::from("ubuntu"),
            codename: String::from("focal"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SigningKey {
    pub index: u32,
    pub passphrase: Option<String>,
}

impl SigningKey {
    /// Signing is enabled once a key index is exported
    pub fn from_env() -> Result<Option<Self>, ConfigErrors> {
        match env::var(SIGN_KEYIDX_ENV) {
            Ok(value) => {
                let index = value.trim().parse().map_err(|_| ConfigErrors::InvalidEnv {
                    var: SIGN_KEYIDX_ENV,
                    value: value.clone(),
                })?;

                Ok(Some(Self {
                    index,
                    passphrase: env::var(SIGN_PASSPHRASE_ENV).ok(),
                }))
            }
            Err(_) => Ok(None),
        }
    }
}

#[derive(Debug, Clone)]
/// On-disk layout for build artifacts; all paths are keyed by implementation and version
pub struct Layout {
    pub root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn install_dir(&self, release: &MpiRelease) -> PathBuf {
        self.root.join("install").join(release.key())
    }

    pub fn build_dir(&self, release: &MpiRelease) -> PathBuf {
        self.root.join("build").join(release.key())
    }

    pub fn scratch_dir(&self, name: &str) -> PathBuf {
        self.root.join("scratch").join(name)
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.root.join("apps")
    }
}

#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_env() -> Result<Self, ConfigErrors> {
        if let Some(root) = env::var_os(WORKSPACE_ENV) {
            return Ok(Self::new(root));
        }

        env::var_os("HOME")
            .map(|home| Self::new(PathBuf::from(home).join(".mpicompat")))
            .ok_or(ConfigErrors::NoWorkspace)
    }

    pub fn etc_dir(&self) -> PathBuf {
        self.root.join("etc")
    }

    pub fn tool_config_path(&self) -> PathBuf {
        self.etc_dir().join("mpicompat.conf")
    }

    pub fn ofi_config_path(&self) -> PathBuf {
        self.etc_dir().join("ofi.conf")
    }

    pub fn registry_config_path(&self) -> PathBuf {
        self.etc_dir().join("registry.conf")
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.etc_dir().join("templates")
    }

    /// persistent artifacts live directly under the workspace
    pub fn layout(&self) -> Layout {
        Layout::new(&self.root)
    }
}

#[derive(Debug, Clone)]
/// Everything a run needs, constructed once in `main` and passed by reference
pub struct Context {
    pub tool: ToolConfig,
    pub workspace: Workspace,
    pub distro: Distro,
    pub model: MpiModel,
    pub persistent: bool,
    pub nrun: usize,
    pub ranks: usize,
    pub nodes: usize,
    pub job_timeout: Duration,
    pub signing: Option<SigningKey>,
    pub push_registry: Option<String>,
    pub ofi: Vec<(String, String)>,
    pub image_registry: BTreeMap<String, String>,
}

impl Context {
    pub fn new(tool: ToolConfig, workspace: Workspace) -> Self {
        Self {
            tool,
            workspace,
            distro: Distro::default(),
            model: MpiModel::Hybrid,
            persistent: false,
            nrun: 1,
            ranks: 2,
            nodes: 2,
            job_timeout: JOB_TIMEOUT,
            signing: None,
            push_registry: None,
            ofi: Vec::new(),
            image_registry: BTreeMap::new(),
        }
    }
}
