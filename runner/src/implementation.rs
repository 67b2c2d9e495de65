use crate::{
    buildenv::fetch::artifact_name,
    config::{ConfigErrors, ToolConfig},
    container::definition::{TAG_INSTALL_CONFIG, TAG_MPI_CONFIGURE_ARGS},
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

static OPENMPI_TARBALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"openmpi-(\d+(?:\.\d+)*(?:[a-z]+\d*)?)\.(?:tar|tgz)").unwrap());
static MPICH_TARBALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"mpich-(\d+(?:\.\d+)*(?:[a-z]+\d*)?)\.(?:tar|tgz)").unwrap());
static INTEL_TARBALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"l_mpi_(\d+(?:\.\d+)*)\.(?:tar|tgz)").unwrap());

/// Path of the Intel MPI binaries relative to its install prefix
pub const INTEL_BIN_DIR: &str = "compilers_and_libraries/linux/mpi/intel64/bin";
const INTEL_LIB_DIR: &str = "compilers_and_libraries/linux/mpi/intel64/lib";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// The closed set of supported MPI implementations
pub enum Implementation {
    OpenMPI,
    MPICH,
    IntelMPI,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How an implementation gets from source to an install prefix
pub enum InstallFlow {
    /// configure, make, make install
    Autotools,
    /// vendor installer driven by a generated install/uninstall configuration file
    SilentInstaller,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallerMode {
    Install,
    Uninstall,
}

impl Implementation {
    pub const ALL: [Self; 3] = [Self::OpenMPI, Self::MPICH, Self::IntelMPI];

    pub fn id(self) -> &'static str {
        match self {
            Self::OpenMPI => "openmpi",
            Self::MPICH => "mpich",
            Self::IntelMPI => "intel",
        }
    }

    fn tarball_pattern(self) -> &'static Regex {
        match self {
            Self::OpenMPI => &OPENMPI_TARBALL,
            Self::MPICH => &MPICH_TARBALL,
            Self::IntelMPI => &INTEL_TARBALL,
        }
    }

    /// Extract the implementation and version from a download URL
    pub fn detect(url: &str) -> Option<(Self, String)> {
        Self::ALL.into_iter().find_map(|implementation| {
            implementation
                .tarball_pattern()
                .captures(url)
                .and_then(|captures| captures.get(1))
                .map(|version| (implementation, version.as_str().to_owned()))
        })
    }

    pub fn install_flow(self) -> InstallFlow {
        match self {
            Self::OpenMPI | Self::MPICH => InstallFlow::Autotools,
            Self::IntelMPI => InstallFlow::SilentInstaller,
        }
    }

    /// additional arguments for `configure`
    pub fn configure_args(self, tool: &ToolConfig) -> Vec<String> {
        let mut args = Vec::new();

        match self {
            Self::OpenMPI => {
                if tool.slurm {
                    args.push(String::from("--with-slurm"));
                }
                if tool.infiniband_enabled() {
                    args.push(String::from("--with-verbs"));
                }
            }
            Self::MPICH => {
                args.push(String::from("--disable-fortran"));
                if tool.slurm {
                    args.push(String::from("--with-slurm"));
                }
            }
            Self::IntelMPI => {}
        }

        args
    }

    /// additional arguments for the launcher (network transport selection)
    pub fn launch_args(self, tool: &ToolConfig) -> Vec<String> {
        match self {
            Self::OpenMPI if tool.infiniband_enabled() => ["--mca", "btl", "openib,self,vader"]
                .into_iter()
                .map(String::from)
                .collect(),
            Self::OpenMPI | Self::MPICH | Self::IntelMPI => Vec::new(),
        }
    }

    /// additional launch environment, OFI settings are appended last so they win
    pub fn launch_env(self, tool: &ToolConfig, ofi: &[(String, String)]) -> Vec<(String, String)> {
        match self {
            Self::IntelMPI => {
                let provider = if tool.infiniband_enabled() { "verbs" } else { "tcp" };
                let mut env = vec![
                    (String::from("I_MPI_FABRICS"), String::from("shm:ofi")),
                    (String::from("FI_PROVIDER"), String::from(provider)),
                ];
                env.extend(ofi.iter().cloned());

                env
            }
            Self::OpenMPI | Self::MPICH => Vec::new(),
        }
    }

    /// placeholder specific to how a hybrid image installs this implementation
    pub fn template_tag(self) -> &'static str {
        match self.install_flow() {
            InstallFlow::Autotools => TAG_MPI_CONFIGURE_ARGS,
            // the installer takes no configure arguments, but a generated configuration
            InstallFlow::SilentInstaller => TAG_INSTALL_CONFIG,
        }
    }

    pub fn bin_dir(self, install_dir: &Path) -> PathBuf {
        match self {
            Self::IntelMPI => install_dir.join(INTEL_BIN_DIR),
            Self::OpenMPI | Self::MPICH => install_dir.join("bin"),
        }
    }

    pub fn lib_dir(self, install_dir: &Path) -> PathBuf {
        match self {
            Self::IntelMPI => install_dir.join(INTEL_LIB_DIR),
            Self::OpenMPI | Self::MPICH => install_dir.join("lib"),
        }
    }

    pub fn launcher(self) -> &'static str {
        match self {
            Self::OpenMPI | Self::IntelMPI => "mpirun",
            Self::MPICH => "mpiexec",
        }
    }

    /// Configuration file for the silent installer, `None` for autotools based implementations
    pub fn installer_config(self, install_dir: &Path, mode: InstallerMode) -> Option<String> {
        match self.install_flow() {
            InstallFlow::Autotools => None,
            InstallFlow::SilentInstaller => Some(format!(
                "ACCEPT_EULA=accept\n\
                 CONTINUE_WITH_OPTIONAL_ERROR=yes\n\
                 PSET_INSTALL_DIR={}\n\
                 CONTINUE_WITH_INSTALLDIR_OVERWRITE=yes\n\
                 PSET_MODE={}\n\
                 ARCH_SELECTED=ALL\n\
                 COMPONENTS=DEFAULTS\n",
                install_dir.display(),
                match mode {
                    InstallerMode::Install => "install",
                    InstallerMode::Uninstall => "uninstall",
                }
            )),
        }
    }
}

impl fmt::Display for Implementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Implementation {
    type Err = ConfigErrors;

    fn from_str(id: &str) -> Result<Self, Self::Err> {
        lookup(id)
    }
}

/// Resolve an implementation identifier (`openmpi`, `mpich`, `intel`)
pub fn lookup(id: &str) -> Result<Implementation, ConfigErrors> {
    match id.to_lowercase().as_str() {
        "openmpi" | "ompi" => Ok(Implementation::OpenMPI),
        "mpich" => Ok(Implementation::MPICH),
        "intel" | "impi" | "intelmpi" => Ok(Implementation::IntelMPI),
        _ => Err(ConfigErrors::UnknownImplementation(id.to_owned())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// One buildable release of an MPI implementation
pub struct MpiRelease {
    pub implementation: Implementation,
    pub version: String,
    pub url: String,
    pub tarball: String,
}

impl MpiRelease {
    pub fn new(implementation: Implementation, version: &str, url: &str) -> Self {
        Self {
            implementation,
            version: version.to_owned(),
            url: url.to_owned(),
            tarball: artifact_name(url),
        }
    }

    /// `<impl>-<version>`, used to key install, build and image paths
    pub fn key(&self) -> String {
        format!("{}-{}", self.implementation.id(), self.version)
    }
}

impl fmt::Display for MpiRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.implementation, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_versions_from_urls() {
        assert_eq!(
            Implementation::detect(
                "https://download.open-mpi.org/release/open-mpi/v3.1/openmpi-3.1.4.tar.bz2"
            ),
            Some((Implementation::OpenMPI, String::from("3.1.4")))
        );
        assert_eq!(
            Implementation::detect("http://www.mpich.org/static/downloads/3.3/mpich-3.3.tar.gz"),
            Some((Implementation::MPICH, String::from("3.3")))
        );
        assert_eq!(
            Implementation::detect("file:///opt/installers/l_mpi_2019.6.166.tgz"),
            Some((Implementation::IntelMPI, String::from("2019.6.166")))
        );
        assert_eq!(
            Implementation::detect("https://example.org/openmpi-4.0.0rc1.tar.gz"),
            Some((Implementation::OpenMPI, String::from("4.0.0rc1")))
        );
        assert_eq!(Implementation::detect("https://example.org/hello.tar.gz"), None);
    }

    #[test]
    fn intel_is_a_silent_installer() {
        let install = Path::new("/opt/intel");

        assert_eq!(
            Implementation::IntelMPI.install_flow(),
            InstallFlow::SilentInstaller
        );
        assert_eq!(
            Implementation::IntelMPI.bin_dir(install),
            install.join("compilers_and_libraries/linux/mpi/intel64/bin")
        );

        let config = Implementation::IntelMPI
            .installer_config(install, InstallerMode::Uninstall)
            .unwrap();
        assert!(config.contains("PSET_INSTALL_DIR=/opt/intel\n"));
        assert!(config.contains("PSET_MODE=uninstall\n"));
        assert!(Implementation::OpenMPI
            .installer_config(install, InstallerMode::Install)
            .is_none());
    }

    #[test]
    fn capabilities_drive_extra_arguments() {
        let tool = ToolConfig {
            slurm: true,
            force_infiniband: true,
            ..ToolConfig::default()
        };

        assert!(Implementation::OpenMPI
            .configure_args(&tool)
            .contains(&String::from("--with-slurm")));
        assert_eq!(
            Implementation::OpenMPI.launch_args(&tool),
            vec!["--mca", "btl", "openib,self,vader"]
        );
        assert!(Implementation::OpenMPI
            .launch_args(&ToolConfig::default())
            .is_empty());
    }

    #[test]
    fn ofi_settings_override_intel_defaults() {
        let env = Implementation::IntelMPI.launch_env(
            &ToolConfig::default(),
            &[(String::from("FI_PROVIDER"), String::from("sockets"))],
        );

        assert_eq!(
            env.last(),
            Some(&(String::from("FI_PROVIDER"), String::from("sockets")))
        );
    }

    #[test]
    fn lookup_rejects_unknown_ids() {
        assert_eq!(lookup("OpenMPI").unwrap(), Implementation::OpenMPI);
        assert!(lookup("mvapich").is_err());
    }
}
