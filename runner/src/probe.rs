use crate::process::{self, find_in_path, Invocation, DEFAULT_TIMEOUT};
use nix::unistd::Uid;
use std::{fs, path::Path};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const INFINIBAND_SYSFS: &str = "/sys/class/infiniband";

/// minimal image used to find out how images can be built here
const PROBE_DEFINITION: &str = "Bootstrap: docker\nFrom: busybox:latest\n";

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Required tools missing from PATH: {}", .0.join(", "))]
    MissingPrerequisites(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Capabilities of the host, detected once and persisted in the tool configuration
pub struct Capabilities {
    pub build_privilege: bool,
    /// building only works through `sudo`
    pub needs_sudo: bool,
    pub fakeroot: bool,
    pub slurm: bool,
    pub infiniband: bool,
}

pub fn is_root() -> bool {
    Uid::effective().is_root()
}

pub fn slurm_available() -> bool {
    find_in_path("sbatch").is_some()
}

/// whether at least one Infiniband device is registered
pub fn infiniband_available() -> bool {
    infiniband_in(Path::new(INFINIBAND_SYSFS))
}

fn infiniband_in(sysfs: &Path) -> bool {
    fs::read_dir(sysfs)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn try_build(engine: &str, scratch: &Path, extra: &[&str], sudo: bool) -> bool {
    let definition = scratch.join("probe.def");
    let image = scratch.join("probe.sif");

    if let Err(error) =
        fs::create_dir_all(scratch).and_then(|_| fs::write(&definition, PROBE_DEFINITION))
    {
        warn!(error = ?error, scratch = ?scratch, "Unable to prepare build probe");
        return false;
    }

    let mut invocation = Invocation::new(engine)
        .arg("build")
        .arg("--force")
        .args(extra)
        .arg(&image)
        .arg(&definition);
    if sudo {
        invocation = invocation.with_sudo();
    }

    let succeeded = match process::run(&invocation, DEFAULT_TIMEOUT) {
        Ok(output) => output.success(),
        Err(error) => {
            debug!(error = ?error, "Build probe could not run");
            false
        }
    };
    let _ = fs::remove_file(&image);

    succeeded
}

/// Probe what this host can do. Never fails, missing tools just disable the capability.
pub fn detect(engine: &str, scratch: &Path) -> Capabilities {
    let mut capabilities = Capabilities {
        slurm: slurm_available(),
        infiniband: infiniband_available(),
        ..Capabilities::default()
    };

    if find_in_path(engine).is_none() {
        warn!(engine = engine, "Container engine not found, images can only be pulled");
    } else if is_root() {
        capabilities.build_privilege = try_build(engine, scratch, &[], false);
    } else if try_build(engine, scratch, &["--fakeroot"], false) {
        capabilities.build_privilege = true;
        capabilities.fakeroot = true;
    } else if try_build(engine, scratch, &[], true) {
        capabilities.build_privilege = true;
        capabilities.needs_sudo = true;
    }

    info!(
        build_privilege = capabilities.build_privilege,
        fakeroot = capabilities.fakeroot,
        sudo = capabilities.needs_sudo,
        slurm = capabilities.slurm,
        infiniband = capabilities.infiniband,
        "Detected capabilities"
    );

    capabilities
}

/// Check that every external tool a run may need is on PATH
pub fn check_prerequisites(engine: &str) -> Result<(), SetupError> {
    let alternatives: [&[&str]; 6] = [
        &["gcc", "cc"],
        &["make"],
        &["tar"],
        &[engine],
        &["curl", "wget"],
        &["git"],
    ];

    let missing: Vec<String> = alternatives
        .iter()
        .filter(|tools| tools.iter().all(|tool| find_in_path(tool).is_none()))
        .map(|tools| tools.join("|"))
        .collect();

    if missing.is_empty() {
        debug!("All prerequisites found");
        return Ok(());
    }

    for tool in missing.iter() {
        error!(tool = %tool, "Missing prerequisite");
    }

    Err(SetupError::MissingPrerequisites(missing))
}
