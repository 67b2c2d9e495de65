use crate::process::{self, find_in_path, Invocation, ProcessError, RunOutput, BUILD_TIMEOUT};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Unrecognized URL scheme: {0}")]
    UnsupportedScheme(String),
    #[error("No transfer tool available, install curl or wget")]
    NoTransferTool,
    #[error("Source-control client unavailable: {0}")]
    Tool(#[from] ProcessError),
    #[error("Failed to stage {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Fetching {url} failed")]
    Transfer { url: String, output: RunOutput },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    File,
    Http,
    SourceControl,
}

pub fn classify(url: &str) -> Result<SourceKind, FetchError> {
    if url.starts_with("git://")
        || url.starts_with("git+")
        || url.starts_with("ssh://")
        || url.trim_end_matches('/').ends_with(".git")
    {
        Ok(SourceKind::SourceControl)
    } else if url.starts_with("http://") || url.starts_with("https://") || url.starts_with("ftp://")
    {
        Ok(SourceKind::Http)
    } else if url.starts_with("file://") || url.starts_with('/') {
        Ok(SourceKind::File)
    } else {
        Err(FetchError::UnsupportedScheme(url.to_owned()))
    }
}

/// File name derived from a URL: last path segment without query, fragment or `.git`
pub fn artifact_name(url: &str) -> String {
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url)
        .trim_end_matches('/');
    let name = path.rsplit('/').next().unwrap_or(path);

    name.strip_suffix(".git").unwrap_or(name).to_owned()
}

fn local_path(url: &str) -> PathBuf {
    PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
}

fn transfer(invocation: Invocation, url: &str) -> Result<(), FetchError> {
    let output = process::run(&invocation, BUILD_TIMEOUT)?;

    if output.success() {
        Ok(())
    } else {
        Err(FetchError::Transfer {
            url: url.to_owned(),
            output,
        })
    }
}

/// Stage the package behind `url` into `dir`, returning the path of the staged artifact.
///
/// Downloads and copies are skipped when the artifact is already staged. Checkouts are updated
/// with a pull.
pub fn fetch(url: &str, dir: &Path) -> Result<PathBuf, FetchError> {
    let target = dir.join(artifact_name(url));
    let io_error = |source| FetchError::Io {
        path: target.clone(),
        source,
    };

    fs::create_dir_all(dir).map_err(io_error)?;

    match classify(url)? {
        SourceKind::File => {
            if target.exists() {
                debug!(target = ?target, "Already staged");
                return Ok(target);
            }

            let source = local_path(url);
            info!(source = ?source, target = ?target, "Copying");
            if source.is_dir() {
                transfer(
                    Invocation::new("cp").arg("-a").arg(&source).arg(&target),
                    url,
                )?;
            } else {
                fs::copy(&source, &target).map_err(|source| FetchError::Io {
                    path: target.clone(),
                    source,
                })?;
            }
        }
        SourceKind::Http => {
            if target.exists() {
                debug!(target = ?target, "Already downloaded");
                return Ok(target);
            }

            info!(url = url, target = ?target, "Downloading");
            let invocation = if let Some(curl) = find_in_path("curl") {
                Invocation::new(curl).args(["-fsSL", "-o"]).arg(&target).arg(url)
            } else if let Some(wget) = find_in_path("wget") {
                Invocation::new(wget).args(["-q", "-O"]).arg(&target).arg(url)
            } else {
                return Err(FetchError::NoTransferTool);
            };

            if let Err(error) = transfer(invocation, url) {
                // never leave a partial download behind, it would count as staged
                let _ = fs::remove_file(&target);
                return Err(error);
            }
        }
        SourceKind::SourceControl => {
            let git = process::require("git")?;
            let url = url.strip_prefix("git+").unwrap_or(url);

            if target.join(".git").is_dir() {
                info!(checkout = ?target, "Updating checkout");
                transfer(
                    Invocation::new(git).arg("-C").arg(&target).arg("pull"),
                    url,
                )?;
            } else {
                info!(url = url, target = ?target, "Cloning");
                transfer(
                    Invocation::new(git).arg("clone").arg(url).arg(&target),
                    url,
                )?;
            }
        }
    }

    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_urls() {
        assert_eq!(
            classify("https://example.org/openmpi-4.0.2.tar.gz").unwrap(),
            SourceKind::Http
        );
        assert_eq!(
            classify("https://github.com/user/c_hello_world.git").unwrap(),
            SourceKind::SourceControl
        );
        assert_eq!(
            classify("file:///tmp/mpich-3.3.tar.gz").unwrap(),
            SourceKind::File
        );
        assert!(matches!(
            classify("gopher://example.org/x"),
            Err(FetchError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn artifact_names_strip_decorations() {
        assert_eq!(
            artifact_name("https://example.org/openmpi-4.0.2.tar.gz?raw=true"),
            "openmpi-4.0.2.tar.gz"
        );
        assert_eq!(
            artifact_name("https://github.com/user/c_hello_world.git"),
            "c_hello_world"
        );
        assert_eq!(artifact_name("file:///opt/src/netpipe/"), "netpipe");
    }

    #[test]
    fn local_files_are_copied_once() {
        let source = tempfile::tempdir().unwrap();
        let build = tempfile::tempdir().unwrap();
        let tarball = source.path().join("mpich-3.3.tar");
        fs::write(&tarball, b"payload").unwrap();

        let url = format!("file://{}", tarball.display());
        let staged = fetch(&url, build.path()).unwrap();
        assert_eq!(staged, build.path().join("mpich-3.3.tar"));
        assert_eq!(fs::read(&staged).unwrap(), b"payload");

        // a changed source is not picked up again, the staged artifact wins
        fs::write(&tarball, b"changed").unwrap();
        fetch(&url, build.path()).unwrap();
        assert_eq!(fs::read(&staged).unwrap(), b"payload");
    }
}
