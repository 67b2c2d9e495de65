use crate::{
    config::ConfigErrors,
    implementation::{Implementation, MpiRelease},
};
use itertools::iproduct;
use std::{fmt, fs, path::Path};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
/// One cell of the compatibility matrix
pub struct ExperimentConfig {
    pub host: MpiRelease,
    pub container: MpiRelease,
}

impl ExperimentConfig {
    /// `<impl>-<host>-<container>`, unique per cell
    pub fn name(&self) -> String {
        format!(
            "{}-{}-{}",
            self.host.implementation, self.host.version, self.container.version
        )
    }
}

impl fmt::Display for ExperimentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "host {} / container {}",
            self.host, self.container.version
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// All releases of a single implementation declared in a matrix configuration file,
/// in declaration order
pub struct Matrix {
    pub implementation: Implementation,
    pub releases: Vec<MpiRelease>,
}

impl Matrix {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path).map_err(|error| ConfigErrors::io(path, error))?;

        Self::parse(&content).map_err(|error| match error {
            ConfigErrors::EmptyMatrix(_) => ConfigErrors::EmptyMatrix(path.to_path_buf()),
            other => other,
        })
    }

    /// Parse one download URL per line, `#` lines are comments
    pub fn parse(content: &str) -> Result<Self, ConfigErrors> {
        let mut implementation: Option<Implementation> = None;
        let mut releases: Vec<MpiRelease> = Vec::new();

        for line in content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
        {
            let (detected, version) = Implementation::detect(line)
                .ok_or_else(|| ConfigErrors::UnknownImplementation(line.to_owned()))?;

            match implementation {
                Some(first) if first != detected => {
                    return Err(ConfigErrors::MixedImplementations {
                        first: first.to_string(),
                        second: detected.to_string(),
                    })
                }
                _ => implementation = Some(detected),
            }

            if releases.iter().any(|release| release.version == version) {
                warn!(version = %version, url = line, "Version declared twice, keeping the first URL");
                continue;
            }

            debug!(implementation = %detected, version = %version, "Declared release");
            releases.push(MpiRelease::new(detected, &version, line));
        }

        match implementation {
            Some(implementation) => Ok(Self {
                implementation,
                releases,
            }),
            None => Err(ConfigErrors::EmptyMatrix(Default::default())),
        }
    }

    /// host x container, host major
    pub fn cells(&self) -> Vec<ExperimentConfig> {
        iproduct!(self.releases.iter(), self.releases.iter())
            .map(|(host, container)| ExperimentConfig {
                host: host.clone(),
                container: container.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OMPI_314: &str =
        "https://download.open-mpi.org/release/open-mpi/v3.1/openmpi-3.1.4.tar.bz2";
    const OMPI_402: &str =
        "https://download.open-mpi.org/release/open-mpi/v4.0/openmpi-4.0.2.tar.gz";

    #[test]
    fn parses_single_implementation() {
        let matrix = Matrix::parse(&format!("# Open MPI\n{OMPI_314}\n\n{OMPI_402}\n")).unwrap();

        assert_eq!(matrix.implementation, Implementation::OpenMPI);
        assert_eq!(matrix.releases.len(), 2);
        assert_eq!(matrix.releases[0].version, "3.1.4");
        assert_eq!(matrix.releases[0].url, OMPI_314);
        assert_eq!(matrix.releases[1].version, "4.0.2");
        assert_eq!(matrix.releases[1].tarball, "openmpi-4.0.2.tar.gz");
    }

    #[test]
    fn rejects_mixed_implementations() {
        let result = Matrix::parse(&format!(
            "{OMPI_314}\nhttp://www.mpich.org/static/downloads/3.3.2/mpich-3.3.2.tar.gz\n"
        ));

        assert!(matches!(
            result,
            Err(ConfigErrors::MixedImplementations { .. })
        ));
    }

    #[test]
    fn rejects_unknown_lines_and_empty_files() {
        assert!(matches!(
            Matrix::parse("https://example.org/foo.tar.gz\n"),
            Err(ConfigErrors::UnknownImplementation(_))
        ));
        assert!(matches!(
            Matrix::parse("# nothing here\n"),
            Err(ConfigErrors::EmptyMatrix(_))
        ));
    }

    #[test]
    fn cells_follow_declaration_order() {
        let matrix = Matrix::parse(&format!("{OMPI_402}\n{OMPI_314}\n")).unwrap();
        let cells = matrix
            .cells()
            .into_iter()
            .map(|cell| (cell.host.version, cell.container.version))
            .collect::<Vec<_>>();

        assert_eq!(
            cells,
            vec![
                ("4.0.2".to_owned(), "4.0.2".to_owned()),
                ("4.0.2".to_owned(), "3.1.4".to_owned()),
                ("3.1.4".to_owned(), "4.0.2".to_owned()),
                ("3.1.4".to_owned(), "3.1.4".to_owned()),
            ]
        );
    }
}
