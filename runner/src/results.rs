use crate::{app::TestCategory, implementation::Implementation, matrix::ExperimentConfig};
use itertools::Itertools;
use std::{
    collections::{HashMap, HashSet},
    fmt,
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Failed to access results file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: malformed result `{content}`")]
    Malformed {
        path: PathBuf,
        line: usize,
        content: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Pass,
    Fail,
    Error,
}

impl Outcome {
    pub fn id(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Outcome {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PASS" => Ok(Self::Pass),
            "FAIL" => Ok(Self::Fail),
            "ERROR" => Ok(Self::Error),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One line of a results file, never rewritten once appended
pub struct ExperimentResult {
    pub host_version: String,
    pub container_version: String,
    pub outcome: Outcome,
    pub note: String,
}

impl ExperimentResult {
    pub fn new(cell: &ExperimentConfig, outcome: Outcome, note: impl Into<String>) -> Self {
        Self {
            host_version: cell.host.version.clone(),
            container_version: cell.container.version.clone(),
            outcome,
            note: note.into(),
        }
    }

    pub fn key(&self) -> (&str, &str) {
        (&self.host_version, &self.container_version)
    }
}

impl fmt::Display for ExperimentResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // tabs and newlines would break the line format
        let note = self.note.replace(['\t', '\n', '\r'], " ");

        write!(
            f,
            "{}\t{}\t{}\t{}",
            self.host_version,
            self.container_version,
            self.outcome,
            note.trim()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One cell of the aggregated compatibility matrix
pub struct MatrixEntry {
    pub host_version: String,
    pub container_version: String,
    pub compatible: bool,
}

/// `<impl>-<category>-results.txt`
pub fn results_file_name(implementation: Implementation, category: TestCategory) -> String {
    format!("{implementation}-{category}-results.txt")
}

/// `<impl>-compatibility.txt`
pub fn matrix_file_name(implementation: Implementation) -> String {
    format!("{implementation}-compatibility.txt")
}

fn parse_line(path: &Path, number: usize, line: &str) -> Result<ExperimentResult, LedgerError> {
    let malformed = || LedgerError::Malformed {
        path: path.to_path_buf(),
        line: number,
        content: line.to_owned(),
    };

    let mut fields = line.splitn(4, '\t');
    let (Some(host), Some(container), Some(outcome)) =
        (fields.next(), fields.next(), fields.next())
    else {
        return Err(malformed());
    };

    if host.is_empty() || container.is_empty() {
        return Err(malformed());
    }

    Ok(ExperimentResult {
        host_version: host.to_owned(),
        container_version: container.to_owned(),
        outcome: outcome.parse().map_err(|_| malformed())?,
        note: fields.next().unwrap_or_default().to_owned(),
    })
}

/// Read all results of `path`, a missing file holds no results
pub fn load(path: &Path) -> Result<Vec<ExperimentResult>, LedgerError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            debug!(path = ?path, "No results recorded yet");
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(LedgerError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| parse_line(path, index + 1, line))
        .collect()
}

/// Append `result` as a new line to `path`
pub fn append(path: &Path, result: &ExperimentResult) -> Result<(), LedgerError> {
    let io_error = |source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_error)?;
    writeln!(file, "{result}").map_err(io_error)?;

    debug!(path = ?path, result = %result, "Recorded result");
    Ok(())
}

/// Cells without any recorded result, in their original order
pub fn prune(cells: Vec<ExperimentConfig>, existing: &[ExperimentResult]) -> Vec<ExperimentConfig> {
    let done: HashSet<(&str, &str)> = existing.iter().map(ExperimentResult::key).collect();

    cells
        .into_iter()
        .filter(|cell| {
            let key = (cell.host.version.as_str(), cell.container.version.as_str());
            let recorded = done.contains(&key);
            if recorded {
                debug!(cell = %cell.name(), "Already recorded, skipping");
            }
            !recorded
        })
        .collect()
}

/// whether every recorded run of each pair passed
fn passed(results: &[ExperimentResult]) -> HashMap<(&str, &str), bool> {
    let mut passed = HashMap::new();

    for result in results {
        let entry = passed.entry(result.key()).or_insert(true);
        *entry &= result.outcome == Outcome::Pass;
    }

    passed
}

/// Combine the three categories into the compatibility matrix.
///
/// A pair is compatible only when it passed every category; a category without a result for
/// the pair counts as failed. Pairs are listed in the order they first appear.
pub fn aggregate(
    init: &[ExperimentResult],
    netpipe: &[ExperimentResult],
    imb: &[ExperimentResult],
) -> Vec<MatrixEntry> {
    let categories = [passed(init), passed(netpipe), passed(imb)];

    init.iter()
        .chain(netpipe)
        .chain(imb)
        .map(ExperimentResult::key)
        .unique()
        .map(|key| MatrixEntry {
            host_version: key.0.to_owned(),
            container_version: key.1.to_owned(),
            compatible: categories
                .iter()
                .all(|category| category.get(&key).copied().unwrap_or(false)),
        })
        .collect()
}

/// Write `entries` as `host<TAB>container<TAB>true|false` lines
pub fn write_matrix(path: &Path, entries: &[MatrixEntry]) -> Result<(), LedgerError> {
    let io_error = |source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    };

    let content: String = entries
        .iter()
        .map(|entry| {
            format!(
                "{}\t{}\t{}\n",
                entry.host_version, entry.container_version, entry.compatible
            )
        })
        .collect();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }
    fs::write(path, content).map_err(io_error)?;
    info!(path = ?path, cells = entries.len(), "Wrote compatibility matrix");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::Matrix;

    fn result(host: &str, container: &str, outcome: Outcome) -> ExperimentResult {
        ExperimentResult {
            host_version: host.to_owned(),
            container_version: container.to_owned(),
            outcome,
            note: String::new(),
        }
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();

        assert!(load(&dir.path().join("absent.txt")).unwrap().is_empty());
    }

    #[test]
    fn appended_results_are_loaded_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results").join("openmpi-netpipe-results.txt");
        let mut first = result("3.1.4", "3.1.4", Outcome::Pass);
        first.note = String::from("9000 Mbps\t2.1 usecs");

        append(&path, &first).unwrap();
        append(&path, &result("3.1.4", "4.0.2", Outcome::Error)).unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "3.1.4\t3.1.4\tPASS\t9000 Mbps 2.1 usecs\n3.1.4\t4.0.2\tERROR\t\n"
        );

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].note, "9000 Mbps 2.1 usecs");
        assert_eq!(loaded[1].outcome, Outcome::Error);
    }

    #[test]
    fn malformed_lines_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.txt");
        fs::write(&path, "3.1.4\t3.1.4\tPASS\t\n3.1.4\t4.0.2\tMAYBE\t\n").unwrap();

        match load(&path) {
            Err(LedgerError::Malformed { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn prune_keeps_unrecorded_cells() {
        let matrix = Matrix::parse(
            "https://example.org/openmpi-3.1.4.tar.bz2\nhttps://example.org/openmpi-4.0.2.tar.gz\n",
        )
        .unwrap();
        let existing = vec![result("3.1.4", "3.1.4", Outcome::Fail)];

        let remaining = prune(matrix.cells(), &existing);

        assert_eq!(
            remaining
                .iter()
                .map(|cell| (cell.host.version.as_str(), cell.container.version.as_str()))
                .collect::<Vec<_>>(),
            vec![("3.1.4", "4.0.2"), ("4.0.2", "3.1.4"), ("4.0.2", "4.0.2")]
        );
    }

    #[test]
    fn aggregation_fails_closed() {
        let init = vec![
            result("1", "1", Outcome::Pass),
            result("1", "2", Outcome::Pass),
            result("2", "1", Outcome::Pass),
        ];
        let netpipe = vec![
            result("1", "1", Outcome::Pass),
            result("1", "2", Outcome::Pass),
            result("2", "1", Outcome::Pass),
            result("2", "2", Outcome::Pass),
        ];
        let imb = vec![
            result("1", "1", Outcome::Pass),
            result("1", "1", Outcome::Pass),
            result("1", "2", Outcome::Fail),
            result("2", "2", Outcome::Pass),
        ];

        let matrix = aggregate(&init, &netpipe, &imb);

        assert_eq!(
            matrix
                .iter()
                .map(|entry| (
                    entry.host_version.as_str(),
                    entry.container_version.as_str(),
                    entry.compatible
                ))
                .collect::<Vec<_>>(),
            vec![
                ("1", "1", true),
                ("1", "2", false),
                // no imb result
                ("2", "1", false),
                // no init result
                ("2", "2", false),
            ]
        );
    }

    #[test]
    fn one_failed_iteration_fails_the_pair() {
        let runs = vec![
            result("1", "1", Outcome::Pass),
            result("1", "1", Outcome::Fail),
        ];

        let matrix = aggregate(&runs, &runs, &runs);

        assert!(!matrix[0].compatible);
    }

    #[test]
    fn matrix_file_uses_booleans() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(matrix_file_name(Implementation::MPICH));

        write_matrix(
            &path,
            &[MatrixEntry {
                host_version: String::from("3.3"),
                container_version: String::from("3.2"),
                compatible: false,
            }],
        )
        .unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "3.3\t3.2\tfalse\n");
        assert_eq!(
            results_file_name(Implementation::OpenMPI, TestCategory::Netpipe),
            "openmpi-netpipe-results.txt"
        );
    }
}
