use crate::{
    buildenv::{BuildEnvironment, BuildError},
    config::ConfigErrors,
    process::{prepend_path, RunOutput},
};
use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

const RANK_TAG: &str = "#RANK";
const NP_TAG: &str = "#NP";

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
/// The three test categories making up the compatibility matrix
pub enum TestCategory {
    /// hello world, start-up and teardown only
    Init,
    /// point-to-point
    Netpipe,
    /// collectives
    Imb,
}

impl TestCategory {
    pub fn id(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Netpipe => "netpipe",
            Self::Imb => "imb",
        }
    }
}

impl fmt::Display for TestCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
/// Test application run inside the containers
pub struct ApplicationConfig {
    pub name: String,
    pub category: TestCategory,
    // source location: tarball URL, git repository or local path
    pub url: String,
    // shell command compiling the application inside its source directory, `mpicc` on PATH
    pub compile: String,
    // the binary, relative to the source directory after `compile`
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// output at least one rank has to print, `#RANK` and `#NP` are substituted
    #[serde(default)]
    pub expected_output: Option<String>,
    /// regex whose capture groups are recorded as note of each result
    #[serde(default)]
    pub note_pattern: Option<String>,
}

impl ApplicationConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path).map_err(|error| ConfigErrors::io(path, error))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigErrors> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigErrors> {
        for (field, value) in [
            ("name", &self.name),
            ("url", &self.url),
            ("compile", &self.compile),
            ("binary", &self.binary),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigErrors::MissingField(field));
            }
        }

        if let Some(ref pattern) = self.note_pattern {
            Regex::new(pattern)?;
        }

        Ok(())
    }

    /// Default application for `category`
    pub fn builtin(category: TestCategory) -> Self {
        match category {
            TestCategory::Init => Self {
                name: String::from("helloworld"),
                category,
                url: String::from("https://github.com/gvallee/c_hello_world.git"),
                compile: String::from("make"),
                binary: String::from("helloworld"),
                args: Vec::new(),
                expected_output: Some(String::from("Hello, I am #RANK/#NP")),
                note_pattern: None,
            },
            TestCategory::Netpipe => Self {
                name: String::from("netpipe"),
                category,
                url: String::from("http://netpipe.cs.ksu.edu/download/NetPIPE-5.1.4.tar.gz"),
                compile: String::from("make mpi"),
                binary: String::from("NPmpi"),
                args: Vec::new(),
                expected_output: None,
                note_pattern: Some(String::from(
                    r"max bandwidth\s+([\d.]+\s*\S+)\s+([\d.]+\s*usecs)",
                )),
            },
            TestCategory::Imb => Self {
                name: String::from("imb"),
                category,
                url: String::from(
                    "https://github.com/intel/mpi-benchmarks/archive/IMB-v2019.6.tar.gz",
                ),
                compile: String::from("CC=mpicc CXX=mpicxx make IMB-MPI1"),
                binary: String::from("IMB-MPI1"),
                args: vec![String::from("Allreduce")],
                expected_output: None,
                note_pattern: None,
            },
        }
    }

    /// Expected output once per rank, with `#RANK`/`#NP` substituted
    pub fn expected_patterns(&self, ranks: usize) -> Vec<String> {
        match self.expected_output {
            Some(ref pattern) if pattern.contains(RANK_TAG) => (0..ranks)
                .map(|rank| {
                    pattern
                        .replace(RANK_TAG, &rank.to_string())
                        .replace(NP_TAG, &ranks.to_string())
                })
                .collect(),
            Some(ref pattern) => vec![pattern.replace(NP_TAG, &ranks.to_string())],
            None => Vec::new(),
        }
    }

    /// Annotation extracted from a run, empty without a note pattern or match
    pub fn note(&self, output: &RunOutput) -> String {
        let Some(pattern) = self
            .note_pattern
            .as_deref()
            .and_then(|pattern| Regex::new(pattern).ok())
        else {
            return String::new();
        };

        [&output.stdout, &output.stderr]
            .into_iter()
            .find_map(|stream| pattern.captures(stream))
            .map(|captures| {
                captures
                    .iter()
                    .skip(1)
                    .flatten()
                    .map(|capture| capture.as_str().trim().to_owned())
                    .join(" ")
            })
            .unwrap_or_default()
    }

    /// path of the binary inside the image
    pub fn container_exe(&self) -> PathBuf {
        let file_name = Path::new(&self.binary)
            .file_name()
            .map(|name| name.to_owned())
            .unwrap_or_else(|| self.binary.clone().into());

        Path::new("/opt/app/bin").join(file_name)
    }

    /// Fetch and compile the application on the host against the MPI in `mpi_bin_dir`
    pub fn build_on_host(
        &self,
        env: &mut BuildEnvironment,
        mpi_bin_dir: &Path,
    ) -> Result<PathBuf, BuildError> {
        env.env
            .push((String::from("PATH"), prepend_path("PATH", mpi_bin_dir)));
        env.fetch(&self.url)?;
        env.unpack()?;

        info!(app = %self.name, mpi = ?mpi_bin_dir, "Compiling application on the host");
        env.run_in_source("compile", &self.compile)?;

        let binary = env
            .source_dir
            .as_deref()
            .ok_or(BuildError::NotFetched)?
            .join(&self.binary);
        debug!(binary = ?binary, "Application built");

        Ok(binary)
    }
}
