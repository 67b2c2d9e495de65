use super::{classify, Orchestrator};
use crate::{
    app::{ApplicationConfig, TestCategory},
    config::{Context, ToolConfig, Workspace},
    container::MpiModel,
    executors::{slurm::SlurmLauncher, JobManagers},
    matrix::Matrix,
    process::RunOutput,
    results::{self, Outcome},
};
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};

// runs the batch script with its output redirected like Slurm does
const SBATCH: &str = r#"#!/bin/sh
[ "$1" = "--wait" ] || exit 1
out=$(sed -n 's/^#SBATCH --output=//p' "$2")
err=$(sed -n 's/^#SBATCH --error=//p' "$2")
echo "Submitted batch job 42"
sh "$2" > "$out" 2> "$err"
"#;

const REJECTING_SBATCH: &str =
    "#!/bin/sh\necho 'sbatch: error: invalid partition specified' >&2\nexit 1\n";

// runs the container command once per rank, like a launcher on a single node
const MPIRUN: &str = r#"#!/bin/sh
np=$2
shift 2
rank=0
while [ "$rank" -lt "$np" ]; do
    RANK=$rank NP=$np "$@" || exit 1
    rank=$((rank + 1))
done
"#;

const USAGE_MPIRUN: &str = "#!/bin/sh\necho 'Usage: mpirun [options] <program>'\n";

const CONFIGURE: &str = r#"#!/bin/sh
prefix=${1#--prefix=}
echo "$prefix" >> @LOG@
printf 'all:\n\ttrue\ninstall:\n\tmkdir -p %s/bin\n\tcp mpirun %s/bin/mpirun\n' "$prefix" "$prefix" > Makefile
"#;

// builds copy the definition into the image so inspect can read the labels back,
// every exec is logged with its arguments
const ENGINE: &str = r#"#!/bin/sh
cmd=$1
shift
case "$cmd" in
build)
    [ "$1" = "--fakeroot" ] && shift
    echo "build $1" >> @LOG@
    cp "$2" "$1"
    ;;
inspect)
    awk '/^%labels/ { on = 1; next } /^%/ { on = 0 } on && NF >= 2 { key = $1; $1 = ""; sub(/^ +/, ""); print key ": " $0 }' "$2"
    ;;
exec)
    echo "$*" >> @EXECLOG@
    while [ "$1" = "--bind" ]; do
        [ -d "${2%%:*}" ] || exit 3
        shift 2
    done
    [ -f "$1" ] || exit 2
    echo "Hello, I am $RANK/$NP"
    ;;
*)
    exit 1
    ;;
esac
"#;

fn write_executable(path: &Path, content: &str) {
    fs::write(path, content).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

fn count_lines(path: &Path) -> usize {
    fs::read_to_string(path)
        .map(|content| content.lines().count())
        .unwrap_or(0)
}

/// A throwaway workspace with fake MPI releases and a fake container engine
struct Fixture {
    dir: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        let fixture = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        fs::create_dir_all(fixture.path("sources")).unwrap();
        write_executable(
            &fixture.path("engine"),
            &ENGINE
                .replace("@LOG@", &fixture.path("engine.log").display().to_string())
                .replace("@EXECLOG@", &fixture.path("exec.log").display().to_string()),
        );

        fixture
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// `openmpi-<version>.tar.gz` with a configure script and the given launcher
    fn release(&self, version: &str, mpirun: &str) -> String {
        let root = self.path("staging").join(format!("openmpi-{version}"));
        fs::create_dir_all(&root).unwrap();
        write_executable(
            &root.join("configure"),
            &CONFIGURE.replace("@LOG@", &self.path("configure.log").display().to_string()),
        );
        write_executable(&root.join("mpirun"), mpirun);

        let archive = self.path("sources").join(format!("openmpi-{version}.tar.gz"));
        let status = Command::new("tar")
            .arg("-C")
            .arg(self.path("staging"))
            .arg("-czf")
            .arg(&archive)
            .arg(format!("openmpi-{version}"))
            .status()
            .unwrap();
        assert!(status.success());

        format!("file://{}", archive.display())
    }

    fn matrix(&self, versions: &[&str], mpirun: &str) -> Matrix {
        let content: String = versions
            .iter()
            .map(|version| format!("{}\n", self.release(version, mpirun)))
            .collect();

        Matrix::parse(&content).unwrap()
    }

    fn context(&self, build_privilege: bool) -> Context {
        let tool = ToolConfig {
            build_privilege,
            container_engine: self.path("engine").display().to_string(),
            ..ToolConfig::default()
        };
        let mut ctx = Context::new(tool, Workspace::new(self.path("workspace")));
        ctx.persistent = true;

        ctx
    }

    fn results(&self) -> PathBuf {
        self.path("out").join("openmpi-init-results.txt")
    }

    /// hello world compiled on the host from a local source directory
    fn hello(&self) -> ApplicationConfig {
        let source = self.path("hello");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("hello.c"), "int main() { return 0; }\n").unwrap();

        ApplicationConfig {
            name: String::from("hello"),
            category: TestCategory::Init,
            url: format!("file://{}", source.display()),
            compile: String::from("cp hello.c hello"),
            binary: String::from("hello"),
            args: Vec::new(),
            expected_output: Some(String::from("Hello, I am #RANK/#NP")),
            note_pattern: None,
        }
    }

    fn exec_log(&self) -> Vec<String> {
        fs::read_to_string(self.path("exec.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    fn slurm(&self, sbatch: &str) -> JobManagers {
        write_executable(&self.path("sbatch"), sbatch);

        JobManagers::Slurm(SlurmLauncher {
            sbatch: self.path("sbatch"),
        })
    }
}

#[test]
pub fn full_matrix_runs_once_and_resumes() {
    let fixture = Fixture::new();
    let matrix = fixture.matrix(&["1.0.0", "2.0.0"], MPIRUN);
    let ctx = fixture.context(true);
    let app = ApplicationConfig::builtin(TestCategory::Init);

    let summary = Orchestrator::new(&ctx, &matrix, &app, fixture.results())
        .run()
        .unwrap();

    assert_eq!(summary.executed, 4);
    assert_eq!(summary.pass, 4);
    assert_eq!(summary.cells_passed, 4);

    let content = fs::read_to_string(fixture.results()).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "1.0.0\t1.0.0\tPASS\t");
    assert_eq!(lines[1], "1.0.0\t2.0.0\tPASS\t");
    assert!(lines
        .iter()
        .all(|line| line.split('\t').count() == 4));

    // installs and images are keyed by version and reused by later cells
    assert_eq!(count_lines(&fixture.path("configure.log")), 2);
    assert_eq!(count_lines(&fixture.path("engine.log")), 2);

    let rerun = Orchestrator::new(&ctx, &matrix, &app, fixture.results())
        .run()
        .unwrap();

    assert_eq!(rerun.executed, 0);
    assert_eq!(rerun.skipped, 4);
    assert_eq!(fs::read_to_string(fixture.results()).unwrap(), content);
    assert_eq!(count_lines(&fixture.path("engine.log")), 2);
}

#[test]
pub fn usage_banner_is_a_failure() {
    let fixture = Fixture::new();
    let matrix = fixture.matrix(&["1.0.0"], USAGE_MPIRUN);
    let ctx = fixture.context(true);
    let app = ApplicationConfig::builtin(TestCategory::Init);

    let summary = Orchestrator::new(&ctx, &matrix, &app, fixture.results())
        .run()
        .unwrap();

    assert_eq!(summary.fail, 1);
    let recorded = results::load(&fixture.results()).unwrap();
    assert_eq!(recorded[0].outcome, Outcome::Fail);
    assert_eq!(recorded[0].note, "launcher printed a usage message");

    let dump = fixture
        .path("out")
        .join("errors")
        .join("openmpi-1.0.0-1.0.0")
        .join("run-0");
    assert!(fs::read_to_string(dump.join("stdout.txt"))
        .unwrap()
        .starts_with("Usage:"));
}

#[test]
pub fn every_iteration_is_recorded() {
    let fixture = Fixture::new();
    let matrix = fixture.matrix(&["1.0.0"], MPIRUN);
    let mut ctx = fixture.context(true);
    ctx.nrun = 3;
    let app = ApplicationConfig::builtin(TestCategory::Init);

    let summary = Orchestrator::new(&ctx, &matrix, &app, fixture.results())
        .run()
        .unwrap();

    assert_eq!(summary.executed, 1);
    assert_eq!(summary.pass, 3);
    assert_eq!(count_lines(&fixture.results()), 3);
}

#[test]
pub fn missing_image_source_is_an_error() {
    let fixture = Fixture::new();
    let matrix = fixture.matrix(&["1.0.0"], MPIRUN);
    let mut ctx = fixture.context(false);
    ctx.persistent = false;
    let app = ApplicationConfig::builtin(TestCategory::Init);

    let summary = Orchestrator::new(&ctx, &matrix, &app, fixture.results())
        .run()
        .unwrap();

    assert_eq!(summary.error, 1);
    let recorded = results::load(&fixture.results()).unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].outcome, Outcome::Error);
    assert!(recorded[0].note.contains("openmpi-1.0.0-init"));

    let errors = fixture.path("out").join("errors").join("openmpi-1.0.0-1.0.0");
    assert!(errors.join("setup").join("error.txt").is_file());
    // non-persistent cells leave nothing behind
    assert!(!fixture
        .path("workspace")
        .join("scratch")
        .join("run-openmpi-1.0.0-1.0.0")
        .exists());
}

#[test]
pub fn bind_model_mounts_the_host_installation() {
    let fixture = Fixture::new();
    let matrix = fixture.matrix(&["1.0.0"], MPIRUN);
    let mut ctx = fixture.context(true);
    ctx.model = MpiModel::Bind;

    let app = fixture.hello();

    let summary = Orchestrator::new(&ctx, &matrix, &app, fixture.results())
        .run()
        .unwrap();

    assert_eq!(summary.pass, 1);

    let workspace = fixture.path("workspace");
    let definition = fs::read_to_string(
        workspace
            .join("scratch")
            .join("openmpi-1.0.0-init-bind")
            .join("openmpi-1.0.0-init-bind.def"),
    )
    .unwrap();
    let compiled = workspace
        .join("apps")
        .join("openmpi-1.0.0-init-bind")
        .join("hello")
        .join("hello");
    assert!(compiled.is_file());
    assert!(definition.contains(&format!("{} /opt/app/bin/hello", compiled.display())));
    assert!(definition.contains("Model bind"));
}

#[test]
pub fn bind_model_runs_the_host_release_against_every_image() {
    let fixture = Fixture::new();
    let matrix = fixture.matrix(&["1.0.0", "2.0.0"], MPIRUN);
    let mut ctx = fixture.context(true);
    ctx.model = MpiModel::Bind;
    let app = fixture.hello();

    let summary = Orchestrator::new(&ctx, &matrix, &app, fixture.results())
        .run()
        .unwrap();

    assert_eq!(summary.pass, 4);

    let workspace = fixture.path("workspace");
    let launched = |host: &str, container: &str| {
        format!(
            "--bind {}:/opt/mpi {}",
            workspace.join("install").join(format!("openmpi-{host}")).display(),
            workspace
                .join("images")
                .join(format!("openmpi-{container}-init-bind.sif"))
                .display()
        )
    };

    // one line per rank, cells in host-major order
    let exec = fixture.exec_log();
    assert_eq!(exec.len(), 8);
    assert!(exec[0].starts_with(&launched("1.0.0", "1.0.0")));
    assert!(exec[2].starts_with(&launched("1.0.0", "2.0.0")));
    assert!(exec[4].starts_with(&launched("2.0.0", "1.0.0")));
    assert!(exec[6].starts_with(&launched("2.0.0", "2.0.0")));
    assert!(exec.iter().all(|line| line.matches("--bind").count() == 1));

    // one image per container release, the application is compiled for each
    assert_eq!(count_lines(&fixture.path("engine.log")), 2);
}

#[test]
pub fn reused_images_run_the_binary_they_were_built_with() {
    let fixture = Fixture::new();
    let matrix = fixture.matrix(&["1.0.0"], MPIRUN);
    let ctx = fixture.context(true);

    Orchestrator::new(
        &ctx,
        &matrix,
        &ApplicationConfig::builtin(TestCategory::Init),
        fixture.results(),
    )
    .run()
    .unwrap();
    fs::remove_file(fixture.path("exec.log")).unwrap();

    // same category and release, so the image is reused despite the new binary and distro
    let mut ctx = fixture.context(true);
    ctx.distro = "debian:bookworm".parse().unwrap();
    let app = ApplicationConfig {
        binary: String::from("hello-v2"),
        ..fixture.hello()
    };
    let summary = Orchestrator::new(&ctx, &matrix, &app, fixture.path("out").join("second.txt"))
        .run()
        .unwrap();

    assert_eq!(summary.pass, 1);
    assert_eq!(count_lines(&fixture.path("engine.log")), 1);
    let exec = fixture.exec_log();
    assert!(!exec.is_empty());
    assert!(exec
        .iter()
        .all(|line| line.ends_with("openmpi-1.0.0-init.sif /opt/app/bin/helloworld")));
}

#[test]
pub fn batch_jobs_are_read_back_from_their_output_files() {
    let fixture = Fixture::new();
    let matrix = fixture.matrix(&["1.0.0"], MPIRUN);
    let ctx = fixture.context(true);
    let app = ApplicationConfig::builtin(TestCategory::Init);

    let mut orchestrator = Orchestrator::new(&ctx, &matrix, &app, fixture.results());
    orchestrator.jobs = fixture.slurm(SBATCH);
    let summary = orchestrator.run().unwrap();

    assert_eq!(summary.pass, 1);
    let recorded = results::load(&fixture.results()).unwrap();
    assert_eq!(recorded[0].outcome, Outcome::Pass);

    let jobs = fixture
        .path("workspace")
        .join("scratch")
        .join("openmpi-1.0.0-1.0.0")
        .join("jobs");
    let script = fs::read_to_string(jobs.join("openmpi-1.0.0-1.0.0.sh")).unwrap();
    assert!(script.contains("#SBATCH --ntasks=2\n"));
    assert!(fs::read_to_string(jobs.join("openmpi-1.0.0-1.0.0.stdout"))
        .unwrap()
        .contains("Hello, I am 1/2"));
}

#[test]
pub fn rejected_batch_jobs_are_errors() {
    let fixture = Fixture::new();
    let matrix = fixture.matrix(&["1.0.0"], MPIRUN);
    let ctx = fixture.context(true);
    let app = ApplicationConfig::builtin(TestCategory::Init);

    let mut orchestrator = Orchestrator::new(&ctx, &matrix, &app, fixture.results());
    orchestrator.jobs = fixture.slurm(REJECTING_SBATCH);
    let summary = orchestrator.run().unwrap();

    assert_eq!(summary.error, 1);
    let dump = fixture
        .path("out")
        .join("errors")
        .join("openmpi-1.0.0-1.0.0")
        .join("run-0");
    assert!(fs::read_to_string(dump.join("stderr.txt"))
        .unwrap()
        .contains("invalid partition"));
    assert!(fixture.exec_log().is_empty());
}

#[test]
pub fn classification_needs_clean_exit_and_expected_output() {
    let expected = vec![String::from("Hello, I am 0/2"), String::from("Hello, I am 1/2")];
    let finished = |stdout: &str, stderr: &str| RunOutput {
        stdout: stdout.to_owned(),
        stderr: stderr.to_owned(),
        status: Some(0),
        ..RunOutput::default()
    };

    // some runtimes print to stderr
    assert_eq!(
        classify(&finished("", "Hello, I am 1/2\n"), &expected),
        (Outcome::Pass, None)
    );
    assert_eq!(classify(&finished("", ""), &expected).0, Outcome::Fail);
    assert_eq!(classify(&finished("", ""), &[]).0, Outcome::Pass);
    assert_eq!(
        classify(&finished("  usage: mpirun -np <n>\n", ""), &[]).0,
        Outcome::Fail
    );

    let crashed = RunOutput {
        status: Some(139),
        ..finished("Hello, I am 0/2\n", "")
    };
    assert_eq!(
        classify(&crashed, &expected),
        (Outcome::Fail, Some(String::from("exit status 139")))
    );

    let timed_out = RunOutput {
        status: None,
        timed_out: true,
        runtime: Duration::from_secs(1800),
        ..RunOutput::default()
    };
    assert_eq!(classify(&timed_out, &[]).0, Outcome::Fail);
}
