use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use std::{
    env,
    ffi::{OsStr, OsString},
    fmt,
    fs::File,
    io::{Read, Write},
    os::unix::{fs::MetadataExt, process::CommandExt},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, trace, warn};
use tracing_unwrap::OptionExt;
use wait_timeout::ChildExt;

/// Bound for short tool invocations (inspect, sign, probes, ...)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Bound for fetching, compiling and image builds/pulls
pub const BUILD_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
/// Bound for a single job submission
pub const JOB_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} was not found on PATH")]
    NotFound(String),
}

#[derive(Debug, Clone, Default)]
/// container for everything observed while running an external command
pub struct RunOutput {
    pub runtime: Duration,
    pub stdout: String,
    pub stderr: String,
    /// exit code, `None` if the process was killed by a signal
    pub status: Option<i32>,
    pub timed_out: bool,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status == Some(0)
    }

    /// persist both streams as `stdout.txt`/`stderr.txt` into `dir`
    pub fn dump(&self, dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(dir)?;
        File::create(dir.join("stdout.txt"))?.write_all(self.stdout.as_bytes())?;
        File::create(dir.join("stderr.txt"))?.write_all(self.stderr.as_bytes())?;

        Ok(())
    }
}

#[derive(Debug, Clone)]
/// A fully described external command: binary, argv, environment and working directory
pub struct Invocation {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<String>,
}

impl Invocation {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            stdin: None,
        }
    }

    /// Prefix the command with `sudo` (non-interactive)
    pub fn with_sudo(self) -> Self {
        let mut args = vec![OsString::from("-n"), self.program];
        args.extend(self.args);

        Self {
            program: OsString::from("sudo"),
            args,
            ..self
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_owned()));
        self
    }

    pub fn envs<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.env.extend(vars);
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn program_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;

        for arg in self.args.iter() {
            write!(f, " {}", arg.to_string_lossy())?;
        }

        Ok(())
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Err(error) = reader.read_to_end(&mut buffer) {
            warn!(error = ?error, "Failed to read child output");
        }

        String::from_utf8_lossy(&buffer).into_owned()
    })
}

/// Run `invocation` to completion or until `timeout` expires.
///
/// The child is started in its own process group so a timeout kills the whole tree (launchers
/// fork helpers which would otherwise keep the pipes open). A timeout is not an error, it is
/// reported through `RunOutput::timed_out`.
pub fn run(invocation: &Invocation, timeout: Duration) -> Result<RunOutput, ProcessError> {
    let program = invocation.program_name();
    let mut command = Command::new(&invocation.program);

    command
        .args(invocation.args.iter())
        .envs(invocation.env.iter().map(|(key, value)| (key, value)))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if invocation.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .process_group(0);

    if let Some(ref cwd) = invocation.cwd {
        command.current_dir(cwd);
    }

    debug!(command = %invocation, timeout = ?timeout, "Spawning");
    let start = Instant::now();
    let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
        program: program.clone(),
        source,
    })?;

    if let Some(ref input) = invocation.stdin {
        let mut stdin = child.stdin.take().expect_or_log("stdin was piped");
        if let Err(error) = stdin.write_all(input.as_bytes()) {
            warn!(error = ?error, program = %program, "Failed to write to stdin");
        }
        // closing stdin gives the child a clear end of input
        drop(stdin);
    }

    let stdout = drain(child.stdout.take().expect_or_log("stdout was piped"));
    let stderr = drain(child.stderr.take().expect_or_log("stderr was piped"));

    let (status, timed_out) = match child.wait_timeout(timeout) {
        Ok(Some(status)) => (status.code(), false),
        Ok(None) => {
            warn!(program = %program, timeout = ?timeout, "Timeout reached, killing process group");

            if let Err(error) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
                debug!(error = ?error, "Failed to kill process group, killing child only");
                let _ = child.kill();
            }
            let _ = child.wait();

            (None, true)
        }
        Err(source) => {
            let _ = child.kill();

            return Err(ProcessError::Wait { program, source });
        }
    };

    let output = RunOutput {
        runtime: start.elapsed(),
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
        status,
        timed_out,
    };

    debug!(
        program = %program,
        status = ?output.status,
        runtime = ?output.runtime,
        "Finished"
    );
    trace!(stdout = %output.stdout, stderr = %output.stderr);

    Ok(output)
}

/// check if a file is executable
pub fn is_executable(path: &Path) -> bool {
    path.is_file()
        && std::fs::metadata(path)
            .map(|metadata| (metadata.mode() & 0o111) != 0)
            .unwrap_or(false)
}

/// Look `name` up on the search path, absolute or relative paths are checked as is
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }

    env::var_os("PATH").and_then(|paths| {
        env::split_paths(&paths)
            .map(|dir| dir.join(name))
            .find(|candidate| is_executable(candidate))
    })
}

/// Same as `find_in_path` but reports a missing binary as an error
pub fn require(name: &str) -> Result<PathBuf, ProcessError> {
    find_in_path(name).ok_or_else(|| ProcessError::NotFound(name.to_owned()))
}

/// Prepend `dir` to a colon separated search path taken from the current environment
pub fn prepend_path(var: &str, dir: &Path) -> String {
    match env::var(var) {
        Ok(current) if !current.is_empty() => format!("{}:{current}", dir.display()),
        _ => dir.display().to_string(),
    }
}
