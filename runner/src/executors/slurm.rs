use super::{io_error, JobDescriptor, LaunchError};
use crate::{
    config::{Context, ToolConfig},
    container::engine::ContainerEngine,
    process::{find_in_path, Invocation, RunOutput},
};
use itertools::Itertools;
use std::{
    ffi::OsString,
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

/// scripts of one job name before giving up on finding a free path
const MAX_SCRIPTS: usize = 1000;

#[derive(Debug, Clone)]
/// Submits a batch script with `sbatch --wait`, output is read back from the files Slurm wrote
pub struct SlurmLauncher {
    pub sbatch: PathBuf,
}

/// shell quoting for values written into the batch script
fn quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-:=,+@".contains(c))
    {
        value.to_owned()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

impl SlurmLauncher {
    pub fn detect(tool: &ToolConfig) -> Option<Self> {
        if !tool.slurm {
            return None;
        }

        let sbatch = find_in_path("sbatch");
        if sbatch.is_none() {
            warn!("Slurm is enabled but sbatch is not on PATH");
        }

        sbatch.map(|sbatch| Self { sbatch })
    }

    fn stdout_path(job: &JobDescriptor) -> PathBuf {
        job.job_dir.join(format!("{}.stdout", job.name))
    }

    fn stderr_path(job: &JobDescriptor) -> PathBuf {
        job.job_dir.join(format!("{}.stderr", job.name))
    }

    /// first `<name>.sh`, `<name>-1.sh`, ... that does not exist yet
    fn script_path(job: &JobDescriptor) -> Result<PathBuf, LaunchError> {
        (0..MAX_SCRIPTS)
            .map(|attempt| match attempt {
                0 => job.job_dir.join(format!("{}.sh", job.name)),
                n => job.job_dir.join(format!("{}-{n}.sh", job.name)),
            })
            .find(|path| !path.exists())
            .ok_or_else(|| LaunchError::ScriptCollision(job.job_dir.join(&job.name)))
    }

    /// Content of the batch script running `job`
    pub fn script(job: &JobDescriptor, ctx: &Context, engine: &ContainerEngine) -> String {
        let directives = [
            format!("#SBATCH --job-name={}", job.name),
            format!("#SBATCH --nodes={}", job.nodes),
            format!("#SBATCH --ntasks={}", job.ranks),
            format!("#SBATCH --output={}", Self::stdout_path(job).display()),
            format!("#SBATCH --error={}", Self::stderr_path(job).display()),
        ];
        let exports = job
            .environment(ctx, engine)
            .into_iter()
            .map(|(key, value)| format!("export {key}={}", quote(&value)));
        let command = std::iter::once(job.launcher().into_os_string())
            .chain([OsString::from("-np"), OsString::from(job.ranks.to_string())])
            .chain(job.launch_args(ctx, engine))
            .map(|arg| quote(&arg.to_string_lossy()))
            .join(" ");

        format!(
            "#!/bin/bash\n{}\n\n{}\n\n{command}\n",
            directives.join("\n"),
            exports.format("\n")
        )
    }

    pub fn submit(
        &self,
        job: &mut JobDescriptor,
        ctx: &Context,
        engine: &ContainerEngine,
    ) -> Result<Invocation, LaunchError> {
        fs::create_dir_all(&job.job_dir).map_err(io_error(&job.job_dir))?;

        let path = Self::script_path(job)?;
        fs::write(&path, Self::script(job, ctx, engine)).map_err(io_error(&path))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).map_err(io_error(&path))?;

        // stale output of an earlier iteration must not be mistaken for this one
        for output in [Self::stdout_path(job), Self::stderr_path(job)] {
            if output.exists() {
                fs::remove_file(&output).map_err(io_error(&output))?;
            }
        }

        info!(job = %job.name, script = ?path, "Submitting batch job");
        job.batch_script = Some(path.clone());

        Ok(Invocation::new(&self.sbatch).arg("--wait").arg(path))
    }

    fn read(path: &Path) -> Result<String, LaunchError> {
        fs::read_to_string(path).map_err(|source| LaunchError::Output {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Replace the output of `sbatch` by the job's output files
    pub fn collect(
        &self,
        job: &JobDescriptor,
        output: RunOutput,
    ) -> Result<RunOutput, LaunchError> {
        let stdout_path = Self::stdout_path(job);

        if !output.timed_out && !stdout_path.exists() {
            // sbatch returned without the job ever writing its output
            return Err(LaunchError::Submission { output });
        }

        debug!(job = %job.name, sbatch = %output.stdout.trim(), "Reading batch job output");
        let stderr_path = Self::stderr_path(job);

        Ok(RunOutput {
            stdout: if stdout_path.exists() {
                Self::read(&stdout_path)?
            } else {
                String::new()
            },
            stderr: if stderr_path.exists() {
                Self::read(&stderr_path)?
            } else {
                output.stderr.clone()
            },
            ..output
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        executors::tests::{context, job},
        implementation::Implementation,
    };

    fn launcher() -> SlurmLauncher {
        SlurmLauncher {
            sbatch: PathBuf::from("/usr/bin/sbatch"),
        }
    }

    #[test]
    fn script_declares_resources_and_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path(), Implementation::MPICH);
        let ctx = context(dir.path(), ToolConfig::default());
        let engine = ContainerEngine::new(&ctx.tool);

        let script = SlurmLauncher::script(&job, &ctx, &engine);

        assert!(script.starts_with("#!/bin/bash\n#SBATCH --job-name=mpich-3.3-3.3\n"));
        assert!(script.contains("#SBATCH --nodes=1\n#SBATCH --ntasks=2\n"));
        assert!(script.contains(&format!(
            "#SBATCH --output={}/jobs/mpich-3.3-3.3.stdout",
            dir.path().display()
        )));
        assert!(script.contains("export LD_LIBRARY_PATH="));
        assert!(script.contains("mpiexec -np 2 singularity exec"));
    }

    #[test]
    fn scripts_never_overwrite_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job(dir.path(), Implementation::MPICH);
        let ctx = context(dir.path(), ToolConfig::default());
        let engine = ContainerEngine::new(&ctx.tool);

        let first = launcher().submit(&mut job, &ctx, &engine).unwrap();
        let second = launcher().submit(&mut job, &ctx, &engine).unwrap();

        assert_eq!(first.args[0], "--wait");
        assert_eq!(
            first.args[1],
            dir.path().join("jobs/mpich-3.3-3.3.sh").into_os_string()
        );
        assert_eq!(
            second.args[1],
            dir.path().join("jobs/mpich-3.3-3.3-1.sh").into_os_string()
        );
        assert_eq!(
            job.batch_script,
            Some(dir.path().join("jobs/mpich-3.3-3.3-1.sh"))
        );
    }

    #[test]
    fn output_comes_from_the_job_files() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path(), Implementation::MPICH);
        fs::create_dir_all(&job.job_dir).unwrap();

        let submitted = RunOutput {
            stdout: String::from("Submitted batch job 42\n"),
            status: Some(0),
            ..RunOutput::default()
        };
        assert!(matches!(
            launcher().collect(&job, submitted.clone()),
            Err(LaunchError::Submission { .. })
        ));

        fs::write(SlurmLauncher::stdout_path(&job), "Hello, I am 0/2\n").unwrap();
        let output = launcher().collect(&job, submitted).unwrap();
        assert_eq!(output.stdout, "Hello, I am 0/2\n");
        assert_eq!(output.status, Some(0));
    }

    #[test]
    fn values_are_quoted_for_the_shell() {
        assert_eq!(quote("/opt/mpi/bin:/usr/bin"), "/opt/mpi/bin:/usr/bin");
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("it's"), r"'it'\''s'");
    }
}
