use super::JobDescriptor;
use crate::{
    config::Context,
    container::engine::ContainerEngine,
    process::{Invocation, RunOutput},
};
use tracing::debug;

#[derive(Debug, Clone, Default)]
/// Runs the host launcher directly, output is read from the captured pipes
pub struct NativeLauncher;

impl NativeLauncher {
    pub fn submit(
        &self,
        job: &JobDescriptor,
        ctx: &Context,
        engine: &ContainerEngine,
    ) -> Invocation {
        let invocation = Invocation::new(job.launcher())
            .arg("-np")
            .arg(job.ranks.to_string())
            .args(job.launch_args(ctx, engine))
            .envs(job.environment(ctx, engine));

        debug!(job = %job.name, command = %invocation, "Prepared direct launch");
        invocation
    }

    pub fn collect(&self, output: RunOutput) -> RunOutput {
        output
    }
}
