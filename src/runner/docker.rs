/// Docker platform driven through the `docker` command line client
///
/// Each operation is one `docker` invocation. A started container is attached
/// with `docker start --attach --interactive`, whose stdio pipes carry the
/// container's stdin, stdout and stderr and whose exit status is the
/// container's exit status.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::process::Command;

use crate::runner::container::{ContainerPlatform, ContainerProcess, ContainerSpec};
use crate::runner::RunnerError;

/// `ContainerPlatform` backed by the docker CLI
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
}

impl DockerCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Run a docker subcommand to completion and return its trimmed stdout
    async fn output<I, S>(&self, args: I) -> Result<String, RunnerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        let subcommand = args
            .first()
            .map(|a| a.to_string_lossy().into_owned())
            .unwrap_or_default();

        let output = self.command().args(&args).output().await?;
        if !output.status.success() {
            return Err(RunnerError::Platform(format!(
                "docker {} failed: {}",
                subcommand,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

/// Arguments of the `docker create` call for `spec`
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let memory = format!("{}m", spec.memory_limit_mb);
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--interactive".to_string(),
        "--init".to_string(),
        "--read-only".to_string(),
        "--tmpfs".to_string(),
        format!("{}:rw", spec.scratch_mount),
        "--memory".to_string(),
        memory.clone(),
        "--memory-swap".to_string(),
        memory,
        "--memory-swappiness".to_string(),
        "0".to_string(),
        "--user".to_string(),
        spec.user.clone(),
        "--stop-timeout".to_string(),
        spec.stop_timeout.as_secs().to_string(),
    ];

    for resolver in &spec.dns {
        args.push("--dns".to_string());
        args.push(resolver.clone());
    }

    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }

    for (key, value) in &spec.env {
        args.push("--env".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(spec.image.clone());
    args.push(spec.command.clone());
    args.extend(spec.args.iter().cloned());
    args
}

#[async_trait]
impl ContainerPlatform for DockerCli {
    async fn ping(&self) -> Result<(), RunnerError> {
        let version = self
            .output(["version", "--format", "{{.Server.Version}}"])
            .await
            .map_err(|e| RunnerError::Unavailable(e.to_string()))?;

        tracing::debug!(version = %version, "docker daemon reachable");
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<(), RunnerError> {
        let output = self.output(["pull", "--quiet", image]).await?;
        tracing::info!(image = %image, output = %output, "pulled image");
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RunnerError> {
        let id = self.output(create_args(spec)).await?;
        if id.is_empty() {
            return Err(RunnerError::Platform("docker create returned no container id".into()));
        }
        Ok(id)
    }

    async fn start_attached(&self, id: &str) -> Result<ContainerProcess, RunnerError> {
        let mut child = self
            .command()
            .args(["start", "--attach", "--interactive", id])
            .stdin(Stdio::piped())
            .spawn()?;

        let missing = |stream: &str| RunnerError::Platform(format!("docker start gave no {}", stream));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let exit = async move {
            let status = child.wait().await?;
            // Killed by a signal: no exit code
            Ok::<_, RunnerError>(status.code().map(i64::from).unwrap_or(-1))
        }
        .boxed();

        Ok(ContainerProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            exit,
        })
    }

    async fn remove_container(&self, id: &str) -> Result<(), RunnerError> {
        match self.output(["rm", "--force", "--volumes", id]).await {
            Ok(_) => {
                tracing::debug!(container = %id, "removed container");
                Ok(())
            }
            Err(RunnerError::Platform(message)) if message.contains("No such container") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn close(&self) -> Result<(), RunnerError> {
        // The CLI keeps no connection open between invocations
        Ok(())
    }
}
