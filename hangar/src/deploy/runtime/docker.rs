//! Docker CLI runtime

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::deploy::runtime::{
    classify_failure, ContainerInfo, ContainerRuntime, ContainerSpec, ContainerSummary,
    RuntimeError,
};

/// Drives the local daemon through the `docker` binary
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[String], env: &[(String, String)]) -> Result<String, RuntimeError> {
        let command = format!("{} {}", self.binary, args.first().map(String::as_str).unwrap_or(""));
        debug!(command = %command, "Running container runtime command");

        let output = Command::new(&self.binary)
            .args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| RuntimeError::Unavailable(format!("Failed to run {}: {}", command, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&command, &stderr));
        }

        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.stderr.is_empty() && args.first().map(String::as_str) == Some("logs") {
            // container stderr is delivered on the CLI's stderr
            stdout.push_str(&String::from_utf8_lossy(&output.stderr));
        }
        Ok(stdout)
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Arguments for `docker create`.
///
/// Environment values are not placed on the command line: each variable is
/// passed as `-e NAME` and its value is supplied through the CLI's own
/// environment, so credentials never show up in the process list.
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = strings(&["create", "--name", &spec.name]);

    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }
    for (key, _) in &spec.env {
        args.push("-e".to_string());
        args.push(key.clone());
    }
    for bind in &spec.binds {
        args.push("-v".to_string());
        let mut mount = format!("{}:{}", bind.host_path.display(), bind.container_path);
        if bind.read_only {
            mount.push_str(":ro");
        }
        args.push(mount);
    }

    args.push("-p".to_string());
    args.push(format!(
        "127.0.0.1:{}:{}",
        spec.port.host_port, spec.port.container_port
    ));
    args.push("--memory".to_string());
    args.push(format!("{}m", spec.memory_mb));
    args.push("--cpus".to_string());
    args.push(format!("{}", spec.cpus));
    args.push("--restart".to_string());
    args.push(format!("on-failure:{}", spec.restart_max_retries));
    args.push(spec.image.clone());
    args
}

/// Parse one `id\tname\tstate` line of `docker ps` output
pub fn parse_ps_line(line: &str) -> Option<ContainerSummary> {
    let mut parts = line.trim().split('\t');
    let id = parts.next()?.trim();
    let name = parts.next()?.trim();
    let state = parts.next().unwrap_or("").trim();
    if id.is_empty() || name.is_empty() {
        return None;
    }
    Some(ContainerSummary {
        id: id.to_string(),
        name: name.trim_start_matches('/').to_string(),
        state: state.to_string(),
    })
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let stdout = self.run(&create_args(spec), &spec.env).await?;
        let id = stdout.trim().lines().last().unwrap_or("").trim().to_string();
        if id.is_empty() {
            return Err(RuntimeError::CommandFailed {
                command: format!("{} create", self.binary),
                message: "runtime returned no container id".to_string(),
            });
        }
        info!(container = %spec.name, container_id = %id, "Created container");
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.run(&strings(&["start", id]), &[]).await?;
        Ok(())
    }

    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let secs = timeout.as_secs().to_string();
        self.run(&strings(&["stop", "-t", &secs, id]), &[]).await?;
        Ok(())
    }

    async fn restart(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let secs = timeout.as_secs().to_string();
        self.run(&strings(&["restart", "-t", &secs, id]), &[]).await?;
        Ok(())
    }

    async fn remove(&self, id_or_name: &str, force: bool) -> Result<(), RuntimeError> {
        let args = if force {
            strings(&["rm", "-f", id_or_name])
        } else {
            strings(&["rm", id_or_name])
        };
        self.run(&args, &[]).await?;
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<Option<ContainerInfo>, RuntimeError> {
        let format = "{{.Id}}\t{{.Name}}\t{{.State.Running}}\t{{.State.Status}}";
        let stdout = match self
            .run(&strings(&["inspect", "--type", "container", "--format", format, id]), &[])
            .await
        {
            Ok(stdout) => stdout,
            Err(RuntimeError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let fields: Vec<&str> = stdout.trim().split('\t').collect();
        if fields.len() < 4 {
            return Err(RuntimeError::CommandFailed {
                command: format!("{} inspect", self.binary),
                message: format!("unexpected output: {}", stdout.trim()),
            });
        }
        Ok(Some(ContainerInfo {
            id: fields[0].to_string(),
            name: fields[1].trim_start_matches('/').to_string(),
            running: fields[2] == "true",
            status: fields[3].to_string(),
        }))
    }

    async fn list(&self, name_prefix: &str) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let filter = format!("name=^{}", name_prefix);
        let stdout = self
            .run(
                &strings(&[
                    "ps",
                    "-a",
                    "--no-trunc",
                    "--filter",
                    &filter,
                    "--format",
                    "{{.ID}}\t{{.Names}}\t{{.State}}",
                ]),
                &[],
            )
            .await?;

        Ok(stdout
            .lines()
            .filter_map(parse_ps_line)
            .filter(|c| c.name.starts_with(name_prefix))
            .collect())
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        match self.run(&strings(&["image", "inspect", image]), &[]).await {
            Ok(_) => {
                debug!(image = %image, "Image already present");
                Ok(())
            }
            Err(RuntimeError::NotFound(_)) | Err(RuntimeError::CommandFailed { .. }) => {
                info!(image = %image, "Pulling image");
                self.run(&strings(&["pull", image]), &[]).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn logs(&self, id: &str, tail: usize, timestamps: bool) -> Result<String, RuntimeError> {
        let tail = tail.to_string();
        let mut args = strings(&["logs", "--tail", &tail]);
        if timestamps {
            args.push("--timestamps".to_string());
        }
        args.push(id.to_string());
        self.run(&args, &[]).await
    }
}
