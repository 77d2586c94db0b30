use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, DownloadFromContainerOptions,
    InspectContainerOptions, LogOutput, RemoveContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::ContainerInspectResponse;
use bollard::Docker;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::io::Read;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::error::lease_secs;
use super::{resolve_path, CommandOutput, OutputChunk, SandboxError, SandboxHandle, SandboxProvider};
use crate::config::SandboxConfig;

/// File inside the container holding the lease deadline (unix seconds).
const LEASE_FILE: &str = "/tmp/.imaginate-lease";

/// Label marking containers owned by imaginate.
const MANAGED_LABEL: &str = "imaginate.managed";

/// Runs sandboxes as Docker containers.
///
/// The container's init process watches a lease file and exits once the
/// deadline passes; containers are created with `auto_remove`, so an expired
/// lease reclaims the sandbox even if the driving process is gone.
pub(crate) struct DockerSandbox {
    docker: Docker,
    config: SandboxConfig,
}

impl DockerSandbox {
    /// Connects to the Docker daemon (honours `DOCKER_HOST`) and checks it responds.
    pub async fn connect_local(config: SandboxConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::docker_unavailable(e.to_string()))?;

        docker
            .ping()
            .await
            .map_err(|e| SandboxError::docker_unavailable(e.to_string()))
            .context("Cannot ping Docker daemon. Is Docker running?")?;

        Ok(Self { docker, config })
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    fn build_container_config(&self, template: &str) -> Result<ContainerConfig<String>> {
        let resources = &self.config.resources;
        let memory = parse_memory_limit(&resources.memory)?;
        let cpus = resources.cpus.parse::<f64>().unwrap_or(2.0);

        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert("imaginate.template".to_string(), template.to_string());

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(format!("{}/tcp", self.config.port), HashMap::new());

        #[allow(clippy::cast_possible_truncation)]
        let nano_cpus = (cpus * 1_000_000_000.0) as i64;

        Ok(ContainerConfig {
            image: Some(template.to_string()),
            entrypoint: Some(vec!["sh".to_string(), "-c".to_string()]),
            cmd: Some(vec![init_script(
                &self.config.workdir,
                self.config.start_command.as_deref(),
            )]),
            env: Some(vec![format!(
                "IMAGINATE_LEASE_SECS={}",
                lease_secs(self.idle_timeout())
            )]),
            working_dir: Some(self.config.workdir.clone()),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(bollard::service::HostConfig {
                auto_remove: Some(true),
                publish_all_ports: Some(true),
                memory: Some(memory),
                nano_cpus: Some(nano_cpus),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    async fn inspect(&self, session_id: &str) -> Result<ContainerInspectResponse> {
        match self
            .docker
            .inspect_container(session_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(info),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(SandboxError::session_not_found(session_id).into()),
            Err(e) => Err(SandboxError::container_failed(e.to_string()).into()),
        }
    }
}

#[async_trait]
impl SandboxProvider for DockerSandbox {
    async fn create(&self, template: &str) -> Result<String> {
        let name = format!(
            "imaginate-{}",
            uuid::Uuid::new_v4().simple().to_string().get(..12).unwrap_or("sandbox")
        );
        info!("Creating sandbox {} from template {}", name, template);

        let container_config = self.build_container_config(template)?;

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| match e {
                DockerError::DockerResponseServerError {
                    status_code: 404, ..
                } => SandboxError::template_not_found(template),
                other => SandboxError::container_failed(other.to_string()),
            })?;

        for warning in &created.warnings {
            warn!("Docker warning for {}: {}", name, warning);
        }

        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| SandboxError::container_failed(e.to_string()))
            .context("Failed to start sandbox container")?;

        debug!("Sandbox {} started as container {}", name, created.id);
        Ok(created.id)
    }

    async fn connect(&self, session_id: &str) -> Result<Box<dyn SandboxHandle>> {
        let info = self.inspect(session_id).await?;
        let running = info
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        if !running {
            return Err(SandboxError::session_not_found(session_id).into());
        }

        let handle = DockerSandboxHandle {
            docker: self.docker.clone(),
            session_id: session_id.to_string(),
            config: self.config.clone(),
        };

        let refresh = lease_refresh_command(lease_secs(self.idle_timeout()));
        handle
            .exec(&refresh, &mut |_: OutputChunk<'_>| {})
            .await
            .context("Failed to refresh sandbox idle timeout")?;

        debug!("Reconnected to sandbox {}", session_id);
        Ok(Box::new(handle))
    }

    async fn release(&self, session_id: &str) -> Result<()> {
        match self
            .docker
            .remove_container(
                session_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {
                info!("Released sandbox {}", session_id);
                Ok(())
            }
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!("Sandbox {} already gone", session_id);
                Ok(())
            }
            Err(e) => Err(SandboxError::container_failed(e.to_string()).into()),
        }
    }
}

/// Handle to one running sandbox container.
struct DockerSandboxHandle {
    docker: Docker,
    session_id: String,
    config: SandboxConfig,
}

impl DockerSandboxHandle {
    /// Runs `sh -c command` in the container and streams its output.
    async fn exec(
        &self,
        command: &str,
        on_output: &mut (dyn for<'c> FnMut(OutputChunk<'c>) + Send),
    ) -> Result<CommandOutput> {
        let exec = self
            .docker
            .create_exec(
                &self.session_id,
                CreateExecOptions {
                    cmd: Some(vec!["sh", "-c", command]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(self.config.workdir.as_str()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::container_failed(e.to_string()))?;

        let mut output = CommandOutput::default();

        if let StartExecResults::Attached {
            output: mut stream, ..
        } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| SandboxError::container_failed(e.to_string()))?
        {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        let text = String::from_utf8_lossy(&message);
                        on_output(OutputChunk::Stdout(&text));
                        output.stdout.push_str(&text);
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        let text = String::from_utf8_lossy(&message);
                        on_output(OutputChunk::Stderr(&text));
                        output.stderr.push_str(&text);
                    }
                    Err(e) => {
                        warn!("Error reading exec output: {}", e);
                    }
                    _ => {}
                }
            }
        }

        let inspected = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| SandboxError::container_failed(e.to_string()))?;
        output.exit_code = inspected.exit_code.unwrap_or(0);

        if output.exit_code != 0 {
            return Err(SandboxError::CommandFailed {
                exit_code: output.exit_code,
            }
            .into());
        }

        Ok(output)
    }
}

#[async_trait]
impl SandboxHandle for DockerSandboxHandle {
    async fn run_command(
        &self,
        command: &str,
        on_output: &mut (dyn for<'c> FnMut(OutputChunk<'c>) + Send),
    ) -> Result<CommandOutput> {
        let secs = self.config.command_timeout_secs;
        let timeout = Duration::from_secs(secs);
        debug!("Running in sandbox {}: {}", self.session_id, command);

        // `timeout` kills the process inside the container; the local deadline
        // only covers a daemon that stops answering.
        let bounded = bounded_command(command, secs);
        let local_deadline = timeout + Duration::from_secs(2 * KILL_GRACE_SECS);
        match tokio::time::timeout(local_deadline, self.exec(&bounded, on_output)).await {
            Err(_) => Err(SandboxError::timeout(timeout).into()),
            Ok(Err(e)) if is_timeout_exit(&e) => Err(SandboxError::timeout(timeout).into()),
            Ok(result) => result,
        }
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let resolved = resolve_path(&self.config.workdir, path);

        if let Some((parent, _)) = resolved.rsplit_once('/') {
            if !parent.is_empty() {
                let mkdir = format!("mkdir -p {}", shell_words::quote(parent));
                self.exec(&mkdir, &mut |_: OutputChunk<'_>| {})
                    .await
                    .map_err(|e| SandboxError::file_failed(path, e.to_string()))?;
            }
        }

        let archive = single_file_archive(resolved.trim_start_matches('/'), content)
            .map_err(|e| SandboxError::file_failed(path, e.to_string()))?;

        self.docker
            .upload_to_container(
                &self.session_id,
                Some(UploadToContainerOptions {
                    path: "/".to_string(),
                    ..Default::default()
                }),
                archive,
            )
            .await
            .map_err(|e| SandboxError::file_failed(path, e.to_string()))?;

        debug!("Wrote {} ({} bytes)", resolved, content.len());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let resolved = resolve_path(&self.config.workdir, path);

        let mut stream = self.docker.download_from_container(
            &self.session_id,
            Some(DownloadFromContainerOptions {
                path: resolved.clone(),
            }),
        );

        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => archive.extend_from_slice(&bytes),
                Err(DockerError::DockerResponseServerError {
                    status_code: 404, ..
                }) => return Err(SandboxError::file_failed(path, "no such file").into()),
                Err(e) => return Err(SandboxError::file_failed(path, e.to_string()).into()),
            }
        }

        first_file_in_archive(&archive)
            .map_err(|e| SandboxError::file_failed(path, e.to_string()).into())
    }

    async fn public_url(&self, port: u16) -> Result<String> {
        let info = self
            .docker
            .inspect_container(&self.session_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| SandboxError::container_failed(e.to_string()))?;

        let host_port = info
            .network_settings
            .and_then(|n| n.ports)
            .and_then(|ports| ports.get(&format!("{port}/tcp")).cloned().flatten())
            .and_then(|bindings| bindings.into_iter().find_map(|b| b.host_port))
            .filter(|p| !p.is_empty())
            .ok_or_else(|| SandboxError::port_not_exposed(&self.session_id, port))?;

        Ok(format!(
            "{}://{}:{}",
            self.config.public_scheme, self.config.public_host, host_port
        ))
    }
}

/// Seconds between TERM and KILL inside the container, and extra slack for
/// the local deadline.
const KILL_GRACE_SECS: u64 = 5;

/// Exit statuses `timeout` reports for a command it stopped (TERM, then KILL).
const TIMEOUT_EXIT_CODES: [i64; 2] = [124, 137];

/// Wraps `command` so the container kills it after `secs` seconds.
fn bounded_command(command: &str, secs: u64) -> String {
    format!(
        "timeout -k {KILL_GRACE_SECS} {} sh -c {}",
        secs.max(1),
        shell_words::quote(command)
    )
}

fn is_timeout_exit(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<SandboxError>(),
        Some(SandboxError::CommandFailed { exit_code }) if TIMEOUT_EXIT_CODES.contains(exit_code)
    )
}

/// Pushes the lease deadline `secs` past now, using the container's own clock.
fn lease_refresh_command(secs: u64) -> String {
    format!("echo $(( $(date +%s) + {secs} )) > {LEASE_FILE}")
}

/// Shell script run as the container's init process.
///
/// Writes the initial lease, optionally starts the template's dev server in the
/// background, then idles until the lease deadline passes.
fn init_script(workdir: &str, start_command: Option<&str>) -> String {
    let mut script = format!(
        "echo $(( $(date +%s) + ${{IMAGINATE_LEASE_SECS:-300}} )) > {LEASE_FILE}\n"
    );
    if let Some(start) = start_command {
        script.push_str(&format!(
            "(cd {} && {}) &\n",
            shell_words::quote(workdir),
            start
        ));
    }
    script.push_str(&format!(
        "while [ \"$(date +%s)\" -lt \"$(cat {LEASE_FILE} 2>/dev/null || echo 0)\" ]; \
         do sleep 5; done\n"
    ));
    script
}

/// Builds a tar archive holding one regular file.
fn single_file_archive(path: &str, content: &str) -> std::io::Result<Bytes> {
    let mut buf = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut buf);
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(
            u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default(),
        );
        builder.append_data(&mut header, path, content.as_bytes())?;
        builder.finish()?;
    }
    Ok(Bytes::from(buf))
}

/// Returns the text of the first regular file in a tar archive.
fn first_file_in_archive(archive: &[u8]) -> Result<String> {
    let mut archive = tar::Archive::new(archive);
    for entry in archive.entries().context("Invalid archive from sandbox")? {
        let mut entry = entry.context("Invalid archive entry")?;
        if entry.header().entry_type().is_file() {
            let mut content = String::new();
            entry
                .read_to_string(&mut content)
                .context("File is not valid UTF-8 text")?;
            return Ok(content);
        }
    }
    anyhow::bail!("path is not a regular file")
}

/// Parse memory limit string (e.g., "8g", "512m") to bytes
fn parse_memory_limit(limit: &str) -> Result<i64> {
    let limit = limit.to_lowercase();

    if let Some(num) = limit.strip_suffix('g') {
        let gigs: i64 = num.parse().context("Invalid memory limit")?;
        Ok(gigs * 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        let megs: i64 = num.parse().context("Invalid memory limit")?;
        Ok(megs * 1024 * 1024)
    } else {
        limit.parse().context("Invalid memory limit")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("8g").unwrap(), 8 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1G").unwrap(), 1024 * 1024 * 1024);
        assert!(parse_memory_limit("lots").is_err());
    }

    #[test]
    fn test_init_script_without_start_command() {
        let script = init_script("/home/user", None);
        assert!(script.contains(LEASE_FILE));
        assert!(script.contains("IMAGINATE_LEASE_SECS"));
        assert!(!script.contains("&\n"));
    }

    #[test]
    fn test_init_script_starts_dev_server_in_background() {
        let script = init_script("/home/user", Some("npm run dev"));
        assert!(script.contains("(cd /home/user && npm run dev) &"));
        assert!(script.ends_with("done\n"));
    }

    #[test]
    fn test_lease_refresh_writes_the_file_init_watches() {
        assert_eq!(
            lease_refresh_command(300),
            "echo $(( $(date +%s) + 300 )) > /tmp/.imaginate-lease"
        );

        let script = init_script("/home/user", None);
        let initial = format!(
            "echo $(( $(date +%s) + ${{IMAGINATE_LEASE_SECS:-300}} )) > {LEASE_FILE}"
        );
        assert!(script.starts_with(&initial));
        assert!(script.contains(&format!("$(cat {LEASE_FILE} 2>/dev/null || echo 0)")));
    }

    #[test]
    fn test_refresh_uses_whole_seconds_of_idle_timeout() {
        let refresh = lease_refresh_command(lease_secs(Duration::from_millis(1500)));
        assert!(refresh.contains("+ 1 ))"));
    }

    #[test]
    fn test_bounded_command_kills_after_timeout() {
        assert_eq!(
            bounded_command("npm install && npm run build", 60),
            "timeout -k 5 60 sh -c 'npm install && npm run build'"
        );
        assert!(bounded_command("ls", 0).starts_with("timeout -k 5 1 "));
    }

    #[test]
    fn test_killed_exit_is_classified_as_timeout() {
        let stopped = anyhow::Error::new(SandboxError::CommandFailed { exit_code: 124 });
        let killed = anyhow::Error::new(SandboxError::CommandFailed { exit_code: 137 });
        let failed = anyhow::Error::new(SandboxError::CommandFailed { exit_code: 1 });
        assert!(is_timeout_exit(&stopped));
        assert!(is_timeout_exit(&killed));
        assert!(!is_timeout_exit(&failed));
        assert!(!is_timeout_exit(&anyhow::anyhow!("other")));
    }

    #[test]
    fn test_archive_roundtrip_single_file() {
        let archive = single_file_archive("home/user/index.html", "<html></html>").unwrap();
        let content = first_file_in_archive(&archive).unwrap();
        assert_eq!(content, "<html></html>");
    }

    #[test]
    fn test_first_file_in_empty_archive_fails() {
        let mut buf = Vec::new();
        tar::Builder::new(&mut buf).finish().unwrap();
        assert!(first_file_in_archive(&buf).is_err());
    }
}
