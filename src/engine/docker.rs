//! Docker engine implementation backed by bollard.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use super::{
    AttachedExec, ContainerEngine, ContainerInfo, ContainerSpec, ContainerSummary, EngineError,
    PortBinding,
};
use crate::demux::{StreamKind, encode_frame};

/// Bollard-backed [`ContainerEngine`].
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect to the engine at `endpoint`.
    ///
    /// `unix://` sockets and `tcp://`/`http://` endpoints are supported;
    /// anything else falls back to the platform defaults.
    pub fn connect(endpoint: &str) -> Result<Self, EngineError> {
        let docker = if endpoint.starts_with("unix://") {
            Docker::connect_with_unix(endpoint, 60, bollard::API_DEFAULT_VERSION)
        } else if endpoint.starts_with("tcp://") || endpoint.starts_with("http://") {
            Docker::connect_with_http(endpoint, 60, bollard::API_DEFAULT_VERSION)
        } else {
            Docker::connect_with_local_defaults()
        }
        .map_err(|e| EngineError::Connection(e.to_string()))?;
        Ok(Self { docker })
    }
}

fn map_err(e: bollard::errors::Error) -> EngineError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => EngineError::Api {
            status: status_code,
            message,
        },
        other => EngineError::Connection(other.to_string()),
    }
}

fn build_config(spec: &ContainerSpec) -> Config<String> {
    let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
        .exposed_tcp_ports
        .iter()
        .map(|p| (format!("{p}/tcp"), HashMap::new()))
        .collect();

    Config {
        image: Some(spec.image.clone()),
        cmd: (!spec.cmd.is_empty()).then(|| spec.cmd.clone()),
        env: (!spec.env.is_empty()).then(|| spec.env.clone()),
        labels: Some(spec.labels.clone()),
        working_dir: spec.working_dir.clone(),
        user: spec.user.clone(),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        attach_stdin: Some(false),
        open_stdin: Some(false),
        host_config: Some(HostConfig {
            memory: spec.memory_limit_mb.map(|mb| (mb * 1024 * 1024) as i64),
            cpu_shares: spec.cpu_shares.map(|c| c as i64),
            network_mode: spec.network_mode.clone(),
            publish_all_ports: (!spec.exposed_tcp_ports.is_empty()).then_some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn parse_port_key(key: &str) -> Option<(u16, String)> {
    let (port, proto) = key.split_once('/')?;
    Some((port.parse().ok()?, proto.to_string()))
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions::<String> {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = stream.next().await {
            progress.map_err(map_err)?;
        }
        Ok(())
    }

    async fn image_present(&self, image: &str) -> Result<bool, EngineError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) => match map_err(e) {
                EngineError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn create_container(
        &self,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<String, EngineError> {
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    ..Default::default()
                }),
                build_config(spec),
            )
            .await
            .map_err(map_err)?;
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container::<String>(id, None)
            .await
            .map_err(map_err)
    }

    async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<(), EngineError> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: timeout_secs }))
            .await
            .map_err(map_err)
    }

    async fn remove_container(
        &self,
        id: &str,
        force: bool,
        remove_volumes: bool,
    ) -> Result<(), EngineError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    v: remove_volumes,
                    ..Default::default()
                }),
            )
            .await
            .map_err(map_err)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, EngineError> {
        let info = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(map_err)?;

        let running = info
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        let created_at = info
            .created
            .as_deref()
            .and_then(|c| chrono::DateTime::parse_from_rfc3339(c).ok())
            .map(|t| t.with_timezone(&chrono::Utc));

        let mut ports = Vec::new();
        if let Some(map) = info.network_settings.and_then(|n| n.ports) {
            for (key, bindings) in map {
                let Some((container_port, protocol)) = parse_port_key(&key) else {
                    continue;
                };
                for b in bindings.unwrap_or_default() {
                    let Some(host_port) = b.host_port.as_deref().and_then(|p| p.parse().ok())
                    else {
                        continue;
                    };
                    ports.push(PortBinding {
                        container_port,
                        protocol: protocol.clone(),
                        host_ip: b.host_ip.unwrap_or_default(),
                        host_port,
                    });
                }
            }
        }

        Ok(ContainerInfo {
            id: info.id.unwrap_or_else(|| id.to_string()),
            running,
            created_at,
            ports,
        })
    }

    async fn list_containers(
        &self,
        label_filters: &[String],
        all: bool,
    ) -> Result<Vec<ContainerSummary>, EngineError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), label_filters.to_vec());

        let rows = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(map_err)?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                Some(ContainerSummary {
                    id: row.id?,
                    name: row
                        .names
                        .and_then(|names| names.into_iter().next())
                        .map(|n| n.trim_start_matches('/').to_string()),
                    created_at: row
                        .created
                        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0)),
                    labels: row.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn put_archive(&self, id: &str, path: &str, tar: Vec<u8>) -> Result<(), EngineError> {
        self.docker
            .upload_to_container(
                id,
                Some(bollard::container::UploadToContainerOptions {
                    path: path.to_string(),
                    ..Default::default()
                }),
                tar.into(),
            )
            .await
            .map_err(map_err)
    }

    async fn exec_detached(&self, id: &str, cmd: &[String]) -> Result<(), EngineError> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions::<String> {
                    cmd: Some(cmd.to_vec()),
                    attach_stdin: Some(false),
                    attach_stdout: Some(false),
                    attach_stderr: Some(false),
                    ..Default::default()
                },
            )
            .await
            .map_err(map_err)?;
        self.docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn exec_attached(&self, id: &str, cmd: &[String]) -> Result<AttachedExec, EngineError> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions::<String> {
                    cmd: Some(cmd.to_vec()),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(map_err)?;

        let results = self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(map_err)?;

        let StartExecResults::Attached { mut output, input } = results else {
            return Err(EngineError::Api {
                status: 500,
                message: "exec unexpectedly detached".to_string(),
            });
        };

        // Bollard parses the engine's stream framing for us; restore it so
        // every engine implementation hands connectors the same wire form.
        let (mut frame_writer, frame_reader) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            while let Some(item) = output.next().await {
                let frame = match item {
                    Ok(bollard::container::LogOutput::StdOut { message })
                    | Ok(bollard::container::LogOutput::Console { message }) => {
                        encode_frame(StreamKind::Stdout, &message)
                    }
                    Ok(bollard::container::LogOutput::StdErr { message }) => {
                        encode_frame(StreamKind::Stderr, &message)
                    }
                    Ok(bollard::container::LogOutput::StdIn { message }) => {
                        encode_frame(StreamKind::Control, &message)
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "exec output stream ended with error");
                        break;
                    }
                };
                if frame_writer.write_all(&frame).await.is_err() {
                    break; // reader side went away
                }
            }
        });

        Ok(AttachedExec {
            stdin: input,
            output: Box::pin(frame_reader),
        })
    }
}
