//! Attach connector: the worker runtime runs as an attached exec and the
//! coordinator talks to it over the exec's stdio.
//!
//! No network path into the container is required, which makes this the
//! default strategy. The engine multiplexes the exec's stdout and stderr
//! over one stream; a background pump separates them again, forwarding
//! stdout (the worker protocol) into the transport and logging stderr.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use super::{Connector, ConnectorError, Transport, require_running};
use crate::config::RuntimeSpec;
use crate::demux::{ControlMode, pump};
use crate::engine::ContainerEngine;

/// Connector that launches the runtime through an attached exec.
#[derive(Debug, Default)]
pub struct AttachConnector {
    control: ControlMode,
}

impl AttachConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Surface control frames on the worker protocol stream instead of
    /// discarding them.
    pub fn with_control_mode(control: ControlMode) -> Self {
        Self { control }
    }
}

#[async_trait]
impl Connector for AttachConnector {
    fn name(&self) -> &'static str {
        "attach"
    }

    async fn launch(
        &self,
        engine: &dyn ContainerEngine,
        container_id: &str,
        runtime: &RuntimeSpec,
    ) -> Result<Transport, ConnectorError> {
        require_running(engine, container_id).await?;

        let mut cmd = vec![runtime.command.clone()];
        cmd.extend(runtime.args.iter().cloned());
        let exec = engine.exec_attached(container_id, &cmd).await?;

        let (protocol_writer, protocol_reader) = tokio::io::duplex(64 * 1024);
        let stderr = StderrLog::new(container_id);
        let control = self.control;
        let pump_task =
            tokio::spawn(async move { pump(exec.output, protocol_writer, stderr, control).await });

        tracing::info!(container_id = %container_id, command = %runtime.command, "attached to worker runtime");
        Ok(Transport::Attached {
            to_worker: exec.stdin,
            from_worker: Box::pin(protocol_reader),
            pump: pump_task,
        })
    }
}

/// Sink that logs the runtime's stderr line by line.
struct StderrLog {
    container_id: String,
    buf: Vec<u8>,
}

impl StderrLog {
    fn new(container_id: &str) -> Self {
        Self {
            container_id: container_id.to_string(),
            buf: Vec::new(),
        }
    }

    fn drain_lines(&mut self, keep_partial: bool) {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            tracing::warn!(container_id = %self.container_id, "worker stderr: {}", text.trim_end());
        }
        if !keep_partial && !self.buf.is_empty() {
            let text = String::from_utf8_lossy(&self.buf);
            tracing::warn!(container_id = %self.container_id, "worker stderr: {}", text.trim_end());
            self.buf.clear();
        }
    }
}

impl AsyncWrite for StderrLog {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        this.buf.extend_from_slice(buf);
        this.drain_lines(true);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.get_mut().drain_lines(false);
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.poll_flush(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::demux::{StreamKind, encode_frame};
    use crate::engine::ContainerSpec;
    use crate::engine::mock::MockEngine;

    async fn running_container(engine: &MockEngine) -> String {
        let id = engine
            .create_container("w", &ContainerSpec::default())
            .await
            .unwrap();
        engine.start_container(&id).await.unwrap();
        id
    }

    #[tokio::test]
    async fn launch_separates_protocol_from_stderr() {
        let engine = MockEngine::new();
        let id = running_container(&engine).await;

        let mut scripted = encode_frame(StreamKind::Stdout, b"hello");
        scripted.extend(encode_frame(StreamKind::Stderr, b"noise\n"));
        scripted.extend(encode_frame(StreamKind::Stdout, b" world"));
        engine.set_attach_output(scripted);

        let transport = AttachConnector::new()
            .launch(&engine, &id, &RuntimeSpec::default())
            .await
            .unwrap();
        let Transport::Attached {
            mut from_worker,
            pump,
            ..
        } = transport
        else {
            panic!("expected attached transport");
        };

        let mut protocol = String::new();
        from_worker.read_to_string(&mut protocol).await.unwrap();
        assert_eq!(protocol, "hello world");

        let forwarded = pump.await.unwrap().unwrap();
        assert_eq!(forwarded, ("hello world".len() + "noise\n".len()) as u64);
    }

    #[tokio::test]
    async fn launch_runs_runtime_command_with_args() {
        let engine = MockEngine::new();
        let id = running_container(&engine).await;

        let runtime = RuntimeSpec {
            args: vec!["--workdir".to_string(), "/home/build".to_string()],
            ..Default::default()
        };
        AttachConnector::new()
            .launch(&engine, &id, &runtime)
            .await
            .unwrap();

        let expected = format!("exec_attached {id} /usr/local/bin/kindling-agent --workdir /home/build");
        assert!(engine.calls().contains(&expected));
    }

    #[tokio::test]
    async fn launch_refuses_dead_container() {
        let engine = MockEngine::new();
        let id = engine
            .create_container("w", &ContainerSpec::default())
            .await
            .unwrap();

        let err = AttachConnector::new()
            .launch(&engine, &id, &RuntimeSpec::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::NotRunning { .. }));
    }
}
