//! SSH connector: reach the worker through the container's sshd.
//!
//! The container image must run an sshd on `container_port` (22 by
//! default), published to an ephemeral host port. Authentication is either
//! a configured credential id resolved by the caller, or a fresh ed25519
//! key generated per container and appended to `authorized_keys` inside it
//! before the first connection attempt. Keys are never reused across
//! workers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use super::{Connector, ConnectorError, Transport, archive_single_file, ensure_waiting_command,
    inject_runtime, require_running};
use crate::config::RuntimeSpec;
use crate::engine::{ContainerEngine, ContainerSpec, EngineError, PortBinding};

/// Name of the key-install script copied into the container.
const KEY_INSTALL_SCRIPT: &str = "install-worker-key.sh";

/// A per-container ed25519 keypair.
#[derive(Clone)]
pub struct SshKeyPair {
    signing: SigningKey,
}

impl SshKeyPair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Public key in OpenSSH form: `ssh-ed25519 <base64 blob>`.
    pub fn public_key_openssh(&self) -> String {
        let public = self.signing.verifying_key().to_bytes();
        let mut blob = Vec::with_capacity(4 + 11 + 4 + 32);
        blob.extend_from_slice(&(b"ssh-ed25519".len() as u32).to_be_bytes());
        blob.extend_from_slice(b"ssh-ed25519");
        blob.extend_from_slice(&(public.len() as u32).to_be_bytes());
        blob.extend_from_slice(&public);
        format!("ssh-ed25519 {}", BASE64.encode(blob))
    }

    /// One `authorized_keys` line for this key.
    pub fn authorized_key_line(&self) -> String {
        format!("{} kindling-ephemeral", self.public_key_openssh())
    }

    /// Raw private key seed, for handing to an SSH client library.
    pub fn private_key_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }
}

impl std::fmt::Debug for SshKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshKeyPair")
            .field("public", &self.public_key_openssh())
            .finish_non_exhaustive()
    }
}

/// How the caller should authenticate the SSH session.
#[derive(Debug, Clone)]
pub enum SshAuth {
    /// A key generated for this one container; the matching public key is
    /// already inside its `authorized_keys`.
    InjectedKey(SshKeyPair),
    /// A credential id the embedding system resolves itself.
    Credential { id: String },
}

/// Connector that waits for the container's sshd and hands back its
/// published address.
pub struct SshConnector {
    container_port: u16,
    advertised_host: Option<String>,
    authorized_keys_dir: String,
    connect_attempts: u32,
    retry_delay: Duration,
    credential: Option<String>,
    /// Keys generated per container, consumed by `launch`. Keyed by
    /// container id so concurrent provisions never cross wires.
    pending_keys: Mutex<HashMap<String, SshKeyPair>>,
}

impl Default for SshConnector {
    fn default() -> Self {
        Self {
            container_port: 22,
            advertised_host: None,
            authorized_keys_dir: "/root/.ssh".to_string(),
            connect_attempts: 30,
            retry_delay: Duration::from_secs(1),
            credential: None,
            pending_keys: Mutex::new(HashMap::new()),
        }
    }
}

impl SshConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a pre-provisioned credential instead of injecting a key.
    pub fn with_credential(mut self, id: impl Into<String>) -> Self {
        self.credential = Some(id.into());
        self
    }

    /// Host to advertise instead of the engine-reported binding address.
    /// Needed when the engine host is reached through NAT.
    pub fn with_advertised_host(mut self, host: impl Into<String>) -> Self {
        self.advertised_host = Some(host.into());
        self
    }

    pub fn with_container_port(mut self, port: u16) -> Self {
        self.container_port = port;
        self
    }

    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.connect_attempts = attempts;
        self.retry_delay = delay;
        self
    }

    fn pending_keys(&self) -> std::sync::MutexGuard<'_, HashMap<String, SshKeyPair>> {
        self.pending_keys.lock().expect("pending keys mutex poisoned")
    }

    #[cfg(test)]
    pub(crate) fn pending_key_count(&self) -> usize {
        self.pending_keys().len()
    }

    /// Write the public key into the container's `authorized_keys`.
    ///
    /// A small install script is copied in as a one-file archive and run
    /// to completion, so the key is in place before any connection
    /// attempt can race it.
    async fn install_authorized_key(
        &self,
        engine: &dyn ContainerEngine,
        container_id: &str,
        key: &SshKeyPair,
    ) -> Result<(), ConnectorError> {
        let script = format!(
            "#!/bin/sh\nset -e\nmkdir -p {dir}\nchmod 700 {dir}\nprintf '%s\\n' '{line}' >> {dir}/authorized_keys\nchmod 600 {dir}/authorized_keys\n",
            dir = self.authorized_keys_dir,
            line = key.authorized_key_line(),
        );
        let archive = archive_single_file(KEY_INSTALL_SCRIPT, 0o700, script.as_bytes())
            .map_err(EngineError::from)?;
        engine.put_archive(container_id, "/tmp", archive).await?;

        let exec = engine
            .exec_attached(
                container_id,
                &["/bin/sh".to_string(), format!("/tmp/{KEY_INSTALL_SCRIPT}")],
            )
            .await?;
        // Drain to end of stream: the exec has finished and the file exists.
        let mut output = exec.output;
        tokio::io::copy(&mut output, &mut tokio::io::sink())
            .await
            .map_err(EngineError::from)?;
        tracing::debug!(container_id = %container_id, "installed ephemeral ssh key");
        Ok(())
    }

    fn advertised_host_for(&self, binding: &PortBinding) -> String {
        if let Some(host) = &self.advertised_host {
            return host.clone();
        }
        match binding.host_ip.as_str() {
            "" | "0.0.0.0" | "::" => "127.0.0.1".to_string(),
            other => other.to_string(),
        }
    }

    /// Wait for an sshd to greet us at `host:port`.
    async fn wait_for_sshd(&self, host: &str, port: u16) -> Result<(), ConnectorError> {
        for attempt in 0..self.connect_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }
            let probe = tokio::time::timeout(self.retry_delay.max(Duration::from_millis(250)), async {
                let mut stream = TcpStream::connect((host, port)).await?;
                let mut banner = [0u8; 255];
                let n = stream.read(&mut banner).await?;
                Ok::<bool, std::io::Error>(banner[..n].starts_with(b"SSH-"))
            });
            match probe.await {
                Ok(Ok(true)) => return Ok(()),
                Ok(Ok(false)) => {
                    tracing::debug!(host, port, attempt, "port open but no SSH banner yet")
                }
                Ok(Err(e)) => tracing::trace!(host, port, attempt, error = %e, "sshd not up yet"),
                Err(_) => tracing::trace!(host, port, attempt, "sshd probe timed out"),
            }
        }
        Err(ConnectorError::Timeout {
            operation: "ssh banner",
            attempts: self.connect_attempts,
            delay_ms: self.retry_delay.as_millis() as u64,
        })
    }
}

/// Pick the host binding for `container_port`.
///
/// Engines may report several bindings for one container port (multiple
/// host addresses, historical duplicates). The lowest host port wins, so
/// repeated inspects of the same container always resolve to the same
/// address.
fn select_binding(ports: &[PortBinding], container_port: u16) -> Option<&PortBinding> {
    ports
        .iter()
        .filter(|b| b.container_port == container_port && b.protocol == "tcp")
        .min_by_key(|b| b.host_port)
}

#[async_trait]
impl Connector for SshConnector {
    fn name(&self) -> &'static str {
        "ssh"
    }

    async fn before_container_created(
        &self,
        spec: &mut ContainerSpec,
    ) -> Result<(), ConnectorError> {
        ensure_waiting_command(spec);
        if !spec.exposed_tcp_ports.contains(&self.container_port) {
            spec.exposed_tcp_ports.push(self.container_port);
        }
        Ok(())
    }

    async fn after_container_started(
        &self,
        engine: &dyn ContainerEngine,
        container_id: &str,
        runtime: &RuntimeSpec,
    ) -> Result<(), ConnectorError> {
        inject_runtime(engine, container_id, runtime).await?;
        if self.credential.is_some() {
            return Ok(());
        }

        let key = SshKeyPair::generate();
        self.install_authorized_key(engine, container_id, &key)
            .await?;
        self.pending_keys()
            .insert(container_id.to_string(), key);
        Ok(())
    }

    async fn launch(
        &self,
        engine: &dyn ContainerEngine,
        container_id: &str,
        _runtime: &RuntimeSpec,
    ) -> Result<Transport, ConnectorError> {
        let result = self.connect(engine, container_id).await;
        if result.is_err() {
            // A key injected for a launch that will never happen is dead
            // weight; drop it so the map only tracks live provisions.
            self.pending_keys().remove(container_id);
        }
        result
    }
}

impl SshConnector {
    async fn connect(
        &self,
        engine: &dyn ContainerEngine,
        container_id: &str,
    ) -> Result<Transport, ConnectorError> {
        let info = require_running(engine, container_id).await?;
        let binding =
            select_binding(&info.ports, self.container_port).ok_or(ConnectorError::MissingBinding {
                port: self.container_port,
            })?;
        let host = self.advertised_host_for(binding);
        let port = binding.host_port;

        self.wait_for_sshd(&host, port).await?;

        let auth = match &self.credential {
            Some(id) => SshAuth::Credential { id: id.clone() },
            None => {
                let key = self.pending_keys().remove(container_id).ok_or_else(|| {
                    ConnectorError::KeyNotInjected {
                        id: container_id.to_string(),
                    }
                })?;
                SshAuth::InjectedKey(key)
            }
        };

        tracing::info!(container_id = %container_id, host = %host, port, "worker sshd is up");
        Ok(Transport::Ssh { host, port, auth })
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::engine::mock::MockEngine;

    fn binding(container_port: u16, host_port: u16) -> PortBinding {
        PortBinding {
            container_port,
            protocol: "tcp".to_string(),
            host_ip: "0.0.0.0".to_string(),
            host_port,
        }
    }

    #[test]
    fn lowest_host_port_wins() {
        let ports = vec![
            binding(22, 49155),
            binding(22, 49153),
            binding(8080, 49151),
            PortBinding {
                protocol: "udp".to_string(),
                ..binding(22, 49150)
            },
        ];
        let chosen = select_binding(&ports, 22).unwrap();
        assert_eq!(chosen.host_port, 49153);
        assert!(select_binding(&ports, 443).is_none());
    }

    #[test]
    fn authorized_key_line_is_wire_correct() {
        let key = SshKeyPair::generate();
        let line = key.authorized_key_line();
        let mut parts = line.split_whitespace();
        assert_eq!(parts.next(), Some("ssh-ed25519"));

        let blob = BASE64.decode(parts.next().unwrap()).unwrap();
        // string "ssh-ed25519" + string public key (32 bytes)
        assert_eq!(blob.len(), 4 + 11 + 4 + 32);
        assert_eq!(&blob[..4], &11u32.to_be_bytes());
        assert_eq!(&blob[4..15], b"ssh-ed25519");
        assert_eq!(&blob[15..19], &32u32.to_be_bytes());
        assert_eq!(parts.next(), Some("kindling-ephemeral"));
    }

    #[test]
    fn ssh_spec_exposes_the_ssh_port() {
        let connector = SshConnector::new();
        let mut spec = ContainerSpec::default();
        futures::executor::block_on(connector.before_container_created(&mut spec)).unwrap();
        assert_eq!(spec.exposed_tcp_ports, vec![22]);
        assert!(!spec.cmd.is_empty());
    }

    async fn fake_sshd() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn launch_hands_out_injected_key() {
        let (listener, port) = fake_sshd().await;
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let _ = stream.write_all(b"SSH-2.0-kindling-test\r\n").await;
            }
        });

        let engine = MockEngine::new();
        let id = engine
            .create_container("w", &ContainerSpec::default())
            .await
            .unwrap();
        engine.start_container(&id).await.unwrap();
        engine.set_bindings(vec![binding(22, port)]);

        let connector = SshConnector::new().with_retry(3, Duration::from_millis(50));
        connector
            .after_container_started(&engine, &id, &RuntimeSpec::default())
            .await
            .unwrap();
        // Key install goes in as an archived script, run to completion.
        let calls = engine.calls();
        assert!(calls.iter().any(|c| c.starts_with("put_archive") && c.contains("/tmp")));
        assert!(
            calls
                .iter()
                .any(|c| c.contains("exec_attached") && c.contains("install-worker-key.sh"))
        );

        let transport = connector
            .launch(&engine, &id, &RuntimeSpec::default())
            .await
            .unwrap();
        match transport {
            Transport::Ssh {
                host,
                port: p,
                auth: SshAuth::InjectedKey(_),
            } => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(p, port);
            }
            other => panic!("unexpected transport: {other:?}"),
        }
        // The key is single-use: a second launch has nothing to hand out.
        let err = connector
            .launch(&engine, &id, &RuntimeSpec::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::KeyNotInjected { .. }));
    }

    #[tokio::test]
    async fn credential_mode_skips_key_injection() {
        let (listener, port) = fake_sshd().await;
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let _ = stream.write_all(b"SSH-2.0-kindling-test\r\n").await;
            }
        });

        let engine = MockEngine::new();
        let id = engine
            .create_container("w", &ContainerSpec::default())
            .await
            .unwrap();
        engine.start_container(&id).await.unwrap();
        engine.set_bindings(vec![binding(22, port)]);

        let connector = SshConnector::new()
            .with_credential("build-ssh-cred")
            .with_retry(3, Duration::from_millis(50));
        connector
            .after_container_started(&engine, &id, &RuntimeSpec::default())
            .await
            .unwrap();
        assert!(
            !engine
                .calls()
                .iter()
                .any(|c| c.contains("install-worker-key.sh"))
        );

        let transport = connector
            .launch(&engine, &id, &RuntimeSpec::default())
            .await
            .unwrap();
        match transport {
            Transport::Ssh {
                auth: SshAuth::Credential { id },
                ..
            } => assert_eq!(id, "build-ssh-cred"),
            other => panic!("unexpected transport: {other:?}"),
        }
    }

    #[tokio::test]
    async fn sshd_wait_gives_up_after_bounded_attempts() {
        // Bind then drop so the port is closed at probe time.
        let (listener, port) = fake_sshd().await;
        drop(listener);

        let engine = MockEngine::new();
        let id = engine
            .create_container("w", &ContainerSpec::default())
            .await
            .unwrap();
        engine.start_container(&id).await.unwrap();
        engine.set_bindings(vec![binding(22, port)]);

        let connector = SshConnector::new().with_retry(2, Duration::from_millis(10));
        let err = connector
            .launch(&engine, &id, &RuntimeSpec::default())
            .await
            .unwrap_err();
        match err {
            ConnectorError::Timeout {
                operation,
                attempts,
                ..
            } => {
                assert_eq!(operation, "ssh banner");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn failed_launch_discards_the_pending_key() {
        let engine = MockEngine::new();
        let id = engine
            .create_container("w", &ContainerSpec::default())
            .await
            .unwrap();
        engine.start_container(&id).await.unwrap();

        let connector = SshConnector::new().with_retry(2, Duration::from_millis(10));
        connector
            .after_container_started(&engine, &id, &RuntimeSpec::default())
            .await
            .unwrap();
        assert_eq!(connector.pending_key_count(), 1);

        // No published binding: the launch fails and must not strand the key.
        let err = connector
            .launch(&engine, &id, &RuntimeSpec::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::MissingBinding { port: 22 }));
        assert_eq!(connector.pending_key_count(), 0);
    }

    #[tokio::test]
    async fn launch_without_binding_fails() {
        let engine = MockEngine::new();
        let id = engine
            .create_container("w", &ContainerSpec::default())
            .await
            .unwrap();
        engine.start_container(&id).await.unwrap();

        let err = SshConnector::new()
            .launch(&engine, &id, &RuntimeSpec::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::MissingBinding { port: 22 }));
    }
}
