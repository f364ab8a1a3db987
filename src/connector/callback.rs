//! Callback connector: the worker dials back to the coordinator.
//!
//! Useful when the coordinator cannot reach into the container network at
//! all. The runtime is started detached with the coordinator's URL and a
//! single-use secret; the coordinator accepts the inbound connection that
//! presents the matching secret.

use async_trait::async_trait;

use super::{Connector, ConnectorError, Transport, require_running};
use crate::config::RuntimeSpec;
use crate::engine::ContainerEngine;

/// Connector that starts the runtime in reverse-connection mode.
#[derive(Debug, Clone)]
pub struct CallbackConnector {
    coordinator_url: String,
}

impl CallbackConnector {
    /// `coordinator_url` is the address workers dial, e.g.
    /// `tcp://coordinator.internal:7000`.
    pub fn new(coordinator_url: impl Into<String>) -> Self {
        Self {
            coordinator_url: coordinator_url.into(),
        }
    }
}

#[async_trait]
impl Connector for CallbackConnector {
    fn name(&self) -> &'static str {
        "callback"
    }

    async fn launch(
        &self,
        engine: &dyn ContainerEngine,
        container_id: &str,
        runtime: &RuntimeSpec,
    ) -> Result<Transport, ConnectorError> {
        require_running(engine, container_id).await?;

        let secret = uuid::Uuid::new_v4().to_string();
        let mut cmd = vec![runtime.command.clone()];
        cmd.extend(runtime.args.iter().cloned());
        cmd.push("--connect-to".to_string());
        cmd.push(self.coordinator_url.clone());
        cmd.push("--secret".to_string());
        cmd.push(secret.clone());
        engine.exec_detached(container_id, &cmd).await?;

        tracing::info!(
            container_id = %container_id,
            coordinator_url = %self.coordinator_url,
            "worker runtime started in callback mode"
        );
        Ok(Transport::Callback {
            coordinator_url: self.coordinator_url.clone(),
            secret,
        })
    }
}
