//! Scripted in-memory engine for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    AttachedExec, ContainerEngine, ContainerInfo, ContainerSpec, ContainerSummary, EngineError,
    PortBinding,
};

#[derive(Debug, Clone)]
pub(crate) struct MockContainer {
    pub name: String,
    pub spec: ContainerSpec,
    pub running: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    containers: HashMap<String, MockContainer>,
    calls: Vec<String>,
    next_id: u64,
    report_not_running: bool,
    fail_start: bool,
    fail_stop: bool,
    image_present: bool,
    attach_output: Vec<u8>,
    bindings: Vec<PortBinding>,
}

/// Engine double that records every call and plays back scripted state.
#[derive(Default)]
pub(crate) struct MockEngine {
    inner: Mutex<Inner>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("mock engine mutex poisoned")
    }

    /// Make `inspect_container` report the container as not running.
    pub fn report_not_running(&self) {
        self.lock().report_not_running = true;
    }

    pub fn fail_start(&self) {
        self.lock().fail_start = true;
    }

    pub fn fail_stop(&self) {
        self.lock().fail_stop = true;
    }

    pub fn set_image_present(&self, present: bool) {
        self.lock().image_present = present;
    }

    /// Raw framed bytes handed out by `exec_attached`.
    pub fn set_attach_output(&self, bytes: Vec<u8>) {
        self.lock().attach_output = bytes;
    }

    pub fn set_bindings(&self, bindings: Vec<PortBinding>) {
        self.lock().bindings = bindings;
    }

    /// Pre-seed a container, e.g. a stray one for watchdog tests.
    pub fn seed_container(
        &self,
        id: &str,
        name: &str,
        labels: HashMap<String, String>,
        created_at: DateTime<Utc>,
    ) {
        self.lock().containers.insert(
            id.to_string(),
            MockContainer {
                name: name.to_string(),
                spec: ContainerSpec {
                    labels,
                    ..Default::default()
                },
                running: true,
                created_at,
            },
        );
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn has_container(&self, id: &str) -> bool {
        self.lock().containers.contains_key(id)
    }

    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        let mut inner = self.lock();
        inner.calls.push(format!("pull {image}"));
        inner.image_present = true;
        Ok(())
    }

    async fn image_present(&self, image: &str) -> Result<bool, EngineError> {
        let mut inner = self.lock();
        inner.calls.push(format!("image_present {image}"));
        Ok(inner.image_present)
    }

    async fn create_container(
        &self,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<String, EngineError> {
        let mut inner = self.lock();
        inner.next_id += 1;
        // Uniqueness must sit in the leading characters: worker names are
        // derived from an id prefix, the way real engines put the entropy
        // up front.
        let id = format!("{:012x}c0de", inner.next_id);
        inner.calls.push(format!("create {name} -> {id}"));
        inner.containers.insert(
            id.clone(),
            MockContainer {
                name: name.to_string(),
                spec: spec.clone(),
                running: false,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        let mut inner = self.lock();
        inner.calls.push(format!("start {id}"));
        if inner.fail_start {
            return Err(EngineError::Api {
                status: 500,
                message: "scripted start failure".into(),
            });
        }
        match inner.containers.get_mut(id) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => Err(EngineError::NotFound(format!("no such container {id}"))),
        }
    }

    async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<(), EngineError> {
        let mut inner = self.lock();
        inner.calls.push(format!("stop {id} t={timeout_secs}"));
        if inner.fail_stop && inner.containers.contains_key(id) {
            return Err(EngineError::Api {
                status: 500,
                message: "scripted stop failure".into(),
            });
        }
        match inner.containers.get_mut(id) {
            Some(c) => {
                c.running = false;
                Ok(())
            }
            None => Err(EngineError::NotFound(format!("no such container {id}"))),
        }
    }

    async fn remove_container(
        &self,
        id: &str,
        force: bool,
        remove_volumes: bool,
    ) -> Result<(), EngineError> {
        let mut inner = self.lock();
        inner
            .calls
            .push(format!("remove {id} force={force} v={remove_volumes}"));
        match inner.containers.remove(id) {
            Some(_) => Ok(()),
            None => Err(EngineError::NotFound(format!("no such container {id}"))),
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, EngineError> {
        let mut inner = self.lock();
        inner.calls.push(format!("inspect {id}"));
        let c = inner
            .containers
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("no such container {id}")))?;
        Ok(ContainerInfo {
            id: id.to_string(),
            running: c.running && !inner.report_not_running,
            created_at: Some(c.created_at),
            ports: inner.bindings.clone(),
        })
    }

    async fn list_containers(
        &self,
        label_filters: &[String],
        _all: bool,
    ) -> Result<Vec<ContainerSummary>, EngineError> {
        let mut inner = self.lock();
        inner.calls.push(format!("list {label_filters:?}"));
        let wanted: Vec<(&str, &str)> = label_filters
            .iter()
            .filter_map(|f| f.split_once('='))
            .collect();
        Ok(inner
            .containers
            .iter()
            .filter(|(_, c)| {
                wanted
                    .iter()
                    .all(|(k, v)| c.spec.labels.get(*k).map(String::as_str) == Some(*v))
            })
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                name: Some(c.name.clone()),
                created_at: Some(c.created_at),
                labels: c.spec.labels.clone(),
            })
            .collect())
    }

    async fn put_archive(&self, id: &str, path: &str, tar: Vec<u8>) -> Result<(), EngineError> {
        let mut inner = self.lock();
        inner
            .calls
            .push(format!("put_archive {id} {path} ({} bytes)", tar.len()));
        if !inner.containers.contains_key(id) {
            return Err(EngineError::NotFound(format!("no such container {id}")));
        }
        Ok(())
    }

    async fn exec_detached(&self, id: &str, cmd: &[String]) -> Result<(), EngineError> {
        let mut inner = self.lock();
        inner
            .calls
            .push(format!("exec_detached {id} {}", cmd.join(" ")));
        if !inner.containers.contains_key(id) {
            return Err(EngineError::NotFound(format!("no such container {id}")));
        }
        Ok(())
    }

    async fn exec_attached(&self, id: &str, cmd: &[String]) -> Result<AttachedExec, EngineError> {
        let mut inner = self.lock();
        inner
            .calls
            .push(format!("exec_attached {id} {}", cmd.join(" ")));
        if !inner.containers.contains_key(id) {
            return Err(EngineError::NotFound(format!("no such container {id}")));
        }
        Ok(AttachedExec {
            stdin: Box::pin(tokio::io::sink()),
            output: Box::pin(std::io::Cursor::new(inner.attach_output.clone())),
        })
    }
}
