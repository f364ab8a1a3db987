//! The worker fleet: provisioning, task accounting and teardown of
//! single-use build containers.
//!
//! Provisioning runs a fixed sequence: validate the template, share an
//! engine client, pull the image if the policy asks for it, create and
//! start the container with the connector's hooks in between, launch the
//! runtime, then register the worker. A failure anywhere after creation
//! force-removes the container before the error propagates, so no
//! half-provisioned container ever outlives its attempt.
//!
//! Teardown is best-effort and idempotent: stop, remove, deregister, in
//! that order, treating "not found" as success at every step. The registry
//! entry is removed even when the engine calls fail; the watchdog sweep is
//! the backstop for anything left behind.

pub mod registry;
pub mod watchdog;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{FleetConfig, WorkerTemplate};
use crate::connector::{Connector, Transport};
use crate::engine::{ContainerEngine, ContainerSpec, EnginePool};
use crate::error::{ProvisionError, TerminateError};
use crate::retention::{OnceRetention, RetentionMonitor, TaskProfile, TerminationRequest};

pub use self::registry::{InMemoryRegistry, RegistryError, WorkerRegistry};
pub use self::watchdog::{SweepReport, spawn_watchdog, sweep_orphans};

/// Label naming the pool a container belongs to.
pub const POOL_LABEL: &str = "io.kindling.pool";

/// A live worker and the container backing it.
#[derive(Debug, Clone)]
pub struct Worker {
    pub name: String,
    pub container_id: String,
    pub pool: String,
    /// Working directory builds run in, inside the container.
    pub work_dir: String,
    /// Remove anonymous volumes together with the container.
    pub remove_volumes: bool,
    pub created_at: DateTime<Utc>,
}

impl Worker {
    /// Worker names are a pure function of the container id, so a worker
    /// is reconstructible from container metadata alone.
    pub fn name_for(prefix: &str, container_id: &str) -> String {
        let short = &container_id[..container_id.len().min(12)];
        format!("{prefix}-{short}")
    }
}

/// Result of a successful provision: the worker plus its live transport.
#[derive(Debug)]
pub struct ProvisionedWorker {
    pub worker: Worker,
    pub transport: Transport,
}

/// Owner of all worker lifecycle state for one pool.
pub struct Fleet {
    config: FleetConfig,
    pool: EnginePool,
    connector: Arc<dyn Connector>,
    registry: Arc<dyn WorkerRegistry>,
    retention: OnceRetention,
    monitors: Mutex<HashMap<String, Arc<RetentionMonitor>>>,
    /// Names with a teardown in flight; makes `terminate` single-flight.
    terminating: Mutex<HashSet<String>>,
    /// Provisions started but not yet finished, counted for admission.
    in_flight: AtomicUsize,
    terminate_tx: mpsc::UnboundedSender<TerminationRequest>,
    terminate_rx: Mutex<Option<mpsc::UnboundedReceiver<TerminationRequest>>>,
}

impl Fleet {
    pub fn new(config: FleetConfig, pool: EnginePool, connector: Arc<dyn Connector>) -> Arc<Self> {
        Self::with_registry(config, pool, connector, Arc::new(InMemoryRegistry::new()))
    }

    pub fn with_registry(
        config: FleetConfig,
        pool: EnginePool,
        connector: Arc<dyn Connector>,
        registry: Arc<dyn WorkerRegistry>,
    ) -> Arc<Self> {
        let (terminate_tx, terminate_rx) = mpsc::unbounded_channel();
        let retention = OnceRetention::new(config.idle_minutes);
        Arc::new(Self {
            config,
            pool,
            connector,
            registry,
            retention,
            monitors: Mutex::new(HashMap::new()),
            terminating: Mutex::new(HashSet::new()),
            in_flight: AtomicUsize::new(0),
            terminate_tx,
            terminate_rx: Mutex::new(Some(terminate_rx)),
        })
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    fn monitors(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<RetentionMonitor>>> {
        self.monitors.lock().expect("monitor map poisoned")
    }

    /// Engine-side container name; the worker's own name is derived from
    /// the container id once the engine has assigned one.
    fn fresh_container_name(&self) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.config.name_prefix, &suffix[..12])
    }

    fn build_spec(&self, template: &WorkerTemplate) -> ContainerSpec {
        let mut labels = template.labels.clone();
        labels.insert(POOL_LABEL.to_string(), self.config.pool.clone());
        ContainerSpec {
            image: template.image.clone(),
            cmd: template.cmd.clone(),
            env: template.env.clone(),
            labels,
            working_dir: Some(template.working_dir.clone()),
            user: None,
            memory_limit_mb: template.memory_limit_mb,
            cpu_shares: template.cpu_shares,
            network_mode: template.network_mode.clone(),
            exposed_tcp_ports: Vec::new(),
        }
    }

    /// Provision one worker from `template`.
    pub async fn provision(
        &self,
        template: &WorkerTemplate,
    ) -> Result<ProvisionedWorker, ProvisionError> {
        template.validate().map_err(ProvisionError::Template)?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = self.provision_inner(template).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn provision_inner(
        &self,
        template: &WorkerTemplate,
    ) -> Result<ProvisionedWorker, ProvisionError> {
        let lease = self.pool.acquire(&self.config.engine_endpoint)?;
        let engine = Arc::clone(&lease.engine);

        let present = engine.image_present(&template.image).await?;
        if template.pull_policy.should_pull(&template.image, present) {
            tracing::info!(image = %template.image, "pulling worker image");
            engine.pull_image(&template.image).await?;
        }

        let mut spec = self.build_spec(template);
        self.connector.before_container_created(&mut spec).await?;
        let container_id = engine
            .create_container(&self.fresh_container_name(), &spec)
            .await?;
        let name = Worker::name_for(&self.config.name_prefix, &container_id);
        tracing::debug!(worker = %name, container_id = %container_id, "worker container created");

        match self
            .finish_provision(engine.as_ref(), template, &name, &container_id)
            .await
        {
            Ok(provisioned) => Ok(provisioned),
            Err(e) => {
                // The container must not outlive its failed provision.
                tracing::warn!(
                    worker = %name,
                    container_id = %container_id,
                    error = %e,
                    "provision failed; removing container"
                );
                if let Err(cleanup) = engine
                    .remove_container(&container_id, true, template.remove_volumes)
                    .await
                    && !cleanup.is_not_found()
                {
                    tracing::warn!(
                        container_id = %container_id,
                        error = %cleanup,
                        "could not remove container after failed provision; the sweep will catch it"
                    );
                }
                Err(e)
            }
        }
    }

    async fn finish_provision(
        &self,
        engine: &dyn ContainerEngine,
        template: &WorkerTemplate,
        name: &str,
        container_id: &str,
    ) -> Result<ProvisionedWorker, ProvisionError> {
        self.connector
            .after_container_created(engine, container_id)
            .await?;
        engine.start_container(container_id).await?;
        self.connector
            .after_container_started(engine, container_id, &template.runtime)
            .await?;
        let transport = self
            .connector
            .launch(engine, container_id, &template.runtime)
            .await?;

        let worker = Worker {
            name: name.to_string(),
            container_id: container_id.to_string(),
            pool: self.config.pool.clone(),
            work_dir: template.working_dir.clone(),
            remove_volumes: template.remove_volumes,
            created_at: Utc::now(),
        };
        if let Err(e) = self.registry.register(worker.clone()) {
            transport.disconnect();
            return Err(ProvisionError::Registry {
                name: name.to_string(),
                reason: e.to_string(),
            });
        }
        let monitor = Arc::new(RetentionMonitor::new(
            name,
            self.retention,
            self.terminate_tx.clone(),
        ));
        self.monitors().insert(name.to_string(), monitor);
        tracing::info!(
            worker = %name,
            container_id = %container_id,
            connector = self.connector.name(),
            "worker provisioned"
        );
        Ok(ProvisionedWorker { worker, transport })
    }

    /// Tear a worker down in the background. Single-flight per worker: a
    /// second call while the first is running resolves without doing
    /// anything.
    pub fn terminate(self: &Arc<Self>, name: &str) -> JoinHandle<Result<(), TerminateError>> {
        {
            let mut terminating = self.terminating.lock().expect("terminating set poisoned");
            if !terminating.insert(name.to_string()) {
                return tokio::spawn(async { Ok(()) });
            }
        }
        let fleet = Arc::clone(self);
        let name = name.to_string();
        tokio::spawn(async move {
            let result = fleet.teardown(&name).await;
            fleet
                .terminating
                .lock()
                .expect("terminating set poisoned")
                .remove(&name);
            result
        })
    }

    async fn teardown(&self, name: &str) -> Result<(), TerminateError> {
        let Some(worker) = self.registry.get(name) else {
            tracing::debug!(worker = %name, "terminate: worker already gone");
            return Ok(());
        };
        self.monitors().remove(name);

        let engine_error = |source| TerminateError::Engine {
            worker: name.to_string(),
            source,
        };
        let mut failure = None;

        match self.pool.acquire(&self.config.engine_endpoint) {
            Ok(lease) => {
                let engine = Arc::clone(&lease.engine);
                if let Err(e) = engine
                    .stop_container(&worker.container_id, self.config.stop_timeout_secs)
                    .await
                    && !e.is_not_found()
                {
                    tracing::warn!(worker = %name, error = %e, "stop failed; forcing removal");
                    failure = Some(e);
                }
                // Removal proceeding does not absolve a failed stop; the
                // first error seen is the one reported.
                match engine
                    .remove_container(&worker.container_id, true, worker.remove_volumes)
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        failure.get_or_insert(e);
                    }
                }
            }
            Err(e) => failure = Some(e),
        }

        // Deregister no matter what: a worker whose container we could not
        // remove must still stop receiving tasks, and the sweep cleans up.
        self.registry.deregister(name);
        match failure {
            None => {
                tracing::info!(worker = %name, "worker terminated");
                Ok(())
            }
            Some(source) => Err(engine_error(source)),
        }
    }

    /// Drive termination requests from retention monitors. Call once.
    pub fn spawn_termination_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let rx = self
            .terminate_rx
            .lock()
            .expect("termination receiver poisoned")
            .take();
        let Some(mut rx) = rx else {
            return tokio::spawn(async {});
        };
        let fleet = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                tracing::debug!(worker = %req.worker, reason = req.reason, "termination requested");
                match fleet.terminate(&req.worker).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(worker = %req.worker, error = %e, "worker teardown failed")
                    }
                    Err(e) => tracing::warn!(worker = %req.worker, error = %e, "teardown task panicked"),
                }
            }
        })
    }

    pub fn monitor(&self, name: &str) -> Option<Arc<RetentionMonitor>> {
        self.monitors().get(name).cloned()
    }

    /// Record a task starting on `name`. Returns false when the worker is
    /// unknown or no longer accepting tasks.
    pub fn task_accepted(&self, name: &str, profile: TaskProfile) -> bool {
        match self.monitor(name) {
            Some(m) if m.is_accepting_tasks() => {
                m.task_accepted(profile);
                true
            }
            _ => false,
        }
    }

    pub fn task_completed(&self, name: &str) {
        if let Some(m) = self.monitor(name) {
            m.task_completed();
        }
    }

    pub fn task_completed_with_problems(&self, name: &str) {
        if let Some(m) = self.monitor(name) {
            m.task_completed_with_problems();
        }
    }

    pub fn is_accepting_tasks(&self, name: &str) -> bool {
        self.monitor(name)
            .is_some_and(|m| m.is_accepting_tasks())
    }

    /// Run the idle check for `name`; minutes until the next check.
    pub fn check_idle(&self, name: &str) -> Option<u32> {
        self.monitor(name).map(|m| m.check_idle())
    }

    /// Registered workers.
    pub fn live_workers(&self) -> usize {
        self.registry.enumerate().len()
    }

    /// Workers with no running task that still accept one.
    pub fn idle_workers(&self) -> usize {
        self.monitors()
            .values()
            .filter(|m| m.is_idle() && m.is_accepting_tasks())
            .count()
    }

    /// Provisions currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}
