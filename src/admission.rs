//! Admission: provision workers to match queued demand, under a ceiling.
//!
//! The loop is deliberately thin. Each tick it reads the queue depth,
//! subtracts capacity that already exists or is on the way, clamps to the
//! configured ceiling and provisions the difference. Freshly provisioned
//! workers are handed to the consumer over a channel; scheduling tasks
//! onto them is out of scope here.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::WorkerTemplate;
use crate::error::ProvisionError;
use crate::fleet::{Fleet, ProvisionedWorker};

/// How many new workers to provision right now.
///
/// Demand not already covered by idle or in-flight capacity, clamped to
/// the room left under the ceiling. In-flight provisions count on both
/// sides: they will serve demand, and they already occupy slots.
pub fn workers_needed(
    queue_len: usize,
    idle: usize,
    in_flight: usize,
    live: usize,
    ceiling: usize,
) -> usize {
    let uncovered = queue_len.saturating_sub(idle + in_flight);
    let room = ceiling.saturating_sub(live + in_flight);
    uncovered.min(room)
}

/// Provisions workers for one template against one fleet.
pub struct Admission {
    fleet: Arc<Fleet>,
    template: WorkerTemplate,
    ready_tx: mpsc::UnboundedSender<ProvisionedWorker>,
}

impl Admission {
    /// Returns the admission handle and the channel of ready workers.
    pub fn new(
        fleet: Arc<Fleet>,
        template: WorkerTemplate,
    ) -> (Self, mpsc::UnboundedReceiver<ProvisionedWorker>) {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        (
            Self {
                fleet,
                template,
                ready_tx,
            },
            ready_rx,
        )
    }

    /// One pass: provision enough workers for `queue_len` queued tasks.
    /// Returns how many were provisioned and handed to the consumer.
    pub async fn reconcile(&self, queue_len: usize) -> Result<usize, ProvisionError> {
        let needed = workers_needed(
            queue_len,
            self.fleet.idle_workers(),
            self.fleet.in_flight(),
            self.fleet.live_workers(),
            self.fleet.config().max_workers,
        );
        if needed == 0 {
            return Ok(0);
        }
        tracing::info!(queue_len, needed, "provisioning workers for queued demand");

        for n in 0..needed {
            let provisioned = self.fleet.provision(&self.template).await?;
            let name = provisioned.worker.name.clone();
            if self.ready_tx.send(provisioned).is_err() {
                // Consumer is gone; nobody will ever use this worker.
                tracing::warn!(worker = %name, "ready channel closed; retiring worker");
                self.fleet.terminate(&name);
                return Ok(n);
            }
        }
        Ok(needed)
    }

    /// Run `reconcile` on a fixed interval, polling `queue_depth` each tick.
    pub fn spawn(
        self,
        every: Duration,
        queue_depth: impl Fn() -> usize + Send + 'static,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let depth = queue_depth();
                if let Err(e) = self.reconcile(depth).await {
                    if e.is_retryable() {
                        tracing::debug!(error = %e, "provision timed out; retrying next tick");
                    } else {
                        tracing::warn!(error = %e, "admission pass failed");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FleetConfig;
    use crate::connector::AttachConnector;
    use crate::engine::mock::MockEngine;
    use crate::engine::{ContainerEngine, EnginePool};

    #[test]
    fn demand_is_reduced_by_existing_capacity() {
        assert_eq!(workers_needed(5, 1, 1, 3, 10), 3);
        assert_eq!(workers_needed(2, 2, 0, 2, 10), 0);
        assert_eq!(workers_needed(2, 0, 2, 2, 10), 0);
    }

    #[test]
    fn ceiling_caps_provisioning() {
        assert_eq!(workers_needed(10, 0, 0, 8, 10), 2);
        assert_eq!(workers_needed(10, 0, 2, 8, 10), 0);
        assert_eq!(workers_needed(10, 0, 0, 12, 10), 0);
    }

    #[test]
    fn empty_queue_needs_nothing() {
        assert_eq!(workers_needed(0, 0, 0, 0, 10), 0);
    }

    fn test_fleet(engine: &Arc<MockEngine>, max_workers: usize) -> Arc<Fleet> {
        let config = FleetConfig {
            engine_endpoint: "test://".to_string(),
            max_workers,
            ..Default::default()
        };
        let pool = EnginePool::fixed("test://", Arc::clone(engine) as Arc<dyn ContainerEngine>);
        Fleet::new(config, pool, Arc::new(AttachConnector::new()))
    }

    #[tokio::test]
    async fn reconcile_provisions_up_to_demand() {
        let engine = Arc::new(MockEngine::new());
        let fleet = test_fleet(&engine, 10);
        let (admission, mut ready) = Admission::new(
            Arc::clone(&fleet),
            crate::config::WorkerTemplate::new("build:2024.1"),
        );

        let provisioned = admission.reconcile(3).await.unwrap();
        assert_eq!(provisioned, 3);
        assert_eq!(fleet.live_workers(), 3);
        for _ in 0..3 {
            assert!(ready.try_recv().is_ok());
        }

        // Same demand again: the three idle workers already cover it.
        assert_eq!(admission.reconcile(3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reconcile_respects_the_ceiling() {
        let engine = Arc::new(MockEngine::new());
        let fleet = test_fleet(&engine, 2);
        let (admission, _ready) = Admission::new(
            Arc::clone(&fleet),
            crate::config::WorkerTemplate::new("build:2024.1"),
        );

        assert_eq!(admission.reconcile(5).await.unwrap(), 2);
        assert_eq!(fleet.live_workers(), 2);
    }
}
