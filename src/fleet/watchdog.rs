//! Orphan sweep: reconcile pool-labelled containers against the registry.
//!
//! Teardown is best-effort, so containers can be left behind by crashes,
//! engine hiccups or a restart of the coordinator. The sweep lists every
//! container carrying this pool's label and force-removes the ones no
//! registered worker claims. Containers younger than a grace window are
//! left alone so a provision that has created its container but not yet
//! registered its worker is never raced.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use std::collections::HashSet;

use super::registry::WorkerRegistry;
use super::{Fleet, POOL_LABEL};
use crate::engine::{ContainerEngine, EngineError};

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub removed: usize,
    pub skipped_registered: usize,
    pub skipped_young: usize,
    pub failed: usize,
}

/// Remove every container labelled for `pool` that no registered worker
/// claims and that is older than `grace`.
pub async fn sweep_orphans(
    engine: &dyn ContainerEngine,
    registry: &dyn WorkerRegistry,
    pool: &str,
    grace: Duration,
) -> Result<SweepReport, EngineError> {
    let rows = engine
        .list_containers(&[format!("{POOL_LABEL}={pool}")], true)
        .await?;
    let claimed: HashSet<String> = registry
        .enumerate()
        .into_iter()
        .map(|w| w.container_id)
        .collect();
    let now = Utc::now();
    let grace = chrono::Duration::seconds(grace.as_secs() as i64);
    let mut report = SweepReport::default();

    for row in rows {
        report.examined += 1;
        if claimed.contains(&row.id) {
            report.skipped_registered += 1;
            continue;
        }
        // Provisions register only after launch; within the grace window an
        // unclaimed container may simply be mid-provision.
        if let Some(created) = row.created_at
            && now.signed_duration_since(created) < grace
        {
            report.skipped_young += 1;
            continue;
        }
        match engine.remove_container(&row.id, true, true).await {
            Ok(()) => {
                report.removed += 1;
                tracing::info!(container_id = %row.id, name = ?row.name, "removed orphaned container");
            }
            Err(e) if e.is_not_found() => report.removed += 1,
            Err(e) => {
                report.failed += 1;
                tracing::warn!(container_id = %row.id, error = %e, "failed to remove orphaned container");
            }
        }
    }

    if report.removed > 0 || report.failed > 0 {
        tracing::info!(
            examined = report.examined,
            removed = report.removed,
            failed = report.failed,
            "orphan sweep finished"
        );
    }
    Ok(report)
}

/// Run the orphan sweep on the fleet's configured interval. The first pass
/// runs immediately, which is what cleans up after a coordinator restart.
pub fn spawn_watchdog(fleet: Arc<Fleet>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let every = Duration::from_secs(fleet.config.sweep_interval_secs);
        let grace = Duration::from_secs(fleet.config.sweep_grace_secs);
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match fleet.pool.acquire(&fleet.config.engine_endpoint) {
                Ok(lease) => {
                    let engine = Arc::clone(&lease.engine);
                    if let Err(e) = sweep_orphans(
                        engine.as_ref(),
                        fleet.registry.as_ref(),
                        &fleet.config.pool,
                        grace,
                    )
                    .await
                    {
                        tracing::warn!(error = %e, "orphan sweep failed");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "orphan sweep could not reach engine"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::super::registry::InMemoryRegistry;
    use super::super::Worker;
    use super::*;
    use crate::engine::mock::MockEngine;

    fn pool_labels() -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert(POOL_LABEL.to_string(), "default".to_string());
        labels
    }

    fn hours_ago(h: i64) -> chrono::DateTime<Utc> {
        Utc::now() - chrono::Duration::hours(h)
    }

    #[tokio::test]
    async fn stale_unclaimed_containers_are_removed() {
        let engine = MockEngine::new();
        let registry = InMemoryRegistry::new();

        engine.seed_container("stray", "kindling-dead", pool_labels(), hours_ago(2));
        engine.seed_container("claimed", "kindling-live", pool_labels(), hours_ago(2));
        registry
            .register(Worker {
                name: "kindling-claimed".to_string(),
                container_id: "claimed".to_string(),
                pool: "default".to_string(),
                work_dir: "/home/build".to_string(),
                remove_volumes: true,
                created_at: hours_ago(2),
            })
            .unwrap();

        let report = sweep_orphans(&engine, &registry, "default", Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.removed, 1);
        assert_eq!(report.skipped_registered, 1);
        assert!(!engine.has_container("stray"));
        assert!(engine.has_container("claimed"));
    }

    #[tokio::test]
    async fn young_containers_survive_the_sweep() {
        let engine = MockEngine::new();
        let registry = InMemoryRegistry::new();
        engine.seed_container("fresh", "kindling-new", pool_labels(), Utc::now());

        let report = sweep_orphans(&engine, &registry, "default", Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(report.skipped_young, 1);
        assert_eq!(report.removed, 0);
        assert!(engine.has_container("fresh"));
    }

    #[tokio::test]
    async fn other_pools_are_not_touched() {
        let engine = MockEngine::new();
        let registry = InMemoryRegistry::new();
        let mut labels = HashMap::new();
        labels.insert(POOL_LABEL.to_string(), "other".to_string());
        engine.seed_container("foreign", "other-pool", labels, hours_ago(2));

        let report = sweep_orphans(&engine, &registry, "default", Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(report.examined, 0);
        assert!(engine.has_container("foreign"));
    }
}
