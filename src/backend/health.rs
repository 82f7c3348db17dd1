//! Periodic probe loop driving each backend's healthy/unhealthy transition
//! (spec.md §4.2).

use std::sync::Arc;

use tokio::time::timeout;
use tracing::{info, warn};

use super::BackendClientPool;
use crate::config::{HealthCheckConfig, QueueConfig};
use crate::dispatcher::Dispatcher;
use crate::registry::BackendRegistry;
use crate::task::TaskStore;

/// Runs until `shutdown` fires. Every `config.interval`, probes every known
/// backend with `query_queue` under `config.timeout`, updates the rolling
/// counters in the registry, refreshes pending/running counts on success,
/// and re-queues dispatched tasks on a healthy→unhealthy edge. `trigger`
/// lets the admin API (`POST /lb/health-check`, spec.md §6) force an
/// immediate extra round without waiting for the next tick.
pub async fn run(
    registry: Arc<BackendRegistry>,
    clients: Arc<BackendClientPool>,
    tasks: Arc<TaskStore>,
    dispatcher: Arc<Dispatcher>,
    config: HealthCheckConfig,
    queue: QueueConfig,
    trigger: Arc<tokio::sync::Notify>,
    shutdown: Arc<tokio::sync::Notify>,
) {
    let mut ticker = tokio::time::interval(config.interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = trigger.notified() => {}
            _ = shutdown.notified() => return,
        }
        probe_round(&registry, &clients, &tasks, &dispatcher, &config, &queue).await;
    }
}

async fn probe_round(
    registry: &Arc<BackendRegistry>,
    clients: &Arc<BackendClientPool>,
    tasks: &Arc<TaskStore>,
    dispatcher: &Arc<Dispatcher>,
    config: &HealthCheckConfig,
    queue: &QueueConfig,
) {
    let names: Vec<String> = registry.snapshot().into_iter().map(|b| b.name).collect();
    let probes = names
        .iter()
        .map(|name| probe_one(registry, clients, tasks, dispatcher, config, queue, name));
    futures::future::join_all(probes).await;
}

async fn probe_one(
    registry: &Arc<BackendRegistry>,
    clients: &Arc<BackendClientPool>,
    tasks: &Arc<TaskStore>,
    dispatcher: &Arc<Dispatcher>,
    config: &HealthCheckConfig,
    queue: &QueueConfig,
    name: &str,
) {
    let Some(client) = clients.get(name) else {
        return;
    };

    let outcome = timeout(config.timeout, client.query_queue()).await;

    match outcome {
        Ok(Ok(snapshot)) => {
            registry.refresh_queue_counts(
                name,
                snapshot.pending.len() as u32,
                snapshot.running.len() as u32,
            );
            if registry
                .record_probe_success(name, config.healthy_threshold)
                .unwrap_or(false)
            {
                info!(backend = %name, "backend transitioned to healthy");
                dispatcher.notify_capacity();
            }
        }
        Ok(Err(err)) => {
            warn!(backend = %name, error = %err, "health probe failed");
            handle_failure(registry, tasks, dispatcher, config, queue, name).await;
        }
        Err(_elapsed) => {
            warn!(backend = %name, "health probe timed out");
            handle_failure(registry, tasks, dispatcher, config, queue, name).await;
        }
    }
}

async fn handle_failure(
    registry: &Arc<BackendRegistry>,
    tasks: &Arc<TaskStore>,
    dispatcher: &Arc<Dispatcher>,
    config: &HealthCheckConfig,
    queue: &QueueConfig,
    name: &str,
) {
    let became_unhealthy = registry
        .record_probe_failure(name, config.unhealthy_threshold)
        .unwrap_or(false);

    if !became_unhealthy {
        return;
    }

    warn!(backend = %name, "backend transitioned to unhealthy, re-queueing dispatched tasks");
    for task_id in tasks.dispatched_on(name) {
        let Some(task) = tasks.get(task_id) else {
            continue;
        };
        registry.release_running_or_pending(name);
        if task.retries < queue.max_retries {
            if tasks.requeue_lost_backend(task_id).is_ok() {
                dispatcher.notify_pending();
            }
        } else if let Err(err) = tasks.mark_failed(task_id, "BackendLost: retries exhausted".to_string()) {
            warn!(task_id = %task_id, error = %err, "failed to mark task failed after backend loss");
        }
    }
}
