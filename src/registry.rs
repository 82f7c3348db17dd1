use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::BackendConfig;

/// Errors produced by registry mutations (spec.md §4.3, §7).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("backend '{0}' already exists")]
    NameConflict(String),

    #[error("backend '{0}' not found")]
    NotFound(String),

    #[error("backend '{0}' is not disabled or still has in-flight tasks")]
    BackendBusy(String),
}

/// Backend status as seen from outside the registry (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// A point-in-time view of one backend, safe to hand out of the registry
/// without holding any lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSnapshot {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub max_queue: u32,
    pub enabled: bool,
    pub status: BackendStatus,
    pub reserved: u32,
    pub pending: u32,
    pub running: u32,
}

impl BackendSnapshot {
    /// Total capacity currently charged against this backend.
    pub fn load(&self) -> u32 {
        self.reserved + self.pending + self.running
    }

    /// Whether a new job may be reserved on this backend right now
    /// (spec.md §4.4 candidate filter).
    pub fn has_capacity(&self) -> bool {
        self.enabled && self.status == BackendStatus::Healthy && self.load() < self.max_queue
    }
}

/// One backend entry, owned exclusively by the `BackendRegistry` (spec.md §3
/// "Ownership"). Mutable fields use atomics so readers never block a
/// concurrent health-check or dispatch.
pub struct Backend {
    pub name: String,
    pub host: String,
    pub port: u16,
    weight: AtomicU32,
    max_queue: AtomicU32,
    enabled: std::sync::atomic::AtomicBool,
    status: std::sync::Mutex<BackendStatus>,
    consecutive_ok: AtomicU32,
    consecutive_fail: AtomicU32,
    pending: AtomicU32,
    running: AtomicU32,
    reserved: AtomicU32,
    last_probe_at: std::sync::Mutex<Option<Instant>>,
    insertion_order: u64,
}

impl Backend {
    fn new(config: &BackendConfig, insertion_order: u64) -> Self {
        Self {
            name: config.name.clone(),
            host: config.host.clone(),
            port: config.port,
            weight: AtomicU32::new(config.weight),
            max_queue: AtomicU32::new(config.max_queue),
            enabled: std::sync::atomic::AtomicBool::new(config.enabled),
            status: std::sync::Mutex::new(BackendStatus::Unknown),
            consecutive_ok: AtomicU32::new(0),
            consecutive_fail: AtomicU32::new(0),
            pending: AtomicU32::new(0),
            running: AtomicU32::new(0),
            reserved: AtomicU32::new(0),
            last_probe_at: std::sync::Mutex::new(None),
            insertion_order,
        }
    }

    fn snapshot(&self) -> BackendSnapshot {
        BackendSnapshot {
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
            weight: self.weight.load(Ordering::Acquire),
            max_queue: self.max_queue.load(Ordering::Acquire),
            enabled: self.enabled.load(Ordering::Acquire),
            status: *self.status.lock().unwrap_or_else(|e| e.into_inner()),
            reserved: self.reserved.load(Ordering::Acquire),
            pending: self.pending.load(Ordering::Acquire),
            running: self.running.load(Ordering::Acquire),
        }
    }
}

/// Events published by the registry on every mutating operation
/// (spec.md §4.3 "All mutating operations publish a `backend_update` event").
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum BackendEvent {
    Added { backend: BackendSnapshot },
    Removed { name: String },
    Enabled { name: String },
    Disabled { name: String },
    StatusChanged { name: String, status: BackendStatus },
    MetricsChanged { backend: BackendSnapshot },
}

/// Thread-safe mapping `name -> Backend` (spec.md §4.3).
pub struct BackendRegistry {
    backends: DashMap<String, Arc<Backend>>,
    next_order: AtomicU64,
    events: broadcast::Sender<BackendEvent>,
}

impl BackendRegistry {
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(256);
        Arc::new(Self {
            backends: DashMap::new(),
            next_order: AtomicU64::new(0),
            events: tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: BackendEvent) {
        let _ = self.events.send(event);
    }

    /// Add a backend. Rejects duplicates with `NameConflict` (spec.md §4.3).
    pub fn add(&self, config: BackendConfig) -> Result<(), RegistryError> {
        if self.backends.contains_key(&config.name) {
            return Err(RegistryError::NameConflict(config.name));
        }
        let order = self.next_order.fetch_add(1, Ordering::SeqCst);
        let backend = Arc::new(Backend::new(&config, order));
        let snapshot = backend.snapshot();
        self.backends.insert(config.name.clone(), backend);
        self.publish(BackendEvent::Added { backend: snapshot });
        Ok(())
    }

    /// Remove a backend. Only permitted when disabled and drained
    /// (spec.md §4.3, §9 open question resolved as "removal requires drain").
    pub fn remove(&self, name: &str) -> Result<(), RegistryError> {
        let entry = self
            .backends
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let enabled = entry.enabled.load(Ordering::Acquire);
        let drained = entry.reserved.load(Ordering::Acquire) == 0
            && entry.running.load(Ordering::Acquire) == 0
            && entry.pending.load(Ordering::Acquire) == 0;
        drop(entry);

        if enabled || !drained {
            return Err(RegistryError::BackendBusy(name.to_string()));
        }

        self.backends.remove(name);
        self.publish(BackendEvent::Removed {
            name: name.to_string(),
        });
        Ok(())
    }

    pub fn enable(&self, name: &str) -> Result<(), RegistryError> {
        let backend = self
            .backends
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        backend.enabled.store(true, Ordering::Release);
        drop(backend);
        self.publish(BackendEvent::Enabled {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Disable a backend. New reservations stop immediately; in-flight
    /// tasks are left to drain (spec.md §4.3).
    pub fn disable(&self, name: &str) -> Result<(), RegistryError> {
        let backend = self
            .backends
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        backend.enabled.store(false, Ordering::Release);
        drop(backend);
        self.publish(BackendEvent::Disabled {
            name: name.to_string(),
        });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<BackendSnapshot> {
        self.backends.get(name).map(|b| b.snapshot())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    /// Consistent snapshot of every backend, ordered by insertion
    /// (needed by round_robin's "insertion order" tie-break, spec.md §4.4).
    pub fn snapshot(&self) -> Vec<BackendSnapshot> {
        let mut entries: Vec<(u64, BackendSnapshot)> = self
            .backends
            .iter()
            .map(|b| (b.insertion_order, b.snapshot()))
            .collect();
        entries.sort_by_key(|(order, _)| *order);
        entries.into_iter().map(|(_, snap)| snap).collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Reserve one slot on a backend (Dispatcher step 5, spec.md §4.6).
    /// Returns `false` if the reservation would exceed `max_queue`
    /// (invariant 1, spec.md §8) — the caller must hold this reservation
    /// under the same critical section that moves the task to `dispatching`.
    pub fn try_reserve(&self, name: &str) -> bool {
        let Some(backend) = self.backends.get(name) else {
            return false;
        };
        let max_queue = backend.max_queue.load(Ordering::Acquire);
        loop {
            let reserved = backend.reserved.load(Ordering::Acquire);
            let pending = backend.pending.load(Ordering::Acquire);
            let running = backend.running.load(Ordering::Acquire);
            if reserved + pending + running >= max_queue {
                return false;
            }
            if backend
                .reserved
                .compare_exchange(reserved, reserved + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn release_reservation(&self, name: &str) {
        if let Some(backend) = self.backends.get(name) {
            backend.reserved.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Move a reservation into a confirmed `pending` slot on submit success
    /// (spec.md §4.6 "increment the backend's pending locally").
    pub fn confirm_reservation_as_pending(&self, name: &str) {
        if let Some(backend) = self.backends.get(name) {
            backend.reserved.fetch_sub(1, Ordering::AcqRel);
            backend.pending.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Move a task from pending to running on the backend's locally-tracked
    /// counters, used when an upstream event confirms execution start.
    pub fn mark_running(&self, name: &str) {
        if let Some(backend) = self.backends.get(name) {
            let pending = backend.pending.load(Ordering::Acquire);
            if pending > 0 {
                backend.pending.fetch_sub(1, Ordering::AcqRel);
            }
            backend.running.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Release capacity on task completion/failure/cancellation
    /// (spec.md §4.6 "Completion" / "Cancellation").
    pub fn release_running_or_pending(&self, name: &str) {
        if let Some(backend) = self.backends.get(name) {
            let running = backend.running.load(Ordering::Acquire);
            if running > 0 {
                backend.running.fetch_sub(1, Ordering::AcqRel);
                return;
            }
            let pending = backend.pending.load(Ordering::Acquire);
            if pending > 0 {
                backend.pending.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// Refresh pending/running counts from a health-probe queue snapshot
    /// (spec.md §4.2 "a successful probe also refreshes the backend's
    /// pending/running counts").
    pub fn refresh_queue_counts(&self, name: &str, pending: u32, running: u32) {
        if let Some(backend) = self.backends.get(name) {
            backend.pending.store(pending, Ordering::Release);
            backend.running.store(running, Ordering::Release);
        }
        if let Some(snapshot) = self.get(name) {
            self.publish(BackendEvent::MetricsChanged { backend: snapshot });
        }
    }

    /// Record a successful probe. Returns `Some(true)` exactly when this
    /// probe caused an unhealthy/unknown→healthy transition.
    pub fn record_probe_success(&self, name: &str, healthy_threshold: u32) -> Option<bool> {
        let backend = self.backends.get(name)?;
        *backend
            .last_probe_at
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        let ok = backend.consecutive_ok.fetch_add(1, Ordering::AcqRel) + 1;
        backend.consecutive_fail.store(0, Ordering::Release);

        let mut status = backend.status.lock().unwrap_or_else(|e| e.into_inner());
        let became_healthy = *status != BackendStatus::Healthy && ok >= healthy_threshold;
        if became_healthy {
            *status = BackendStatus::Healthy;
        }
        drop(status);
        drop(backend);
        if became_healthy {
            self.publish(BackendEvent::StatusChanged {
                name: name.to_string(),
                status: BackendStatus::Healthy,
            });
        }
        Some(became_healthy)
    }

    /// Record a failed probe. Returns `Some(true)` exactly when this probe
    /// caused a healthy→unhealthy transition — the edge the Dispatcher must
    /// react to by re-queueing that backend's dispatched tasks (spec.md §4.2).
    pub fn record_probe_failure(&self, name: &str, unhealthy_threshold: u32) -> Option<bool> {
        let backend = self.backends.get(name)?;
        *backend
            .last_probe_at
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        let fail = backend.consecutive_fail.fetch_add(1, Ordering::AcqRel) + 1;
        backend.consecutive_ok.store(0, Ordering::Release);

        let mut status = backend.status.lock().unwrap_or_else(|e| e.into_inner());
        let was_healthy = *status == BackendStatus::Healthy;
        let crosses_threshold = fail >= unhealthy_threshold;
        let became_unhealthy = was_healthy && crosses_threshold;
        if crosses_threshold {
            *status = BackendStatus::Unhealthy;
        }
        drop(status);
        drop(backend);
        if became_unhealthy {
            self.publish(BackendEvent::StatusChanged {
                name: name.to_string(),
                status: BackendStatus::Unhealthy,
            });
        }
        Some(became_unhealthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(name: &str) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port: 8188,
            weight: 1,
            max_queue: 2,
            enabled: true,
        }
    }

    #[test]
    fn test_add_and_get() {
        let reg = BackendRegistry::new();
        reg.add(cfg("comfy-1")).unwrap();
        let snap = reg.get("comfy-1").unwrap();
        assert_eq!(snap.status, BackendStatus::Unknown);
        assert_eq!(snap.max_queue, 2);
    }

    #[test]
    fn test_add_rejects_duplicate() {
        let reg = BackendRegistry::new();
        reg.add(cfg("comfy-1")).unwrap();
        assert!(matches!(
            reg.add(cfg("comfy-1")),
            Err(RegistryError::NameConflict(_))
        ));
    }

    #[test]
    fn test_remove_requires_disabled_and_drained() {
        let reg = BackendRegistry::new();
        reg.add(cfg("comfy-1")).unwrap();

        assert!(matches!(
            reg.remove("comfy-1"),
            Err(RegistryError::BackendBusy(_))
        ));

        reg.disable("comfy-1").unwrap();
        reg.try_reserve("comfy-1");
        reg.confirm_reservation_as_pending("comfy-1");
        reg.mark_running("comfy-1");

        assert!(matches!(
            reg.remove("comfy-1"),
            Err(RegistryError::BackendBusy(_))
        ));

        reg.release_running_or_pending("comfy-1");
        reg.remove("comfy-1").unwrap();
        assert!(reg.get("comfy-1").is_none());
    }

    #[test]
    fn test_reserve_respects_max_queue() {
        let reg = BackendRegistry::new();
        reg.add(cfg("comfy-1")).unwrap();
        assert!(reg.try_reserve("comfy-1"));
        assert!(reg.try_reserve("comfy-1"));
        assert!(!reg.try_reserve("comfy-1"));
    }

    #[test]
    fn test_health_transitions() {
        let reg = BackendRegistry::new();
        reg.add(cfg("comfy-1")).unwrap();

        assert_eq!(reg.record_probe_success("comfy-1", 1), Some(true));
        assert_eq!(reg.get("comfy-1").unwrap().status, BackendStatus::Healthy);

        assert_eq!(reg.record_probe_failure("comfy-1", 3), Some(false));
        assert_eq!(reg.record_probe_failure("comfy-1", 3), Some(false));
        assert_eq!(reg.record_probe_failure("comfy-1", 3), Some(true));
        assert_eq!(
            reg.get("comfy-1").unwrap().status,
            BackendStatus::Unhealthy
        );

        assert_eq!(reg.record_probe_success("comfy-1", 1), Some(true));
        assert_eq!(reg.get("comfy-1").unwrap().status, BackendStatus::Healthy);
    }

    #[test]
    fn test_snapshot_preserves_insertion_order() {
        let reg = BackendRegistry::new();
        reg.add(cfg("b")).unwrap();
        reg.add(cfg("a")).unwrap();
        let names: Vec<String> = reg.snapshot().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["b".to_string(), "a".to_string()]);
    }
}
