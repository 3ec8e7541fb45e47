//! Worker Pool (Swarm): the registry of workers a session's active worker
//! is drawn from, plus the dispatcher that picks one per message.
//!
//! Grounded in the registry shape used for the pool of callable sub-agents
//! elsewhere in this crate — a name-keyed map with `register`/`get`/`iter`
//! and a `Debug` impl that only lists names — generalized here with health
//! tracking, a per-worker circuit breaker, and four dispatch strategies in
//! place of a single direct lookup.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::circuit::{Admission, CircuitBreaker, CircuitBreakerConfig};
use crate::context::ContextVariables;
use crate::error::{EngineError, Result};
use crate::events::{Event, EventBus, EventPayload};
use crate::plan::Priority;
use crate::tool::ToolDefinition;

/// An opaque capability tag used by `CapabilityMatch` dispatch and by
/// handoff targeting.
pub type Capability = String;

/// One configured handoff a worker may trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffRule {
    /// Worker to transfer control to.
    pub target_id: String,
    /// Human-readable condition under which this handoff applies; informs
    /// the worker's instructions rather than being mechanically evaluated
    /// here.
    pub condition: String,
    /// Whether the full context overlay is carried across the handoff.
    pub transfer_context: bool,
}

/// Static configuration for one worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// System-prompt instructions, resolved fresh each turn against the
    /// session's context variables.
    pub instructions: Arc<dyn Fn(&ContextVariables) -> String + Send + Sync>,
    /// Tools this worker may call.
    pub tools: Vec<ToolDefinition>,
    /// Capabilities this worker advertises, consulted by `CapabilityMatch`.
    pub capabilities: Vec<Capability>,
    /// Configured handoffs this worker may trigger.
    pub handoffs: Vec<HandoffRule>,
    /// Scheduling priority, for pools that weigh it.
    pub priority: Priority,
    /// Maximum tasks this worker may run concurrently.
    pub max_concurrent_tasks: usize,
}

impl WorkerConfig {
    /// A worker with static instructions and no tools/capabilities/handoffs.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, instructions: impl Into<String>) -> Self {
        let text = instructions.into();
        Self {
            id: id.into(),
            name: name.into(),
            instructions: Arc::new(move |_ctx| text.clone()),
            tools: Vec::new(),
            capabilities: Vec::new(),
            handoffs: Vec::new(),
            priority: Priority::Normal,
            max_concurrent_tasks: 1,
        }
    }

    /// Resolve this worker's system-prompt instructions against `ctx`.
    #[must_use]
    pub fn resolve_instructions(&self, ctx: &ContextVariables) -> String {
        (self.instructions)(ctx)
    }
}

/// `{healthy, lastCheck, consecutiveFailures, lastResponseMs}` for one
/// worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkerHealth {
    /// Whether the worker is currently considered usable.
    pub healthy: bool,
    /// Unix-epoch milliseconds of the last health observation.
    pub last_check: u64,
    /// Consecutive dispatch failures since the last success.
    pub consecutive_failures: u32,
    /// Latency of the most recent dispatch, in milliseconds.
    pub last_response_ms: u64,
}

impl Default for WorkerHealth {
    fn default() -> Self {
        Self { healthy: true, last_check: 0, consecutive_failures: 0, last_response_ms: 0 }
    }
}

/// `{handoffsSent, handoffsReceived}` plus in-flight load, per worker.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WorkerMetrics {
    /// Handoffs this worker initiated.
    pub handoffs_sent: u64,
    /// Handoffs this worker received.
    pub handoffs_received: u64,
    /// Dispatches completed (success or failure).
    pub dispatches: u64,
    /// Dispatches that failed.
    pub failures: u64,
}

/// Which dispatch strategy a pool uses to pick a worker per message. A
/// pool-level configuration, not a per-call choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStrategy {
    /// `hash(message_id) mod healthy.len()`.
    RoundRobin,
    /// Fewest in-flight tasks; ties by registration order.
    LeastLoaded,
    /// Filter by required capabilities, then `LeastLoaded`; falls back to
    /// `LeastLoaded` over all healthy workers if no survivor matches.
    CapabilityMatch,
    /// Weighted score favoring low load, low failure rate, capability
    /// overlap, and a closed breaker.
    Adaptive,
}

struct WorkerEntry {
    config: WorkerConfig,
    breaker: CircuitBreaker,
    health: std::sync::Mutex<WorkerHealth>,
    metrics: std::sync::Mutex<WorkerMetrics>,
    load: AtomicU32,
    registration_order: u64,
}

/// The Worker Pool: a registry of workers plus the configured dispatcher.
pub struct Swarm {
    strategy: DispatchStrategy,
    fallback_worker_id: Option<String>,
    unhealthy_threshold: u32,
    workers: std::sync::RwLock<HashMap<String, WorkerEntry>>,
    order: std::sync::Mutex<Vec<String>>,
    next_registration_order: AtomicU64,
    event_bus: Arc<EventBus>,
}

impl std::fmt::Debug for Swarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swarm")
            .field("strategy", &self.strategy)
            .field("workers", &self.order.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone())
            .finish()
    }
}

impl Swarm {
    /// Build an empty pool using `strategy`, falling back to
    /// `fallback_worker_id` on a breaker-open or execution failure.
    #[must_use]
    pub fn new(strategy: DispatchStrategy, fallback_worker_id: Option<String>, event_bus: Arc<EventBus>) -> Self {
        Self {
            strategy,
            fallback_worker_id,
            unhealthy_threshold: 3,
            workers: std::sync::RwLock::new(HashMap::new()),
            order: std::sync::Mutex::new(Vec::new()),
            next_registration_order: AtomicU64::new(0),
            event_bus,
        }
    }

    /// Register a worker.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DuplicateTool`]-shaped invalid-state error if
    /// a worker with the same id is already registered.
    pub fn register(&self, config: WorkerConfig, breaker_config: CircuitBreakerConfig, now: u64) -> Result<()> {
        let id = config.id.clone();
        let mut workers = self.workers.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        if workers.contains_key(&id) {
            return Err(EngineError::InvalidState(format!("worker '{id}' is already registered")));
        }

        let registration_order = self.next_registration_order.fetch_add(1, Ordering::SeqCst);
        workers.insert(
            id.clone(),
            WorkerEntry {
                config,
                breaker: CircuitBreaker::new(breaker_config),
                health: std::sync::Mutex::new(WorkerHealth { last_check: now, ..WorkerHealth::default() }),
                metrics: std::sync::Mutex::new(WorkerMetrics::default()),
                load: AtomicU32::new(0),
                registration_order,
            },
        );
        self.order.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(id.clone());
        self.event_bus.publish(Event::new(now, id.clone(), EventPayload::WorkerRegistered { worker_id: id }));
        Ok(())
    }

    /// Deregister a worker.
    pub fn unregister(&self, id: &str, now: u64) {
        self.workers.write().unwrap_or_else(std::sync::PoisonError::into_inner).remove(id);
        self.order.lock().unwrap_or_else(std::sync::PoisonError::into_inner).retain(|w| w != id);
        self.event_bus.publish(Event::new(now, id.to_string(), EventPayload::WorkerUnregistered { worker_id: id.to_string() }));
    }

    /// A clone of the registered configuration for `id`, if registered.
    #[must_use]
    pub fn config_of(&self, id: &str) -> Option<WorkerConfig> {
        self.workers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(id)
            .map(|w| w.config.clone())
    }

    /// Whether `id` is currently registered (regardless of health).
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.workers.read().unwrap_or_else(std::sync::PoisonError::into_inner).contains_key(id)
    }

    /// Ids of every registered worker, in registration order, regardless of
    /// health.
    #[must_use]
    pub fn worker_ids(&self) -> Vec<String> {
        self.order.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    /// Ids of every currently healthy, registered worker, in registration
    /// order.
    #[must_use]
    pub fn healthy(&self) -> Vec<String> {
        let workers = self.workers.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        self.order
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .filter(|id| workers.get(*id).is_some_and(|w| w.health.lock().unwrap_or_else(std::sync::PoisonError::into_inner).healthy))
            .cloned()
            .collect()
    }

    /// This worker's last-observed health.
    #[must_use]
    pub fn health_of(&self, id: &str) -> Option<WorkerHealth> {
        self.workers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(id)
            .map(|w| *w.health.lock().unwrap_or_else(std::sync::PoisonError::into_inner))
    }

    /// This worker's accumulated metrics.
    #[must_use]
    pub fn metrics_of(&self, id: &str) -> Option<WorkerMetrics> {
        self.workers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(id)
            .map(|w| *w.metrics.lock().unwrap_or_else(std::sync::PoisonError::into_inner))
    }

    /// Pick a worker for `message_id`, optionally weighing `required_capabilities`
    /// (consulted only by `CapabilityMatch`/`Adaptive`).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoHealthyWorker`] if no worker is healthy.
    pub fn select_worker(&self, message_id: &str, required_capabilities: &[Capability]) -> Result<String> {
        let workers = self.workers.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let healthy = self.healthy();
        if healthy.is_empty() {
            return Err(EngineError::NoHealthyWorker);
        }

        let selected = match self.strategy {
            DispatchStrategy::RoundRobin => {
                let hash = simple_hash(message_id);
                healthy[(hash as usize) % healthy.len()].clone()
            }
            DispatchStrategy::LeastLoaded => least_loaded(&workers, &healthy),
            DispatchStrategy::CapabilityMatch => {
                let survivors: Vec<String> = healthy
                    .iter()
                    .filter(|id| {
                        workers.get(*id).is_some_and(|w| {
                            required_capabilities.is_empty()
                                || w.config.capabilities.iter().any(|c| required_capabilities.contains(c))
                        })
                    })
                    .cloned()
                    .collect();
                if survivors.is_empty() {
                    least_loaded(&workers, &healthy)
                } else {
                    least_loaded(&workers, &survivors)
                }
            }
            DispatchStrategy::Adaptive => adaptive_best(&workers, &healthy, required_capabilities),
        };

        Ok(selected)
    }

    /// Dispatch through `worker_id`'s circuit breaker, retrying once on the
    /// configured fallback if the breaker is open or `run` fails.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::CircuitOpen`] if both the worker and its
    /// fallback (if any) refuse execution, or the underlying error if the
    /// fallback also fails.
    pub async fn dispatch_through<F, Fut, T>(&self, worker_id: &str, now: u64, run: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        match self.try_dispatch(worker_id, now, &run).await {
            Ok(value) => Ok(value),
            Err(err) => {
                let fallback = self.fallback_worker_id.clone();
                match fallback {
                    Some(fallback_id) if fallback_id != worker_id => self.try_dispatch(&fallback_id, now, &run).await,
                    _ => Err(err),
                }
            }
        }
    }

    async fn try_dispatch<F, Fut, T>(&self, worker_id: &str, now: u64, run: &F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let admission = {
            let workers = self.workers.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            let Some(entry) = workers.get(worker_id) else {
                return Err(EngineError::HandoffTargetMissing(worker_id.to_string()));
            };
            entry.load.fetch_add(1, Ordering::SeqCst);
            entry.breaker.try_acquire()
        };

        if admission == Admission::Refused {
            self.decrement_load(worker_id);
            return Err(EngineError::CircuitOpen { worker: worker_id.to_string() });
        }

        let result = run(worker_id.to_string()).await;
        self.decrement_load(worker_id);
        self.record_outcome(worker_id, result.is_ok(), now);
        result
    }

    fn decrement_load(&self, worker_id: &str) {
        if let Some(entry) = self.workers.read().unwrap_or_else(std::sync::PoisonError::into_inner).get(worker_id) {
            entry.load.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn record_outcome(&self, worker_id: &str, success: bool, now: u64) {
        let workers = self.workers.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(entry) = workers.get(worker_id) else { return };

        if success {
            entry.breaker.record_success();
        } else {
            entry.breaker.record_failure();
        }

        let mut health = entry.health.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        health.last_check = now;
        if success {
            health.healthy = true;
            health.consecutive_failures = 0;
        } else {
            health.consecutive_failures += 1;
            if health.consecutive_failures >= self.unhealthy_threshold {
                health.healthy = false;
            }
        }

        let mut metrics = entry.metrics.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        metrics.dispatches += 1;
        if !success {
            metrics.failures += 1;
        }
    }

    /// Demote workers whose last health check is older than
    /// `stale_after`. Intended to be driven by a background probe loop at
    /// `health_check_interval`.
    pub fn demote_stale(&self, now: u64, stale_after_ms: u64) {
        let workers = self.workers.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        for entry in workers.values() {
            let mut health = entry.health.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if now.saturating_sub(health.last_check) > stale_after_ms {
                health.healthy = false;
            }
        }
    }

    /// Record a handoff from `from_worker_id` to `to_worker_id`, verifying
    /// the target is registered and healthy.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::HandoffTargetMissing`] if the target is not
    /// registered or not healthy.
    pub fn record_handoff(&self, session_id: &str, from_worker_id: &str, to_worker_id: &str, now: u64) -> Result<()> {
        let workers = self.workers.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let target_healthy = workers
            .get(to_worker_id)
            .is_some_and(|w| w.health.lock().unwrap_or_else(std::sync::PoisonError::into_inner).healthy);
        if !target_healthy {
            return Err(EngineError::HandoffTargetMissing(to_worker_id.to_string()));
        }

        if let Some(source) = workers.get(from_worker_id) {
            source.metrics.lock().unwrap_or_else(std::sync::PoisonError::into_inner).handoffs_sent += 1;
        }
        if let Some(target) = workers.get(to_worker_id) {
            target.metrics.lock().unwrap_or_else(std::sync::PoisonError::into_inner).handoffs_received += 1;
        }
        drop(workers);

        self.event_bus.publish(Event::new(
            now,
            session_id.to_string(),
            EventPayload::Handoff {
                session_id: session_id.to_string(),
                from_worker: from_worker_id.to_string(),
                to_worker: to_worker_id.to_string(),
            },
        ));
        Ok(())
    }
}

fn least_loaded(workers: &HashMap<String, WorkerEntry>, candidates: &[String]) -> String {
    candidates
        .iter()
        .filter_map(|id| workers.get(id).map(|w| (id, w.load.load(Ordering::SeqCst), w.registration_order)))
        .min_by_key(|(_, load, order)| (*load, *order))
        .map(|(id, _, _)| id.clone())
        .unwrap_or_else(|| candidates[0].clone())
}

fn adaptive_best(workers: &HashMap<String, WorkerEntry>, candidates: &[String], required_capabilities: &[Capability]) -> String {
    candidates
        .iter()
        .filter_map(|id| workers.get(id).map(|w| (id, w)))
        .map(|(id, w)| {
            let load = w.load.load(Ordering::SeqCst) as f64;
            let metrics = *w.metrics.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let failure_rate = if metrics.dispatches == 0 { 0.0 } else { metrics.failures as f64 / metrics.dispatches as f64 };
            let matching_capabilities = w.config.capabilities.iter().filter(|c| required_capabilities.contains(c)).count() as f64;
            let breaker_closed = w.breaker.state() == crate::circuit::BreakerState::Closed;
            let score = 100.0 - 10.0 * load - 50.0 * failure_rate + 15.0 * matching_capabilities + if breaker_closed { 10.0 } else { 0.0 };
            (id, score, w.registration_order)
        })
        .max_by(|(_, a, order_a), (_, b, order_b)| {
            a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal).then(order_b.cmp(order_a))
        })
        .map(|(id, _, _)| id.clone())
        .unwrap_or_else(|| candidates[0].clone())
}

fn simple_hash(value: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in value.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn worker(id: &str) -> WorkerConfig {
        WorkerConfig::new(id, id, "you are a worker")
    }

    fn pool(strategy: DispatchStrategy) -> Swarm {
        Swarm::new(strategy, None, Arc::new(EventBus::new(64)))
    }

    #[test]
    fn round_robin_is_deterministic_for_a_given_message_id() {
        let pool = pool(DispatchStrategy::RoundRobin);
        pool.register(worker("a"), CircuitBreakerConfig::default(), 0).unwrap();
        pool.register(worker("b"), CircuitBreakerConfig::default(), 0).unwrap();

        let first = pool.select_worker("msg-1", &[]).unwrap();
        let second = pool.select_worker("msg-1", &[]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn least_loaded_prefers_fewer_in_flight_tasks() {
        let pool = pool(DispatchStrategy::LeastLoaded);
        pool.register(worker("a"), CircuitBreakerConfig::default(), 0).unwrap();
        pool.register(worker("b"), CircuitBreakerConfig::default(), 0).unwrap();

        if let Some(entry) = pool.workers.read().unwrap().get("a") {
            entry.load.store(5, Ordering::SeqCst);
        }

        assert_eq!(pool.select_worker("msg-1", &[]).unwrap(), "b");
    }

    #[test]
    fn capability_match_falls_back_to_least_loaded_on_empty_survivors() {
        let pool = pool(DispatchStrategy::CapabilityMatch);
        pool.register(worker("a"), CircuitBreakerConfig::default(), 0).unwrap();

        let selected = pool.select_worker("msg-1", &["nonexistent".to_string()]).unwrap();
        assert_eq!(selected, "a");
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let pool = pool(DispatchStrategy::RoundRobin);
        pool.register(worker("a"), CircuitBreakerConfig::default(), 0).unwrap();
        assert!(pool.register(worker("a"), CircuitBreakerConfig::default(), 0).is_err());
    }

    #[test]
    fn no_healthy_worker_is_an_error() {
        let pool = pool(DispatchStrategy::RoundRobin);
        assert!(matches!(pool.select_worker("msg-1", &[]), Err(EngineError::NoHealthyWorker)));
    }

    #[tokio::test]
    async fn dispatch_retries_once_on_fallback_when_primary_breaker_is_open() {
        let pool = Swarm::new(DispatchStrategy::RoundRobin, Some("backup".to_string()), Arc::new(EventBus::new(64)));
        let breaker_config = CircuitBreakerConfig { failure_threshold: 1, ..CircuitBreakerConfig::default() };
        pool.register(worker("primary"), breaker_config, 0).unwrap();
        pool.register(worker("backup"), CircuitBreakerConfig::default(), 0).unwrap();

        // Trip the primary's breaker.
        let _ = pool
            .dispatch_through("primary", 0, |_id| async { Err::<(), _>(EngineError::Internal("boom".into())) })
            .await;

        let result = pool.dispatch_through("primary", 0, |id| async move { Ok(id) }).await.unwrap();
        assert_eq!(result, "backup");
    }

    #[test]
    fn handoff_requires_a_healthy_registered_target() {
        let pool = pool(DispatchStrategy::RoundRobin);
        pool.register(worker("a"), CircuitBreakerConfig::default(), 0).unwrap();
        assert!(pool.record_handoff("s1", "a", "missing", 0).is_err());
    }

    #[tokio::test]
    async fn circuit_opens_after_threshold_and_closes_after_recovery_probes() {
        let pool = pool(DispatchStrategy::RoundRobin);
        let breaker_config = CircuitBreakerConfig {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_millis(10),
            half_open_max_probes: 2,
        };
        pool.register(worker("flaky"), breaker_config, 0).unwrap();

        for _ in 0..5 {
            let _ = pool.dispatch_through("flaky", 0, |_id| async { Err::<(), _>(EngineError::Internal("boom".into())) }).await;
        }

        let sixth = pool.dispatch_through("flaky", 0, |id| async move { Ok(id) }).await;
        assert!(matches!(sixth, Err(EngineError::CircuitOpen { .. })));

        std::thread::sleep(Duration::from_millis(15));
        pool.dispatch_through("flaky", 0, |id| async move { Ok(id) }).await.unwrap();
        let closed = pool.dispatch_through("flaky", 0, |id| async move { Ok(id) }).await.unwrap();
        assert_eq!(closed, "flaky");

        let after_close = pool.dispatch_through("flaky", 0, |id| async move { Ok(id) }).await.unwrap();
        assert_eq!(after_close, "flaky");
    }
}
