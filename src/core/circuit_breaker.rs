//! Per-service circuit breaking.
//!
//! Each service gets one [`CircuitBreaker`], created on first use by the
//! [`CircuitBreakerRegistry`]. State transitions happen under a per-service
//! mutex together with the counters they depend on, so concurrent requests
//! always observe a consistent state machine.
//!
//! The request path admits through [`CircuitBreaker::try_acquire`]. The
//! returned [`BreakerPermit`] remembers the generation it was granted in, so a
//! slow response from before a state change cannot close or reopen the
//! circuit, and an abandoned trial request gives its slot back on drop.
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::Serialize;
use tokio::time::Instant;

use crate::config::{CircuitBreakerConfig, GatewayConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    /// Trial requests admitted since entering HALF_OPEN
    trials_admitted: u32,
    /// Bumped on every state change; admissions from an older generation do not drive transitions
    generation: u64,
    total_successes: u64,
    total_failures: u64,
    times_opened: u64,
    rejected: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            trials_admitted: 0,
            generation: 0,
            total_successes: 0,
            total_failures: 0,
            times_opened: 0,
            rejected: 0,
        }
    }

    fn transition(&mut self, state: CircuitState) {
        self.state = state;
        self.generation += 1;
        self.failure_count = 0;
        self.success_count = 0;
        self.trials_admitted = 0;
    }

    fn open(&mut self) {
        self.transition(CircuitState::Open);
        self.opened_at = Some(Instant::now());
        self.times_opened += 1;
    }

    fn half_open(&mut self) {
        self.transition(CircuitState::HalfOpen);
    }

    fn close(&mut self) {
        self.transition(CircuitState::Closed);
        self.opened_at = None;
    }

    /// Whether an outcome should move the state machine.
    ///
    /// Unscoped outcomes (no admission) always apply to the current state.
    fn is_current(&self, admission: Option<Admission>) -> bool {
        admission.is_none_or(|a| a.generation == self.generation)
    }
}

/// What `is_allowed` handed out: the generation it was granted in and
/// whether it consumed a HALF_OPEN trial slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Admission {
    generation: u64,
    trial: bool,
}

/// Snapshot of one breaker for the operational API.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BreakerStats {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub times_opened: u64,
    pub rejected: u64,
}

/// Three-state breaker guarding one upstream service.
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.config.reset_timeout_ms)
    }

    /// Whether a request may be sent to the service right now.
    ///
    /// An OPEN circuit whose reset timeout has elapsed moves to HALF_OPEN here
    /// and admits the caller as the first trial request. Prefer
    /// [`CircuitBreaker::try_acquire`] on the request path: its permit gives the
    /// trial slot back if the request is abandoned.
    pub fn is_allowed(&self) -> bool {
        self.admit().is_some()
    }

    /// Admit one request and tie its outcome to the returned permit.
    pub fn try_acquire(self: &Arc<Self>) -> Option<BreakerPermit> {
        self.admit().map(|admission| BreakerPermit {
            breaker: Arc::clone(self),
            admission,
            settled: false,
        })
    }

    fn admit(&self) -> Option<Admission> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Some(Admission {
                generation: inner.generation,
                trial: false,
            }),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.reset_timeout() {
                    inner.half_open();
                    inner.trials_admitted = 1;
                    tracing::info!(service = %self.service, "Circuit HALF_OPEN, admitting trial request");
                    Some(Admission {
                        generation: inner.generation,
                        trial: true,
                    })
                } else {
                    inner.rejected += 1;
                    None
                }
            }
            CircuitState::HalfOpen => {
                if inner.trials_admitted < self.config.half_open_trial_count {
                    inner.trials_admitted += 1;
                    Some(Admission {
                        generation: inner.generation,
                        trial: true,
                    })
                } else {
                    inner.rejected += 1;
                    None
                }
            }
        }
    }

    pub fn record_success(&self) {
        self.settle_success(None);
    }

    pub fn record_failure(&self) {
        self.settle_failure(None);
    }

    /// Give back a HALF_OPEN trial permit that never reached the backend.
    pub fn release(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trials_admitted = inner.trials_admitted.saturating_sub(1);
        }
    }

    fn settle_success(&self, admission: Option<Admission>) {
        let mut inner = self.lock();
        inner.total_successes += 1;
        if !inner.is_current(admission) {
            return;
        }
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.half_open_trial_count {
                    inner.close();
                    tracing::info!(service = %self.service, "Circuit CLOSED after successful trial");
                }
            }
            // Late outcome of a request admitted before the circuit opened
            CircuitState::Open => {}
        }
    }

    fn settle_failure(&self, admission: Option<Admission>) {
        let mut inner = self.lock();
        inner.total_failures += 1;
        if !inner.is_current(admission) {
            return;
        }
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.open();
                    tracing::warn!(
                        service = %self.service,
                        failure_threshold = self.config.failure_threshold,
                        reset_timeout_ms = self.config.reset_timeout_ms,
                        "Circuit OPEN"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.open();
                tracing::warn!(service = %self.service, "Trial request failed, circuit OPEN again");
            }
            CircuitState::Open => {}
        }
    }

    fn give_back(&self, admission: Admission) {
        let mut inner = self.lock();
        if admission.trial
            && inner.state == CircuitState::HalfOpen
            && inner.generation == admission.generation
        {
            inner.trials_admitted = inner.trials_admitted.saturating_sub(1);
            tracing::debug!(service = %self.service, "Unused trial permit returned");
        }
    }

    /// Current state without triggering the OPEN to HALF_OPEN transition.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.lock();
        BreakerStats {
            service: self.service.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            failure_threshold: self.config.failure_threshold,
            reset_timeout_ms: self.config.reset_timeout_ms,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            times_opened: inner.times_opened,
            rejected: inner.rejected,
        }
    }
}

/// One admitted request.
///
/// Settle it with [`BreakerPermit::record_success`] or
/// [`BreakerPermit::record_failure`]. Dropping it unsettled hands a HALF_OPEN
/// trial slot back, so abandoned requests never wedge the breaker. Outcomes
/// from a permit granted before the last state change only reach the
/// lifetime counters.
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    admission: Admission,
    settled: bool,
}

impl BreakerPermit {
    pub fn is_trial(&self) -> bool {
        self.admission.trial
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.settle_success(Some(self.admission));
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.settle_failure(Some(self.admission));
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.give_back(self.admission);
        }
    }
}

/// Lazily populated map of breakers keyed by service name.
pub struct CircuitBreakerRegistry {
    breakers: scc::HashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
    /// Resolved settings per configured service; anything else gets `default_config`
    service_configs: HashMap<String, CircuitBreakerConfig>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: scc::HashMap::new(),
            default_config,
            service_configs: HashMap::new(),
        }
    }

    /// Registry honoring the per-service overrides found in the gateway config.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let service_configs = config
            .services
            .keys()
            .map(|name| (name.clone(), config.breaker_config_for(name).clone()))
            .collect();

        Self {
            breakers: scc::HashMap::new(),
            default_config: config.circuit_breaker.clone(),
            service_configs,
        }
    }

    fn config_for(&self, service: &str) -> CircuitBreakerConfig {
        self.service_configs
            .get(service)
            .unwrap_or(&self.default_config)
            .clone()
    }

    /// Breaker for `service`, created on first call.
    pub async fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(entry) = self.breakers.get_async(service).await {
            return entry.get().clone();
        }

        match self.breakers.entry_async(service.to_string()).await {
            scc::hash_map::Entry::Occupied(entry) => entry.get().clone(),
            scc::hash_map::Entry::Vacant(entry) => {
                let breaker = Arc::new(CircuitBreaker::new(service, self.config_for(service)));
                entry.insert_entry(breaker.clone());
                breaker
            }
        }
    }

    pub async fn is_allowed(&self, service: &str) -> bool {
        self.breaker(service).await.is_allowed()
    }

    pub async fn record_success(&self, service: &str) {
        self.breaker(service).await.record_success();
    }

    pub async fn record_failure(&self, service: &str) {
        self.breaker(service).await.record_failure();
    }

    pub async fn release(&self, service: &str) {
        self.breaker(service).await.release();
    }

    /// Stats of every breaker created so far, ordered by service name.
    pub async fn stats(&self) -> Vec<BreakerStats> {
        let mut stats = Vec::new();
        self.breakers
            .retain_async(|_, breaker| {
                stats.push(breaker.stats());
                true
            })
            .await;
        stats.sort_by(|a, b| a.service.cmp(&b.service));
        stats
    }
}

impl fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("default_config", &self.default_config)
            .field("service_configs", &self.service_configs)
            .finish_non_exhaustive()
    }
}
