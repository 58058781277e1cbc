//! Service lifecycle state machine
//!
//! Pure state machine: receives events, returns actions. The caller
//! (`main`) performs the I/O each action names.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

/// How long shutdown waits for in-flight requests before forcing exit.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Service states.
#[derive(Debug)]
pub enum ServiceState {
    /// Loading configuration.
    Initializing,
    /// Loading the credentials document into the pool.
    LoadingPool,
    /// Binding the HTTP listeners.
    Starting,
    /// Accepting and dispatching requests.
    Running { started_at: Instant },
    /// Graceful shutdown, finishing in-flight requests and refreshes.
    Draining,
    /// Terminal state.
    Stopped { exit_code: i32 },
}

/// Events that drive state transitions.
#[derive(Debug)]
pub enum ServiceEvent {
    ConfigLoaded,
    PoolReady,
    ListenerReady,
    ShutdownSignal,
    DrainComplete,
}

/// Actions the caller should execute.
#[derive(Debug)]
pub enum ServiceAction {
    LoadPool,
    StartListeners,
    Shutdown { exit_code: i32 },
    None,
}

/// Handle a state transition.
pub fn handle_event(state: ServiceState, event: ServiceEvent) -> (ServiceState, ServiceAction) {
    match (state, event) {
        (ServiceState::Initializing, ServiceEvent::ConfigLoaded) => {
            (ServiceState::LoadingPool, ServiceAction::LoadPool)
        }

        (ServiceState::LoadingPool, ServiceEvent::PoolReady) => {
            (ServiceState::Starting, ServiceAction::StartListeners)
        }

        (ServiceState::Starting, ServiceEvent::ListenerReady) => (
            ServiceState::Running {
                started_at: Instant::now(),
            },
            ServiceAction::None,
        ),

        (ServiceState::Running { .. }, ServiceEvent::ShutdownSignal) => {
            (ServiceState::Draining, ServiceAction::None)
        }

        (ServiceState::Draining, ServiceEvent::DrainComplete) => (
            ServiceState::Stopped { exit_code: 0 },
            ServiceAction::Shutdown { exit_code: 0 },
        ),

        // Shutdown from any other state stops immediately
        (_, ServiceEvent::ShutdownSignal) => (
            ServiceState::Stopped { exit_code: 0 },
            ServiceAction::Shutdown { exit_code: 0 },
        ),

        // Invalid transition: stay put
        (state, _) => (state, ServiceAction::None),
    }
}

/// Shared request counters surfaced on `/health`.
#[derive(Clone)]
pub struct ServiceMetrics {
    pub started_at: Instant,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub failovers_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            failovers_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}
