use models::Endpoint;
use std::collections::HashMap;
use std::sync::{Mutex, Weak};
use std::time::{Duration, Instant};

const WINDOW_SIZE: usize = 1000;
// Seed interval assumed before the first real sample arrives.
const INITIAL_INTERVAL: Duration = Duration::from_millis(500);

/// Receives convictions when a peer's suspicion level crosses the
/// threshold. Listeners are held weakly; a dropped listener is skipped.
pub trait FailureListener: Send + Sync {
    fn convict(&self, endpoint: Endpoint, phi: f64);
}

/// φ-accrual failure detector: per peer, a bounded window of heartbeat
/// inter-arrival gaps yields a continuous suspicion value
/// `φ = elapsed / (mean · ln 10)`, the negative decimal log of the chance
/// the next heartbeat is still coming under an exponential arrival model.
pub struct FailureDetector {
    threshold: f64,
    windows: Mutex<HashMap<Endpoint, ArrivalWindow>>,
    listeners: Mutex<Vec<Weak<dyn FailureListener>>>,
}

struct ArrivalWindow {
    last: Instant,
    intervals: std::collections::VecDeque<Duration>,
}

impl ArrivalWindow {
    fn new(now: Instant) -> Self {
        let mut intervals = std::collections::VecDeque::with_capacity(WINDOW_SIZE);
        intervals.push_back(INITIAL_INTERVAL);
        Self {
            last: now,
            intervals,
        }
    }

    fn record(&mut self, now: Instant) {
        let gap = now.saturating_duration_since(self.last);
        self.last = now;
        if self.intervals.len() == WINDOW_SIZE {
            self.intervals.pop_front();
        }
        self.intervals.push_back(gap);
    }

    fn mean(&self) -> Duration {
        let total: Duration = self.intervals.iter().sum();
        total / self.intervals.len() as u32
    }

    fn phi(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        let mean = self.mean().as_secs_f64().max(1e-6);
        elapsed / (mean * std::f64::consts::LN_10)
    }
}

impl FailureDetector {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            windows: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, listener: Weak<dyn FailureListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Record a heartbeat arrival for `endpoint`.
    pub fn report(&self, endpoint: Endpoint) {
        self.report_at(endpoint, Instant::now())
    }

    fn report_at(&self, endpoint: Endpoint, now: Instant) {
        let mut windows = self.windows.lock().unwrap();
        match windows.get_mut(&endpoint) {
            Some(window) => window.record(now),
            None => {
                windows.insert(endpoint, ArrivalWindow::new(now));
            }
        }
    }

    /// Evaluate `endpoint` and convict it through the registered listeners
    /// when its φ exceeds the threshold.
    pub fn interpret(&self, endpoint: Endpoint) {
        self.interpret_at(endpoint, Instant::now())
    }

    fn interpret_at(&self, endpoint: Endpoint, now: Instant) {
        let phi = {
            let windows = self.windows.lock().unwrap();
            match windows.get(&endpoint) {
                Some(window) => window.phi(now),
                None => return,
            }
        };
        if phi > self.threshold {
            tracing::trace!(%endpoint, phi, "phi over threshold, convicting");
            let listeners = self.listeners.lock().unwrap().clone();
            for listener in listeners {
                if let Some(listener) = listener.upgrade() {
                    listener.convict(endpoint, phi);
                }
            }
        }
    }

    /// Current suspicion level, for introspection.
    pub fn phi(&self, endpoint: Endpoint) -> Option<f64> {
        let windows = self.windows.lock().unwrap();
        windows.get(&endpoint).map(|w| w.phi(Instant::now()))
    }

    /// Forget `endpoint`'s arrival history. Used when a peer restarts with
    /// a new generation: its old cadence no longer predicts anything.
    pub fn remove(&self, endpoint: Endpoint) {
        self.windows.lock().unwrap().remove(&endpoint);
    }

    pub fn knows(&self, endpoint: Endpoint) -> bool {
        self.windows.lock().unwrap().contains_key(&endpoint)
    }
}
