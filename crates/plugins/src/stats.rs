//! Per-handler health statistics and the circuit breaker built on them.

use std::{
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use {
    switchyard_config::CircuitBreakerConfig,
    tracing::{info, warn},
};

/// Call counters for one registered handler.
#[derive(Debug)]
pub struct HandlerStats {
    pub call_count: AtomicU64,
    pub failure_count: AtomicU64,
    pub consecutive_failures: AtomicU64,
    pub total_latency_us: AtomicU64,
    pub disabled: AtomicBool,
    pub disabled_at: Mutex<Option<Instant>>,
}

impl HandlerStats {
    pub fn new() -> Self {
        Self {
            call_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            disabled: AtomicBool::new(false),
            disabled_at: Mutex::new(None),
        }
    }

    pub fn record_success(&self, latency: Duration) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.add_latency(latency);
    }

    pub fn record_failure(&self, latency: Duration) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        self.add_latency(latency);
    }

    fn add_latency(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.total_latency_us.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn calls(&self) -> u64 {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    pub fn avg_latency(&self) -> Duration {
        let calls = self.calls();
        if calls == 0 {
            return Duration::ZERO;
        }
        let total = self.total_latency_us.load(Ordering::Relaxed);
        Duration::from_micros(total / calls)
    }
}

impl Default for HandlerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Skips handlers that keep faulting, then lets them back in after a
/// cooldown.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    enabled: bool,
    threshold: u64,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u64, cooldown: Duration) -> Self {
        Self {
            enabled: true,
            threshold,
            cooldown,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            threshold: u64::MAX,
            cooldown: Duration::ZERO,
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        if config.enabled {
            Self::new(config.threshold.max(1), config.cooldown())
        } else {
            Self::disabled()
        }
    }

    /// Returns true when the handler must be skipped for this call. Trips the
    /// breaker once the threshold is reached and resets it after the cooldown.
    pub fn is_open(&self, handler: &str, stats: &HandlerStats) -> bool {
        if !self.enabled {
            return false;
        }

        if !stats.disabled.load(Ordering::Relaxed) {
            let consecutive = stats.consecutive_failures.load(Ordering::Relaxed);
            if consecutive < self.threshold {
                return false;
            }
            stats.disabled.store(true, Ordering::Relaxed);
            *stats.disabled_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
            warn!(
                handler,
                "circuit breaker tripped after {} consecutive failures", self.threshold
            );
            return true;
        }

        let disabled_at = stats.disabled_at.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(at) = *disabled_at
            && at.elapsed() >= self.cooldown
        {
            drop(disabled_at);
            stats.disabled.store(false, Ordering::Relaxed);
            stats.consecutive_failures.store(0, Ordering::Relaxed);
            info!(handler, "circuit breaker reset after cooldown");
            return false;
        }
        true
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::from_config(&CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_calls_and_latency() {
        let stats = HandlerStats::new();
        stats.record_success(Duration::from_millis(10));
        stats.record_success(Duration::from_millis(20));
        stats.record_failure(Duration::from_millis(30));
        assert_eq!(stats.calls(), 3);
        assert_eq!(stats.failures(), 1);
        assert_eq!(stats.consecutive_failures.load(Ordering::Relaxed), 1);
        assert_eq!(stats.avg_latency(), Duration::from_millis(20));
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let stats = HandlerStats::new();
        stats.record_failure(Duration::ZERO);
        stats.record_failure(Duration::ZERO);
        stats.record_success(Duration::ZERO);
        assert_eq!(stats.consecutive_failures.load(Ordering::Relaxed), 0);
        assert_eq!(stats.failures(), 2);
    }

    #[test]
    fn trips_at_threshold_and_resets_after_cooldown() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(20));
        let stats = HandlerStats::new();
        stats.record_failure(Duration::ZERO);
        assert!(!breaker.is_open("h", &stats));
        stats.record_failure(Duration::ZERO);
        assert!(breaker.is_open("h", &stats));
        assert!(stats.is_disabled());
        assert!(breaker.is_open("h", &stats));

        std::thread::sleep(Duration::from_millis(30));
        assert!(!breaker.is_open("h", &stats));
        assert!(!stats.is_disabled());
    }

    #[test]
    fn disabled_breaker_never_opens() {
        let breaker = CircuitBreaker::from_config(&CircuitBreakerConfig {
            enabled: false,
            ..Default::default()
        });
        let stats = HandlerStats::new();
        for _ in 0..10 {
            stats.record_failure(Duration::ZERO);
        }
        assert!(!breaker.is_open("h", &stats));
    }
}
