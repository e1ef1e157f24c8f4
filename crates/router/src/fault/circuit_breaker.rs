//! Per-destination circuit breakers.
//!
//! - Closed: calls pass; consecutive transient failures are counted
//! - Open: calls fail at once with `Error::CircuitOpen`, no network attempt
//! - Half-open: a single trial call decides between closed and open
//!
//! Transitions are evaluated lazily when the next call arrives, so an open
//! circuit stays open on the books until someone tries it after the cooldown.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use itertools::Itertools;
use tokio::time::Instant;
use tracing::{info, warn};

use murmur_core::{CircuitConfig, CircuitState, CorrelationId, Error, ProcessId, Result};
use murmur_events::{EventBus, ObservabilityEvent};

/// `(from, to)`.
pub type Transition = (CircuitState, CircuitState);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The half-open trial call.
    Trial,
    Rejected,
}

/// Circuit state machine for one destination. Clock-injected.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: &CircuitConfig) -> Self {
        Self {
            threshold: config.failure_threshold.max(1),
            cooldown: config.cooldown(),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    #[must_use]
    pub const fn state(&self) -> CircuitState {
        self.state
    }

    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    #[must_use]
    pub const fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    /// Decide whether a call may proceed.
    pub fn admit(&mut self, now: Instant) -> (Admission, Option<Transition>) {
        match self.state {
            CircuitState::Closed => (Admission::Allowed, None),
            CircuitState::Open => {
                let cooled = self
                    .opened_at
                    .is_none_or(|at| now.saturating_duration_since(at) >= self.cooldown);
                if cooled {
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = true;
                    (
                        Admission::Trial,
                        Some((CircuitState::Open, CircuitState::HalfOpen)),
                    )
                } else {
                    (Admission::Rejected, None)
                }
            }
            CircuitState::HalfOpen if self.trial_in_flight => (Admission::Rejected, None),
            CircuitState::HalfOpen => {
                self.trial_in_flight = true;
                (Admission::Trial, None)
            }
        }
    }

    pub fn on_success(&mut self) -> Option<Transition> {
        self.consecutive_failures = 0;
        self.trial_in_flight = false;
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                self.opened_at = None;
                Some((CircuitState::HalfOpen, CircuitState::Closed))
            }
            CircuitState::Closed | CircuitState::Open => None,
        }
    }

    pub fn on_failure(&mut self, now: Instant) -> Option<Transition> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.trial_in_flight = false;
        match self.state {
            CircuitState::HalfOpen => Some(self.open(now, CircuitState::HalfOpen)),
            CircuitState::Closed if self.consecutive_failures >= self.threshold => {
                Some(self.open(now, CircuitState::Closed))
            }
            CircuitState::Closed | CircuitState::Open => None,
        }
    }

    /// The call ended with an error that says nothing about the destination.
    pub fn on_neutral(&mut self) {
        self.trial_in_flight = false;
    }

    fn open(&mut self, now: Instant, from: CircuitState) -> Transition {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        (from, CircuitState::Open)
    }
}

/// Breakers for every destination process, created on first use.
pub struct CircuitBreakers {
    config: CircuitConfig,
    breakers: Mutex<HashMap<ProcessId, CircuitBreaker>>,
    bus: EventBus,
}

impl CircuitBreakers {
    #[must_use]
    pub fn new(config: CircuitConfig, bus: EventBus) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
            bus,
        }
    }

    /// Run `op` through the breaker for `destination`.
    ///
    /// Transient errors count as failures; any other outcome counts as
    /// success except non-transient errors, which leave the count alone.
    ///
    /// # Errors
    ///
    /// `Error::CircuitOpen` without running `op`, or whatever `op` returns.
    pub async fn call<T, F>(
        &self,
        destination: &ProcessId,
        correlation: &CorrelationId,
        op: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let (admission, transition) =
            self.with_breaker(destination, |breaker| breaker.admit(Instant::now()));
        self.report(destination, correlation, transition).await;
        if admission == Admission::Rejected {
            return Err(Error::circuit_open(destination.as_str()));
        }

        // Dropping the call mid-trial must not leave the breaker half-open
        // with a trial nobody will finish.
        let mut trial = TrialGuard {
            breakers: self,
            destination,
            armed: admission == Admission::Trial,
        };
        let result = op.await;
        trial.armed = false;

        let transition = self.with_breaker(destination, |breaker| match &result {
            Ok(_) => breaker.on_success(),
            Err(e) if e.is_transient() => breaker.on_failure(Instant::now()),
            Err(_) => {
                breaker.on_neutral();
                None
            }
        });
        self.report(destination, correlation, transition).await;
        result
    }

    /// Stored state; does not apply a pending cooldown transition.
    pub async fn state(&self, destination: &ProcessId) -> CircuitState {
        self.lock()
            .get(destination)
            .map_or(CircuitState::Closed, CircuitBreaker::state)
    }

    /// Every known breaker, ordered by destination.
    pub async fn snapshot(&self) -> Vec<(ProcessId, CircuitState, u32)> {
        self.lock()
            .iter()
            .sorted_by(|a, b| a.0.cmp(b.0))
            .map(|(id, b)| (id.clone(), b.state(), b.consecutive_failures()))
            .collect()
    }

    async fn report(
        &self,
        destination: &ProcessId,
        correlation: &CorrelationId,
        transition: Option<Transition>,
    ) {
        let Some((from, to)) = transition else {
            return;
        };
        let failures = self
            .lock()
            .get(destination)
            .map_or(0, CircuitBreaker::consecutive_failures);
        if to == CircuitState::Open {
            warn!(destination = %destination, %from, %to, failures, "circuit opened");
        } else {
            info!(destination = %destination, %from, %to, "circuit transition");
        }
        self.bus
            .emit(ObservabilityEvent::circuit(
                correlation.clone(),
                destination,
                from,
                to,
                failures,
            ))
            .await;
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ProcessId, CircuitBreaker>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_breaker<T>(
        &self,
        destination: &ProcessId,
        f: impl FnOnce(&mut CircuitBreaker) -> T,
    ) -> T {
        let mut breakers = self.lock();
        let breaker = breakers
            .entry(destination.clone())
            .or_insert_with(|| CircuitBreaker::new(&self.config));
        f(breaker)
    }
}

/// Releases an unfinished half-open trial.
struct TrialGuard<'a> {
    breakers: &'a CircuitBreakers,
    destination: &'a ProcessId,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(destination = %self.destination, "half-open trial abandoned");
            self.breakers.with_breaker(self.destination, CircuitBreaker::on_neutral);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use murmur_events::EventPattern;

    fn config() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 5,
            cooldown_ms: 1_000,
        }
    }

    #[test]
    fn opens_at_threshold_and_rejects() {
        let mut breaker = CircuitBreaker::new(&config());
        let now = Instant::now();
        for _ in 0..4 {
            assert_eq!(breaker.on_failure(now), None);
        }
        assert_eq!(
            breaker.on_failure(now),
            Some((CircuitState::Closed, CircuitState::Open))
        );
        assert_eq!(breaker.admit(now).0, Admission::Rejected);
    }

    #[test]
    fn success_resets_the_count() {
        let mut breaker = CircuitBreaker::new(&config());
        let now = Instant::now();
        for _ in 0..4 {
            breaker.on_failure(now);
        }
        breaker.on_success();
        assert_eq!(breaker.on_failure(now), None);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_admits_one_trial() {
        let mut breaker = CircuitBreaker::new(&config());
        let start = Instant::now();
        for _ in 0..5 {
            breaker.on_failure(start);
        }
        let later = start + Duration::from_millis(1_000);
        assert_eq!(
            breaker.admit(later),
            (
                Admission::Trial,
                Some((CircuitState::Open, CircuitState::HalfOpen))
            )
        );
        assert_eq!(breaker.admit(later).0, Admission::Rejected);

        assert_eq!(
            breaker.on_failure(later),
            Some((CircuitState::HalfOpen, CircuitState::Open))
        );
        let after_second_cooldown = later + Duration::from_millis(1_000);
        assert_eq!(breaker.admit(after_second_cooldown).0, Admission::Trial);
        assert_eq!(
            breaker.on_success(),
            Some((CircuitState::HalfOpen, CircuitState::Closed))
        );
        assert_eq!(breaker.admit(after_second_cooldown).0, Admission::Allowed);
    }

    #[test]
    fn neutral_outcome_releases_the_trial() {
        let mut breaker = CircuitBreaker::new(&config());
        let start = Instant::now();
        for _ in 0..5 {
            breaker.on_failure(start);
        }
        let later = start + Duration::from_secs(2);
        assert_eq!(breaker.admit(later).0, Admission::Trial);
        breaker.on_neutral();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.admit(later).0, Admission::Trial);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_calling() {
        let bus = EventBus::in_memory();
        let mut transitions = bus.subscribe_with_pattern(EventPattern::ByType(
            "circuit_transition".into(),
        ));
        let breakers = CircuitBreakers::new(config(), bus);
        let destination = ProcessId::new("p2");
        let correlation = CorrelationId::generate();
        let calls = AtomicU32::new(0);

        for _ in 0..5 {
            let result: Result<()> = breakers
                .call(&destination, &correlation, async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::transport("p2", "connection refused"))
                })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(breakers.state(&destination).await, CircuitState::Open);

        let result: Result<()> = breakers
            .call(&destination, &correlation, async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        let event = transitions.recv().await.unwrap();
        assert_eq!(event.event_type(), "circuit_transition");
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_trial_does_not_wedge_the_circuit() {
        let breakers = CircuitBreakers::new(
            CircuitConfig {
                failure_threshold: 1,
                cooldown_ms: 100,
            },
            EventBus::in_memory(),
        );
        let destination = ProcessId::new("p2");
        let correlation = CorrelationId::generate();

        let failed: Result<()> = breakers
            .call(&destination, &correlation, async {
                Err(Error::transport("p2", "connection refused"))
            })
            .await;
        assert!(failed.is_err());
        assert_eq!(breakers.state(&destination).await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let trial = breakers.call(&destination, &correlation, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, Error>(())
        });
        assert!(
            tokio::time::timeout(Duration::from_millis(10), trial)
                .await
                .is_err()
        );
        assert_eq!(breakers.state(&destination).await, CircuitState::HalfOpen);

        let next: Result<()> = breakers
            .call(&destination, &correlation, async { Ok(()) })
            .await;
        assert!(next.is_ok());
        assert_eq!(breakers.state(&destination).await, CircuitState::Closed);
    }
}
