//! Per-source circuit breaker.
//!
//! A source that keeps failing is cut off for a cooldown window instead of
//! being hammered by retries. Standard three-state machine: closed (normal),
//! open (rejecting calls), half-open (one trial call after the cooldown).

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Observable breaker state, exposed on the metrics surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { until: DateTime<Utc> },
    HalfOpen,
}

/// Circuit breaker for one upstream source.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: State,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            state: State::Closed {
                consecutive_failures: 0,
            },
        }
    }

    /// Whether a call may proceed at `now`. An open breaker whose cooldown
    /// has elapsed moves to half-open and admits exactly one trial call.
    pub fn allow(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            State::Closed { .. } => true,
            State::Open { until } => {
                if now >= until {
                    self.state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
            // The trial call is already in flight; hold further calls back
            // until its outcome is recorded.
            State::HalfOpen => false,
        }
    }

    pub fn record_success(&mut self) {
        self.state = State::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        match self.state {
            State::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.threshold {
                    self.state = State::Open {
                        until: now + self.cooldown,
                    };
                } else {
                    self.state = State::Closed {
                        consecutive_failures: failures,
                    };
                }
            }
            // A failed trial call reopens for a full cooldown.
            State::HalfOpen => {
                self.state = State::Open {
                    until: now + self.cooldown,
                };
            }
            State::Open { .. } => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        match self.state {
            State::Closed { .. } => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen => BreakerState::HalfOpen,
        }
    }
}

/// Registry of breakers keyed by upstream source name.
pub struct BreakerRegistry {
    threshold: u32,
    cooldown: Duration,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a call against `source_name` may proceed right now.
    pub fn allow(&self, source_name: &str) -> bool {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(source_name.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.threshold, self.cooldown))
            .allow(Utc::now())
    }

    pub fn record_success(&self, source_name: &str) {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(source_name.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.threshold, self.cooldown))
            .record_success();
    }

    pub fn record_failure(&self, source_name: &str) {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(source_name.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.threshold, self.cooldown))
            .record_failure(Utc::now());
    }

    /// Current state of every known breaker, for the metrics surface.
    pub fn snapshot(&self) -> HashMap<String, BreakerState> {
        let breakers = self.breakers.lock().unwrap();
        breakers
            .iter()
            .map(|(name, b)| (name.clone(), b.state()))
            .collect()
    }
}
