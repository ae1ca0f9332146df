use crate::config::FederationConfig;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

/// What the breaker allows for the next call.
#[derive(Debug, PartialEq, Eq)]
pub enum CircuitDecision {
    Allow,
    /// Half-open: the caller holds the single probe token and must report
    /// back via `on_success`/`on_failure` (or `release_probe` on
    /// cancellation).
    AllowProbe,
    FastFail { retry_in: Duration },
}

/// Per-endpoint failure gate. 5xx, timeouts and network errors count against
/// it; 4xx responses never do (client errors are not upstream instability).
pub struct CircuitBreaker {
    state: State,
    consecutive_failures: u32,
    first_failure_at: Option<Instant>,
    pub(super) last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    cooldown: Duration,
    probe_in_flight: bool,

    failure_threshold: u32,
    window: Duration,
    base_cooldown: Duration,
    cooldown_cap: Duration,
}

impl CircuitBreaker {
    pub fn new(config: &FederationConfig) -> Self {
        let base_cooldown = Duration::from_secs(config.breaker_cooldown_secs);
        CircuitBreaker {
            state: State::Closed,
            consecutive_failures: 0,
            first_failure_at: None,
            last_failure_at: None,
            opened_at: None,
            cooldown: base_cooldown,
            probe_in_flight: false,
            failure_threshold: config.breaker_failure_threshold,
            window: Duration::from_secs(config.breaker_window_secs),
            base_cooldown,
            cooldown_cap: Duration::from_secs(config.breaker_cooldown_cap_secs),
        }
    }

    pub fn check(&mut self, now: Instant) -> CircuitDecision {
        match self.state {
            State::Closed => CircuitDecision::Allow,
            State::Open => {
                let opened_at = self.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.cooldown {
                    self.transition(State::HalfOpen);
                    self.probe_in_flight = true;
                    CircuitDecision::AllowProbe
                } else {
                    CircuitDecision::FastFail {
                        retry_in: self.cooldown - elapsed,
                    }
                }
            }
            State::HalfOpen => {
                if self.probe_in_flight {
                    CircuitDecision::FastFail {
                        retry_in: self.cooldown,
                    }
                } else {
                    self.probe_in_flight = true;
                    CircuitDecision::AllowProbe
                }
            }
        }
    }

    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
        self.first_failure_at = None;
        self.probe_in_flight = false;
        if self.state != State::Closed {
            self.cooldown = self.base_cooldown;
            self.transition(State::Closed);
        }
    }

    pub fn on_failure(&mut self, now: Instant) {
        self.last_failure_at = Some(now);

        match self.state {
            State::HalfOpen => {
                // The probe failed: back to open with a doubled cool-down.
                self.probe_in_flight = false;
                self.cooldown = (self.cooldown * 2).min(self.cooldown_cap);
                self.opened_at = Some(now);
                self.transition(State::Open);
            }
            State::Closed => {
                // Failures only accumulate while they stay inside the window.
                match self.first_failure_at {
                    Some(first) if now.saturating_duration_since(first) <= self.window => {}
                    _ => {
                        self.first_failure_at = Some(now);
                        self.consecutive_failures = 0;
                    }
                }
                self.consecutive_failures += 1;

                if self.consecutive_failures >= self.failure_threshold {
                    self.opened_at = Some(now);
                    self.transition(State::Open);
                }
            }
            State::Open => {}
        }
    }

    /// Returns the half-open probe token without reporting an outcome
    /// (cancellation before the probe was actually sent).
    pub fn release_probe(&mut self) {
        if self.state == State::HalfOpen {
            self.probe_in_flight = false;
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }

    pub fn state_label(&self) -> &'static str {
        match self.state {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half-open",
        }
    }

    fn transition(&mut self, next: State) {
        if self.state != next {
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CircuitBreaker, CircuitDecision};
    use crate::config::Config;
    use std::time::{Duration, Instant};

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(&Config::default().federation)
    }

    #[test]
    fn test_opens_after_threshold_within_window() {
        let mut breaker = breaker();
        let now = Instant::now();

        for i in 0..4 {
            breaker.on_failure(now + Duration::from_secs(i));
            assert!(!breaker.is_open());
        }
        breaker.on_failure(now + Duration::from_secs(4));
        assert!(breaker.is_open());

        match breaker.check(now + Duration::from_secs(5)) {
            CircuitDecision::FastFail { retry_in } => {
                assert!(retry_in <= Duration::from_secs(30))
            }
            other => panic!("expected fast fail, got {other:?}"),
        }
    }

    #[test]
    fn test_stale_failures_fall_out_of_the_window() {
        let mut breaker = breaker();
        let now = Instant::now();

        for i in 0..4 {
            breaker.on_failure(now + Duration::from_secs(i));
        }
        // Past the 60s window the streak restarts, so this failure is #1.
        breaker.on_failure(now + Duration::from_secs(120));
        assert!(!breaker.is_open());
    }

    #[test]
    fn test_single_probe_after_cooldown() {
        let mut breaker = breaker();
        let now = Instant::now();
        for i in 0..5 {
            breaker.on_failure(now + Duration::from_secs(i));
        }

        let after_cooldown = now + Duration::from_secs(40);
        assert_eq!(breaker.check(after_cooldown), CircuitDecision::AllowProbe);
        // Exactly one probe: everyone else fast-fails until it reports.
        assert!(matches!(
            breaker.check(after_cooldown),
            CircuitDecision::FastFail { .. }
        ));

        breaker.on_success();
        assert_eq!(breaker.check(after_cooldown), CircuitDecision::Allow);
    }

    #[test]
    fn test_failed_probe_doubles_cooldown() {
        let mut breaker = breaker();
        let now = Instant::now();
        for i in 0..5 {
            breaker.on_failure(now + Duration::from_secs(i));
        }

        let probe_at = now + Duration::from_secs(40);
        assert_eq!(breaker.check(probe_at), CircuitDecision::AllowProbe);
        breaker.on_failure(probe_at);

        // 30s cool-down doubled: still fast-failing at +45s, probing at +61s.
        assert!(matches!(
            breaker.check(probe_at + Duration::from_secs(45)),
            CircuitDecision::FastFail { .. }
        ));
        assert_eq!(
            breaker.check(probe_at + Duration::from_secs(61)),
            CircuitDecision::AllowProbe
        );
    }

    #[test]
    fn test_released_probe_can_be_retaken() {
        let mut breaker = breaker();
        let now = Instant::now();
        for i in 0..5 {
            breaker.on_failure(now + Duration::from_secs(i));
        }

        let probe_at = now + Duration::from_secs(40);
        assert_eq!(breaker.check(probe_at), CircuitDecision::AllowProbe);
        breaker.release_probe();
        assert_eq!(breaker.check(probe_at), CircuitDecision::AllowProbe);
    }
}
