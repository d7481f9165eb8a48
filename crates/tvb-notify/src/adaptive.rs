//! Adaptive heartbeat interval.
//!
//! The interval targets `min_interval` while the bot is active, the base
//! interval after `active_window` of idle time and `max_interval` after
//! `idle_window`. Recomputation grows the interval toward that target and,
//! after activity inside the active window, steps it down toward the
//! minimum. Recorded activity and failed heartbeats shrink it as well. After
//! a failure the interval stays put until a heartbeat succeeds again.

use std::time::Duration;

use crate::config::HeartbeatConfig;

#[derive(Debug, Clone)]
pub struct AdaptiveInterval {
    min: Duration,
    base: Duration,
    max: Duration,
    step: Duration,
    active_window: Duration,
    idle_window: Duration,
    current: Duration,
    /// Set by a failed heartbeat, cleared by a successful one.
    recovering: bool,
}

impl AdaptiveInterval {
    pub fn new(config: &HeartbeatConfig) -> Self {
        let min = config.min_interval;
        let max = config.max_interval.max(min);
        Self {
            min,
            base: config.base_interval.clamp(min, max),
            max,
            step: config.step,
            active_window: config.active_window,
            idle_window: config.idle_window,
            current: config.base_interval.clamp(min, max),
            recovering: false,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    /// Interval the idle time asks for.
    pub fn target_for(&self, idle: Duration) -> Duration {
        if idle < self.active_window {
            self.min
        } else if idle <= self.idle_window {
            self.base
        } else {
            self.max
        }
    }

    /// Move one step toward the idle target.
    ///
    /// `idle` is the time since the last activity, or since start when
    /// `activity_seen` is false. Without recorded activity the interval
    /// only grows.
    pub fn recompute(&mut self, idle: Duration, activity_seen: bool) -> Duration {
        if self.recovering {
            return self.current;
        }
        let target = self.target_for(idle);
        if self.current < target {
            self.current = (self.current + self.step).min(target);
        } else if activity_seen && idle < self.active_window && self.current > target {
            self.shrink();
        }
        self.current
    }

    pub fn record_success(&mut self) -> Duration {
        self.recovering = false;
        self.current = (self.current + self.step).min(self.max);
        self.current
    }

    pub fn record_failure(&mut self) -> Duration {
        self.recovering = true;
        self.shrink();
        self.current
    }

    /// A high-priority send happened.
    pub fn record_activity(&mut self) -> Duration {
        self.shrink();
        self.current
    }

    fn shrink(&mut self) {
        self.current = self.current.saturating_sub(self.step).max(self.min);
    }
}
