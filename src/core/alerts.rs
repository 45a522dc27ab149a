use crate::common::config::AlertConfig;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub denials: usize,
    pub window: Duration,
    pub last_label: Option<i64>,
    pub raised_at: DateTime<Utc>,
}

/// Receives repeated-denial alerts.
pub trait Notifier: Send + Sync {
    fn notify(&self, alert: &Alert);
}

/// Default notifier: a `warn` line in the service log.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, alert: &Alert) {
        tracing::warn!(
            denials = alert.denials,
            window_secs = alert.window.as_secs(),
            last_label = ?alert.last_label,
            "Repeated access denials"
        );
    }
}

/// Sliding window of face-present denials.
pub struct DenialTracker {
    threshold: usize,
    window: Duration,
    denials: VecDeque<Instant>,
}

impl DenialTracker {
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            denials: VecDeque::new(),
        }
    }

    pub fn from_config(config: &AlertConfig) -> Self {
        Self::new(
            config.consecutive_denials as usize,
            Duration::from_secs(config.window_seconds),
        )
    }

    pub fn record_denial(&mut self, label: Option<i64>) -> Option<Alert> {
        self.record_denial_at(Instant::now(), label)
    }

    /// Returns an alert once the window holds `threshold` denials, then starts over
    /// so a sustained attempt alerts once per burst.
    pub fn record_denial_at(&mut self, now: Instant, label: Option<i64>) -> Option<Alert> {
        while let Some(&oldest) = self.denials.front() {
            if now.duration_since(oldest) > self.window {
                self.denials.pop_front();
            } else {
                break;
            }
        }
        self.denials.push_back(now);

        if self.denials.len() < self.threshold {
            return None;
        }
        let denials = self.denials.len();
        self.denials.clear();
        Some(Alert {
            denials,
            window: self.window,
            last_label: label,
            raised_at: Utc::now(),
        })
    }

    pub fn reset(&mut self) {
        self.denials.clear();
    }

    pub fn pending(&self) -> usize {
        self.denials.len()
    }
}
