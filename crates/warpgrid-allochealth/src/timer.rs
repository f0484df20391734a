//! One-shot timer with explicit arm/disarm.

use std::time::Duration;

use tokio::time::Instant;

/// Fires once, `after` the last [`arm`](HealthyTimer::arm).
///
/// The timer only stores a deadline; [`fired`](HealthyTimer::fired) builds
/// a fresh sleep on each poll. After `disarm` there is no pending sleep
/// left that could fire late, and re-arming simply replaces the deadline.
#[derive(Debug, Default)]
pub struct HealthyTimer {
    deadline: Option<Instant>,
}

impl HealthyTimer {
    /// A disarmed timer.
    pub fn new() -> Self {
        Self { deadline: None }
    }

    pub fn arm(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves when the armed deadline passes, disarming the timer.
    /// Never resolves while disarmed. Cancel-safe.
    pub async fn fired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                tokio::time::sleep_until(deadline).await;
                self.deadline = None;
            }
            None => std::future::pending().await,
        }
    }
}
