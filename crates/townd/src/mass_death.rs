//! Mass-death detector: a sliding window of recent agent deaths. Three or
//! more deaths inside the window fires a single `mass_death` event and
//! clears the window, so the same cluster of deaths doesn't re-alert every
//! tick.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use town_core::config::TimingConfig;
use town_core::event_log::{self, DaemonEvent, EventLogConfig};

/// In-memory ring of recent death timestamps, keyed by session name.
#[derive(Debug, Default)]
pub struct MassDeathDetector {
    recent: VecDeque<(Instant, String)>,
}

impl MassDeathDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a death and, if the window now holds `threshold` or more
    /// entries, emit a `mass_death` event and clear the window.
    ///
    /// Returns the sessions that triggered the alert, if any.
    pub fn record_death(
        &mut self,
        session: &str,
        timing: &TimingConfig,
        event_log_cfg: &EventLogConfig,
    ) -> Option<Vec<String>> {
        let now = Instant::now();
        let window = Duration::from_secs(timing.mass_death_window_secs);
        self.recent.push_back((now, session.to_string()));
        self.recent.retain(|(t, _)| now.duration_since(*t) <= window);

        if self.recent.len() < timing.mass_death_threshold as usize {
            return None;
        }

        let sessions: Vec<String> = self.recent.iter().map(|(_, s)| s.clone()).collect();
        let event = DaemonEvent::new("mass_death")
            .with_field("count", sessions.len() as u64)
            .with_field("sessions", sessions.clone());
        event_log::emit(event_log_cfg, event);
        self.recent.clear();
        Some(sessions)
    }
}
