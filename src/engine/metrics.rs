use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    runs_started_total: AtomicU64,
    runs_completed_total: AtomicU64,
    runs_timed_out_total: AtomicU64,
    runs_spawn_failed_total: AtomicU64,
    submissions_total: AtomicU64,
    packaging_failed_total: AtomicU64,
    sessions_opened_total: AtomicU64,
    sessions_closed_total: AtomicU64,
    sessions_expired_total: AtomicU64,
    sessions_active: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_started(&self) {
        self.runs_started_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn run_completed(&self) {
        self.runs_completed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn run_timed_out(&self) {
        self.runs_timed_out_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn run_spawn_failed(&self) {
        self.runs_spawn_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn submission_recorded(&self) {
        self.submissions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packaging_failed(&self) {
        self.packaging_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_opened(&self) {
        self.sessions_opened_total.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.sessions_closed_total.fetch_add(1, Ordering::Relaxed);
        self.decrement_active_sessions();
    }

    pub fn session_expired(&self) {
        self.sessions_expired_total.fetch_add(1, Ordering::Relaxed);
        self.decrement_active_sessions();
    }

    pub fn render_prometheus(&self) -> String {
        format!(
            concat!(
                "# TYPE grader_runs_started_total counter\n",
                "grader_runs_started_total {}\n",
                "# TYPE grader_runs_completed_total counter\n",
                "grader_runs_completed_total {}\n",
                "# TYPE grader_runs_timed_out_total counter\n",
                "grader_runs_timed_out_total {}\n",
                "# TYPE grader_runs_spawn_failed_total counter\n",
                "grader_runs_spawn_failed_total {}\n",
                "# TYPE grader_submissions_total counter\n",
                "grader_submissions_total {}\n",
                "# TYPE grader_packaging_failed_total counter\n",
                "grader_packaging_failed_total {}\n",
                "# TYPE grader_sessions_opened_total counter\n",
                "grader_sessions_opened_total {}\n",
                "# TYPE grader_sessions_closed_total counter\n",
                "grader_sessions_closed_total {}\n",
                "# TYPE grader_sessions_expired_total counter\n",
                "grader_sessions_expired_total {}\n",
                "# TYPE grader_sessions_active gauge\n",
                "grader_sessions_active {}\n"
            ),
            self.runs_started_total.load(Ordering::Relaxed),
            self.runs_completed_total.load(Ordering::Relaxed),
            self.runs_timed_out_total.load(Ordering::Relaxed),
            self.runs_spawn_failed_total.load(Ordering::Relaxed),
            self.submissions_total.load(Ordering::Relaxed),
            self.packaging_failed_total.load(Ordering::Relaxed),
            self.sessions_opened_total.load(Ordering::Relaxed),
            self.sessions_closed_total.load(Ordering::Relaxed),
            self.sessions_expired_total.load(Ordering::Relaxed),
            self.sessions_active.load(Ordering::Relaxed),
        )
    }

    fn decrement_active_sessions(&self) {
        let mut current = self.sessions_active.load(Ordering::Relaxed);
        while current > 0 {
            match self.sessions_active.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn active_sessions_do_not_underflow() {
        let metrics = MetricsRegistry::new();
        metrics.session_closed();
        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("grader_sessions_active 0"));
        assert!(rendered.contains("grader_sessions_closed_total 1"));
    }

    #[test]
    fn tracks_session_lifecycle() {
        let metrics = MetricsRegistry::new();
        metrics.session_opened();
        metrics.session_opened();
        metrics.session_expired();
        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("grader_sessions_active 1"));
        assert!(rendered.contains("grader_sessions_expired_total 1"));
    }
}
