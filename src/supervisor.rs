use crate::config::ServerConfig;
use crate::jobs::JobRegistry;
use crate::listener::Listener;
use std::time::{Duration, Instant};

/// Shuts the server down once it has been idle for long enough.
///
/// The server counts as busy while it has a live connection or a pending job. Each poll
/// of a busy server moves the last activity forward; the first poll that finds the
/// server idle for `idle_timeout` stops the listener and closes what is left.
#[derive(Debug)]
pub struct Supervisor {
    idle_timeout: Duration,
    poll_interval: Duration,
    last_activity: Instant,
}

impl Supervisor {
    pub fn new(config: &ServerConfig) -> Self {
        Supervisor {
            idle_timeout: config.idle_timeout,
            poll_interval: config.idle_poll_interval,
            last_activity: Instant::now(),
        }
    }

    /// Blocks until the server has been idle for the timeout, or the listener stops.
    pub fn run(mut self, listener: &Listener, registry: &JobRegistry) {
        while listener.is_running() {
            std::thread::sleep(self.poll_interval);
            let busy = listener.connection_count() > 0 || registry.count_pending() > 0;
            if self.observe(busy, Instant::now()) {
                logwise::info_sync!(
                    "Idle for {secs}s, shutting down",
                    secs = self.idle_timeout.as_secs()
                );
                break;
            }
        }
        listener.stop();
        listener.close_all();
    }

    /// Records one observation; returns whether the idle timeout has elapsed.
    fn observe(&mut self, busy: bool, now: Instant) -> bool {
        if busy {
            self.last_activity = now;
            return false;
        }
        now.duration_since(self.last_activity) >= self.idle_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Bridge;
    use loopgate_internal::request::CommandRequest;
    use std::sync::Arc;

    fn config(idle_ms: u64) -> ServerConfig {
        ServerConfig {
            port: 0,
            idle_timeout: Duration::from_millis(idle_ms),
            idle_poll_interval: Duration::from_millis(10),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn activity_postpones_the_deadline() {
        let mut supervisor = Supervisor::new(&config(100));
        let start = supervisor.last_activity;
        assert!(!supervisor.observe(false, start + Duration::from_millis(50)));
        assert!(!supervisor.observe(true, start + Duration::from_millis(90)));
        assert!(!supervisor.observe(false, start + Duration::from_millis(150)));
        assert!(supervisor.observe(false, start + Duration::from_millis(190)));
    }

    #[test]
    fn idle_server_stops_after_pending_jobs_finish() {
        let registry = Arc::new(JobRegistry::new());
        let listener = Listener::new(config(50), Arc::new(Bridge::new(registry.clone())));
        listener.start(0).unwrap();
        registry.submit(
            CommandRequest::new("delay", Some("d".to_string()))
                .with_parameter("steps", "1")
                .with_parameter("ms", "200"),
        );
        let started = Instant::now();
        Supervisor::new(&config(50)).run(&listener, &registry);
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(!listener.is_running());
        assert_eq!(registry.count_pending(), 0);
    }

    #[test]
    fn returns_when_the_listener_is_stopped() {
        let registry = JobRegistry::new();
        let listener = Listener::new(config(60_000), Arc::new(Bridge::new(Arc::new(JobRegistry::new()))));
        Supervisor::new(&config(60_000)).run(&listener, &registry);
        assert!(!listener.is_running());
    }
}
