use loopgate_internal::wire::DEFAULT_PORT;
use std::time::Duration;

/// Server tunables.
///
/// The defaults match what the browser-side polling script expects; only the port is
/// normally changed, and it must be changed on both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Loopback port to listen on.
    pub port: u16,
    /// How long a new connection may take to send its first bytes and, for WebSockets,
    /// its complete upgrade request.
    pub handshake_timeout: Duration,
    /// Largest accepted HTTP upgrade request, in bytes.
    pub max_header_size: usize,
    /// Largest accepted WebSocket message or binary request, in bytes.
    pub max_message_size: usize,
    /// The server stops after this long without connections or pending jobs.
    pub idle_timeout: Duration,
    /// How often the idle supervisor looks at the server.
    pub idle_poll_interval: Duration,
    /// Sleep between polls of the non-blocking accept loop.
    pub accept_backoff: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            handshake_timeout: Duration::from_secs(3),
            max_header_size: 16 * 1024,
            max_message_size: 16 * 1024 * 1024,
            idle_timeout: Duration::from_secs(10),
            idle_poll_interval: Duration::from_secs(1),
            accept_backoff: Duration::from_millis(10),
        }
    }
}

pub const PORT_VAR: &str = "LOOPGATE_PORT";
pub const IDLE_SECS_VAR: &str = "LOOPGATE_IDLE_SECS";
pub const HANDSHAKE_MS_VAR: &str = "LOOPGATE_HANDSHAKE_MS";
/// Names the command definitions file. Read by the handler, not by [`ServerConfig`].
pub const COMMANDS_VAR: &str = "LOOPGATE_COMMANDS";

impl ServerConfig {
    /// Defaults, overridden from the process environment.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`. Values that fail to parse are logged and ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = parse_var::<u16, _>(&lookup, PORT_VAR) {
            self.port = port;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, IDLE_SECS_VAR) {
            self.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, HANDSHAKE_MS_VAR) {
            self.handshake_timeout = Duration::from_millis(ms);
        }
        self
    }
}

fn parse_var<T: std::str::FromStr, F: Fn(&str) -> Option<String>>(lookup: &F, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            logwise::warn_sync!(
                "Ignoring {key}: cannot parse {raw}",
                key = key,
                raw = raw.as_str()
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn overrides_apply_and_bad_values_are_ignored() {
        let vars: HashMap<&str, &str> = [(PORT_VAR, " 4000 "), (IDLE_SECS_VAR, "soon")]
            .into_iter()
            .collect();
        let config = ServerConfig::default().with_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.port, 4000);
        assert_eq!(config.idle_timeout, Duration::from_secs(10));
        assert_eq!(config.handshake_timeout, Duration::from_secs(3));
    }

    #[test]
    fn default_port_is_shared_constant() {
        assert_eq!(ServerConfig::default().port, 18245);
    }
}
