use relaycore::RelayError;
use std::time::Duration;

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub event_buffer_size: usize,
    /// Default bound for one node call; `None` waits indefinitely
    pub node_timeout: Option<Duration>,
    /// State records untouched for this long are reaped
    pub stale_after: Duration,
    /// Checkpoints older than this are evicted once their run is no longer active
    pub checkpoint_ttl: Duration,
    pub reaper_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1000,
            node_timeout: None,
            stale_after: Duration::from_secs(6 * 60 * 60),
            checkpoint_ttl: Duration::from_secs(24 * 60 * 60),
            reaper_interval: Duration::from_secs(60),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `RELAY_*` environment variables.
    pub fn from_env() -> Result<Self, RelayError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, RelayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(size) = parse_var::<usize, _>(&lookup, "RELAY_EVENT_BUFFER")? {
            config.event_buffer_size = size;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "RELAY_NODE_TIMEOUT_SECS")? {
            config.node_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "RELAY_STALE_AFTER_SECS")? {
            config.stale_after = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "RELAY_CHECKPOINT_TTL_SECS")? {
            config.checkpoint_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "RELAY_REAPER_INTERVAL_SECS")? {
            if secs == 0 {
                return Err(RelayError::Config(
                    "RELAY_REAPER_INTERVAL_SECS must be positive".to_string(),
                ));
            }
            config.reaper_interval = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, RelayError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| RelayError::Config(format!("{}={:?}: {}", key, raw, e))),
    }
}
