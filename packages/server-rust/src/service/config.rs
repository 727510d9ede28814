/// Server-level configuration for the dispatch pipeline.
///
/// Controls call timeouts and the concurrency limit enforced before handlers run.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Unique identifier for this server node.
    pub node_id: String,
    /// Timeout for handler execution when the entry sets none, in milliseconds.
    pub default_call_timeout_ms: u64,
    /// Maximum number of concurrent handler executions before load shedding.
    pub max_concurrent_calls: u32,
    /// Address this node reports as the caller address on outbound calls.
    pub advertised_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            default_call_timeout_ms: 30_000,
            max_concurrent_calls: 1000,
            advertised_address: "127.0.0.1".to_string(),
        }
    }
}

impl ServerConfig {
    /// Effective timeout for an entry whose governance may override the default.
    #[must_use]
    pub fn timeout_for(&self, entry_timeout_ms: Option<u64>) -> u64 {
        entry_timeout_ms
            .filter(|ms| *ms > 0)
            .unwrap_or(self.default_call_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_timeout_overrides_default() {
        let config = ServerConfig::default();
        assert_eq!(config.timeout_for(None), 30_000);
        assert_eq!(config.timeout_for(Some(0)), 30_000);
        assert_eq!(config.timeout_for(Some(250)), 250);
    }
}
