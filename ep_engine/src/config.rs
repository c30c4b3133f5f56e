use std::time::Duration;

use serde::Deserialize;

/// The configuration keys this engine consumes. Loaded by the host from a
/// JSON (or TOML) file via `serde`, or constructed directly; this crate does
/// not parse CLI flags or environment variables itself.
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Root directory holding this shard's partition files.
    pub dbname: String,
    pub couch_host: String,
    pub couch_port: u16,
    pub couch_bucket: String,
    /// Milliseconds a notifier request may stay unacknowledged before the
    /// connection is reset.
    pub couch_response_timeout_ms: u64,
    /// Milliseconds to wait between reconnect attempts.
    pub couch_reconnect_sleeptime_ms: u64,
    #[serde(default)]
    pub allow_data_loss_during_shutdown: bool,
}

impl Configuration {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.couch_response_timeout_ms)
    }

    pub fn reconnect_sleeptime(&self) -> Duration {
        Duration::from_millis(self.couch_reconnect_sleeptime_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_from_json() {
        let json = r#"{
            "dbname": "/tmp/shard0",
            "couch_host": "127.0.0.1",
            "couch_port": 11213,
            "couch_bucket": "default",
            "couch_response_timeout_ms": 5000,
            "couch_reconnect_sleeptime_ms": 250
        }"#;
        let config: Configuration = serde_json::from_str(json).unwrap();
        assert_eq!(config.couch_port, 11213);
        assert!(!config.allow_data_loss_during_shutdown);
        assert_eq!(config.response_timeout(), Duration::from_secs(5));
    }
}
