//! Subscriber configuration for the durable streaming backend.
//!
//! The clustered streaming log itself lives outside this crate; it persists
//! one subject per aggregate and replays from a stored sequence on
//! reconnect. The engine only recognizes the environment variables its
//! subscriber needs.

use ulid::Ulid;

/// Environment variable naming the stream cluster.
pub const ENV_CLUSTER: &str = "WEFT_STREAM_CLUSTER";
/// Environment variable naming this client; auto-generated when unset.
pub const ENV_CLIENT_ID: &str = "WEFT_STREAM_CLIENT_ID";
/// Environment variable toggling automatic reconnection.
pub const ENV_AUTO_RECONNECT: &str = "WEFT_STREAM_AUTO_RECONNECT";

/// Connection settings for the durable streaming backend's subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// The cluster to join.
    pub cluster: String,
    /// The client identity within the cluster.
    pub client_id: String,
    /// Whether the subscriber reconnects and replays automatically.
    pub auto_reconnect: bool,
}

impl StreamConfig {
    /// Reads the configuration from the environment.
    ///
    /// `WEFT_STREAM_CLIENT_ID` is auto-generated when unset so that every
    /// engine instance gets a distinct durable subscription.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            cluster: std::env::var(ENV_CLUSTER).unwrap_or_else(|_| "weft-cluster".to_string()),
            client_id: std::env::var(ENV_CLIENT_ID)
                .unwrap_or_else(|_| format!("weft-{}", Ulid::new())),
            auto_reconnect: std::env::var(ENV_AUTO_RECONNECT)
                .map_or(true, |v| v != "false" && v != "0"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_env_is_unset() {
        // Runs without touching the process environment: variables unset in
        // the test runner fall back to defaults.
        let config = StreamConfig::from_env();
        assert!(!config.cluster.is_empty());
        assert!(config.client_id.starts_with("weft-") || !config.client_id.is_empty());
    }

    #[test]
    fn generated_client_ids_are_unique() {
        let a = StreamConfig::from_env();
        let b = StreamConfig::from_env();
        if std::env::var(ENV_CLIENT_ID).is_err() {
            assert_ne!(a.client_id, b.client_id);
        }
    }
}
