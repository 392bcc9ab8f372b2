//! Runtime-wide tunables and environment wiring (spec §0 ambient stack,
//! §6 "Environment").
//!
//! Each crate that needs its own knobs (`ClientConfig`, `PublisherConfig`,
//! …) still owns its `Default`; `RuntimeConfig` is the one place that
//! collects the handful of values the spec pins literal defaults for
//! (`maxResolveDepth`, the one-minute publisher refresh, the one-minute
//! backoff cap) and the environment variables a process reads at
//! startup, so a binary only has to build one struct instead of plumbing
//! `std::env::var` calls through every constructor.

use std::env;
use std::time::Duration;

/// Where a process finds its principal's keys and blessing store, or an
/// agent hosting them, plus the namespace roots it starts resolution from
/// (spec §6 `V23_CREDENTIALS`, `V23_AGENT_ENDPOINT`, `V23_NAMESPACE*`).
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// `V23_CREDENTIALS`: directory holding the principal's keys and
    /// blessing store.
    pub credentials_dir: Option<String>,
    /// `V23_AGENT_ENDPOINT`: alternative to `credentials_dir`, a local
    /// principal-hosting agent's endpoint.
    pub agent_endpoint: Option<String>,
    /// Every `V23_NAMESPACE*` value, in the order `std::env::vars`
    /// returns them. Order matters: `carrier-ns` tries roots in order
    /// when resolving a name.
    pub namespace_roots: Vec<String>,
    /// spec §4.7 `maxResolveDepth`.
    pub max_resolve_depth: usize,
    /// spec §4.6 "every refresh interval (minute by default)".
    pub publisher_refresh_interval: Duration,
    /// spec §7 "exponential backoff capped at one minute".
    pub retry_backoff_max: Duration,
}

const DEFAULT_MAX_RESOLVE_DEPTH: usize = 32;

impl RuntimeConfig {
    /// Builds a config from defaults with no environment applied, for
    /// tests and for binaries that take these values from `clap` flags
    /// instead.
    pub fn defaults() -> Self {
        RuntimeConfig {
            credentials_dir: None,
            agent_endpoint: None,
            namespace_roots: Vec::new(),
            max_resolve_depth: DEFAULT_MAX_RESOLVE_DEPTH,
            publisher_refresh_interval: Duration::from_secs(60),
            retry_backoff_max: Duration::from_secs(60),
        }
    }

    /// Reads `V23_CREDENTIALS`, `V23_AGENT_ENDPOINT`, and every
    /// `V23_NAMESPACE*` variable from the process environment, layered
    /// over [`RuntimeConfig::defaults`].
    pub fn from_env() -> Self {
        let mut config = Self::defaults();
        config.credentials_dir = env::var("V23_CREDENTIALS").ok();
        config.agent_endpoint = env::var("V23_AGENT_ENDPOINT").ok();

        let mut roots: Vec<(String, String)> = env::vars()
            .filter(|(key, _)| key.starts_with("V23_NAMESPACE"))
            .collect();
        roots.sort_by(|a, b| a.0.cmp(&b.0));
        config.namespace_roots = roots.into_iter().map(|(_, value)| value).collect();

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_spec_literal_values() {
        let config = RuntimeConfig::defaults();
        assert_eq!(config.max_resolve_depth, DEFAULT_MAX_RESOLVE_DEPTH);
        assert_eq!(config.publisher_refresh_interval, Duration::from_secs(60));
        assert_eq!(config.retry_backoff_max, Duration::from_secs(60));
        assert!(config.namespace_roots.is_empty());
    }

    #[test]
    fn from_env_collects_namespace_roots_in_sorted_key_order() {
        // SAFETY: this test mutates process environment variables that no
        // other test in this crate reads or writes, and each call sets or
        // removes exactly the keys it touches before returning.
        unsafe {
            env::set_var("V23_NAMESPACE_ROOT", "/ns/root");
            env::set_var("V23_NAMESPACE2", "/ns/secondary");
            env::set_var("V23_CREDENTIALS", "/tmp/creds");
        }

        let config = RuntimeConfig::from_env();

        unsafe {
            env::remove_var("V23_NAMESPACE_ROOT");
            env::remove_var("V23_NAMESPACE2");
            env::remove_var("V23_CREDENTIALS");
        }

        assert_eq!(config.credentials_dir.as_deref(), Some("/tmp/creds"));
        assert_eq!(config.namespace_roots.len(), 2);
    }
}
