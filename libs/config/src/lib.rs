use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use courier_core::connection::{ConnectOptions, options};
use tracing::debug;

pub mod wire;

/// client config, as loaded from a file
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientConfig {
    wire: wire::Config,
    path: Option<PathBuf>,
}

impl ClientConfig {
    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)
            .with_context(|| format!("failed to find config at {}", &path.display()))?;
        let mut config = Self::new(input)
            .with_context(|| format!("failed to parse config at {}", &path.display()))?;
        debug!(?config);
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn new<S: AsRef<str>>(input: S) -> Result<Self> {
        let input = input.as_ref();
        let wire = match serde_json::from_str(input) {
            Ok(wire) => wire,
            Err(_err) => serde_yaml::from_str(input)?,
        };
        Ok(Self { wire, path: None })
    }

    pub fn wire(&self) -> &wire::Config {
        &self.wire
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Build connect options. Unset fields keep the library defaults.
    /// A relative `credentials_path` is resolved against the config file's
    /// directory.
    pub fn connect_options(&self) -> Result<ConnectOptions> {
        let wire = self.wire.clone();
        let defaults = ConnectOptions::default();

        let servers = wire
            .servers
            .map(wire::MaybeList::into_vec)
            .unwrap_or(defaults.servers);
        if servers.is_empty() {
            bail!("servers must not be empty");
        }

        let credentials_path = wire.credentials_path.map(|p| match &self.path {
            Some(file) if p.is_relative() => file.parent().unwrap_or(Path::new(".")).join(p),
            _ => p,
        });

        let reconnect_buffer_bytes = match wire.reconnect_buffer_bytes {
            Some(limit) => limit.get().context("reconnect_buffer_bytes")?,
            None => Some(options::DEFAULT_RECONNECT_BUFFER_BYTES),
        };
        let reconnect_buffer_entries = match wire.reconnect_buffer_entries {
            Some(limit) => limit.get().context("reconnect_buffer_entries")?,
            None => None,
        };
        let max_reconnect_attempts = match wire.max_reconnect_attempts {
            Some(limit) => limit.get().context("max_reconnect_attempts")?,
            None => Some(options::DEFAULT_MAX_RECONNECT_ATTEMPTS),
        };

        let reconnect_wait = wire.reconnect_wait.unwrap_or(defaults.reconnect_wait);
        let max_reconnect_wait = wire
            .max_reconnect_wait
            .unwrap_or(defaults.max_reconnect_wait)
            .max(reconnect_wait);
        let ping_interval = wire.ping_interval.unwrap_or(defaults.ping_interval);
        if ping_interval.is_zero() {
            bail!("ping_interval must be greater than zero");
        }

        Ok(ConnectOptions {
            servers,
            name: wire.name,
            no_echo: wire.no_echo,
            credentials_path,
            credentials: None,
            reconnect_buffer_bytes,
            reconnect_buffer_entries,
            overflow_policy: wire.overflow_policy,
            max_reconnect_attempts,
            reconnect_wait,
            max_reconnect_wait,
            connect_timeout: wire.connect_timeout.unwrap_or(defaults.connect_timeout),
            connect_retry_max: wire.connect_retry_max.unwrap_or(defaults.connect_retry_max),
            ping_interval,
            max_pings_out: wire.max_pings_out.unwrap_or(defaults.max_pings_out),
            request_timeout: wire.request_timeout.unwrap_or(defaults.request_timeout),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courier_core::buffer::OverflowPolicy;

    use super::*;

    pub static SAMPLE: &str = include_str!("../../../sample.yaml");

    #[test]
    fn test_sample() {
        let cfg = ClientConfig::new(SAMPLE).unwrap();
        let opts = cfg.connect_options().unwrap();
        assert_eq!(opts.servers.len(), 2);
        assert!(opts.no_echo);
        assert_eq!(opts.reconnect_buffer_entries, Some(1000));
        assert_eq!(opts.overflow_policy, OverflowPolicy::RejectNewest);
        assert_eq!(opts.reconnect_wait, Duration::from_millis(500));
    }

    #[test]
    fn test_defaults_when_empty() {
        let opts = ClientConfig::new("{}").unwrap().connect_options().unwrap();
        let defaults = ConnectOptions::default();
        assert_eq!(opts.servers, defaults.servers);
        assert_eq!(opts.reconnect_buffer_bytes, defaults.reconnect_buffer_bytes);
        assert_eq!(opts.max_reconnect_attempts, defaults.max_reconnect_attempts);
        assert_eq!(opts.ping_interval, defaults.ping_interval);
        assert!(!opts.no_echo);
    }

    #[test]
    fn test_json_config() {
        let cfg = ClientConfig::new(
            r#"{
                "servers": ["nats://a:4222"],
                "reconnect_buffer_bytes": "unbounded",
                "overflow_policy": "drop_oldest",
                "max_reconnect_attempts": 5,
                "request_timeout": "3s"
            }"#,
        )
        .unwrap();
        let opts = cfg.connect_options().unwrap();
        assert_eq!(opts.reconnect_buffer_bytes, None);
        assert_eq!(opts.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(opts.max_reconnect_attempts, Some(5));
        assert_eq!(opts.request_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_relative_credentials_path() {
        let mut cfg = ClientConfig::new("credentials_path: user.creds").unwrap();
        cfg.path = Some(PathBuf::from("/etc/courier/client.yaml"));
        let opts = cfg.connect_options().unwrap();
        assert_eq!(
            opts.credentials_path,
            Some(PathBuf::from("/etc/courier/user.creds"))
        );
    }

    #[test]
    fn test_rejects_empty_server_list() {
        let cfg = ClientConfig::new("servers: []").unwrap();
        assert!(cfg.connect_options().is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(ClientConfig::parse("/nonexistent/courier.yaml").is_err());
    }
}
