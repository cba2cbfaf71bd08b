use std::{path::PathBuf, time::Duration};

use crate::{
    buffer::{BufferLimits, OverflowPolicy},
    creds::Credentials,
    error::{Error, Result},
};

/// Server used when none are configured.
pub const DEFAULT_SERVER: &str = "nats://127.0.0.1:4222";
/// Default reconnect buffer size in bytes.
pub const DEFAULT_RECONNECT_BUFFER_BYTES: usize = 8 * 1024 * 1024;
/// Default number of reconnect attempts before giving up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: usize = 60;
/// Base delay between connect attempts.
pub const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(2);
/// Upper bound for reconnect backoff.
pub const DEFAULT_MAX_RECONNECT_WAIT: Duration = Duration::from_secs(30);
/// Default connection timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default keepalive interval.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);
/// Unanswered keepalive pings tolerated before the link is considered dead.
pub const DEFAULT_MAX_PINGS_OUT: usize = 2;
/// Default request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);

/// Everything needed to establish and maintain a [`Connection`].
///
/// `no_echo` and the credentials are fixed for the lifetime of the connection.
///
/// [`Connection`]: super::Connection
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// tried in order on connect and on every reconnect round
    pub servers: Vec<String>,
    /// reported to the server in the connect frame
    pub name: Option<String>,
    /// ask the server not to deliver our own publishes back to us
    pub no_echo: bool,
    /// path to a `.creds` bundle, loaded once before the first connect
    pub credentials_path: Option<PathBuf>,
    /// already loaded credentials, used when no path is set
    pub credentials: Option<Credentials>,
    /// byte limit of the reconnect buffer, `None` for unbounded
    pub reconnect_buffer_bytes: Option<usize>,
    /// entry limit of the reconnect buffer, `None` for unbounded
    pub reconnect_buffer_entries: Option<usize>,
    pub overflow_policy: OverflowPolicy,
    /// `None` keeps reconnecting until closed
    pub max_reconnect_attempts: Option<usize>,
    pub reconnect_wait: Duration,
    pub max_reconnect_wait: Duration,
    pub connect_timeout: Duration,
    /// extra rounds over the server list on the initial connect
    pub connect_retry_max: u32,
    pub ping_interval: Duration,
    pub max_pings_out: usize,
    pub request_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            servers: vec![DEFAULT_SERVER.to_owned()],
            name: None,
            no_echo: false,
            credentials_path: None,
            credentials: None,
            reconnect_buffer_bytes: Some(DEFAULT_RECONNECT_BUFFER_BYTES),
            reconnect_buffer_entries: None,
            overflow_policy: OverflowPolicy::RejectNewest,
            max_reconnect_attempts: Some(DEFAULT_MAX_RECONNECT_ATTEMPTS),
            reconnect_wait: DEFAULT_RECONNECT_WAIT,
            max_reconnect_wait: DEFAULT_MAX_RECONNECT_WAIT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connect_retry_max: 0,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_pings_out: DEFAULT_MAX_PINGS_OUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the server list.
    pub fn servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.servers = servers.into_iter().map(Into::into).collect();
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn no_echo(mut self) -> Self {
        self.no_echo = true;
        self
    }

    pub fn credentials_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials_path = Some(path.into());
        self
    }

    pub fn credentials(mut self, creds: Credentials) -> Self {
        self.credentials = Some(creds);
        self
    }

    pub fn reconnect_buffer_bytes(mut self, bytes: Option<usize>) -> Self {
        self.reconnect_buffer_bytes = bytes;
        self
    }

    pub fn reconnect_buffer_entries(mut self, entries: Option<usize>) -> Self {
        self.reconnect_buffer_entries = entries;
        self
    }

    pub fn overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: Option<usize>) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set base and cap of the reconnect backoff.
    pub fn reconnect_wait(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_wait = base;
        self.max_reconnect_wait = max;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn connect_retry_max(mut self, retries: u32) -> Self {
        self.connect_retry_max = retries;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn max_pings_out(mut self, max: usize) -> Self {
        self.max_pings_out = max;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn buffer_limits(&self) -> BufferLimits {
        BufferLimits {
            max_bytes: self.reconnect_buffer_bytes,
            max_entries: self.reconnect_buffer_entries,
            overflow: self.overflow_policy,
        }
    }

    /// Delay before reconnect round `attempt` (0 based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.reconnect_wait
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_reconnect_wait)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::Config("at least one server is required".into()));
        }
        if let Some(server) = self.servers.iter().find(|s| s.trim().is_empty()) {
            return Err(Error::Config(format!("invalid server address '{server}'")));
        }
        if self.ping_interval.is_zero() {
            return Err(Error::Config("ping_interval must be greater than zero".into()));
        }
        if self.max_reconnect_wait < self.reconnect_wait {
            return Err(Error::Config(
                "max_reconnect_wait must not be smaller than reconnect_wait".into(),
            ));
        }
        Ok(())
    }

    /// Credentials to present, loading the bundle file if one is configured.
    pub(crate) fn load_credentials(&self) -> Result<Option<Credentials>> {
        match &self.credentials_path {
            Some(path) => Credentials::load(path).map(Some),
            None => Ok(self.credentials.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_capped() {
        let opts = ConnectOptions::new()
            .reconnect_wait(Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(opts.backoff(0), Duration::from_millis(100));
        assert_eq!(opts.backoff(1), Duration::from_millis(200));
        assert_eq!(opts.backoff(3), Duration::from_millis(800));
        assert_eq!(opts.backoff(4), Duration::from_millis(1000));
        assert_eq!(opts.backoff(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_validate() {
        assert!(ConnectOptions::new().validate().is_ok());
        let empty: Vec<String> = Vec::new();
        assert!(matches!(
            ConnectOptions::new().servers(empty).validate(),
            Err(Error::Config(_))
        ));
        assert!(ConnectOptions::new().servers([" "]).validate().is_err());
        assert!(ConnectOptions::new()
            .reconnect_wait(Duration::from_secs(5), Duration::from_secs(1))
            .validate()
            .is_err());
    }

    #[test]
    fn test_buffer_limits() {
        let limits = ConnectOptions::new()
            .reconnect_buffer_bytes(None)
            .reconnect_buffer_entries(Some(2))
            .overflow_policy(OverflowPolicy::DropOldest)
            .buffer_limits();
        assert_eq!(limits.max_bytes, None);
        assert_eq!(limits.max_entries, Some(2));
        assert_eq!(limits.overflow, OverflowPolicy::DropOldest);
    }

    #[test]
    fn test_missing_credentials_file_is_parse_error() {
        let opts = ConnectOptions::new().credentials_file("/nonexistent/user.creds");
        assert!(matches!(opts.load_credentials(), Err(Error::Parse(_))));
    }
}
