//! Session configuration.
//!
//! DESIGN
//! ======
//! `SessionConfig` is a plain struct: build it in code with `new` and the
//! `with_*` builders, or read it from `CONNECTOR_*` environment variables with
//! `from_env`. Either way `Session::new` runs `validate` before anything
//! touches the network.
//!
//! `from_env` is a thin wrapper over `from_lookup`, which takes any key lookup
//! function, so parsing is testable without mutating the process environment.
//!
//! Credential source precedence: `CONNECTOR_TOKEN_URL` (with optional basic
//! auth from username/password), then `CONNECTOR_TOKEN`, then
//! `CONNECTOR_PASSWORD` (with optional `CONNECTOR_USERNAME`).

use std::time::Duration;

use crate::backoff::{
    DEFAULT_RECONNECT_BASE_MS, DEFAULT_RECONNECT_JITTER, DEFAULT_RECONNECT_MAX_ATTEMPTS, DEFAULT_RECONNECT_MAX_MS,
    ReconnectPolicy,
};
use crate::credentials::{CredentialSource, TokenEndpoint};
use crate::message::Command;

pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1_000;

pub const ENV_SERVER_URL: &str = "CONNECTOR_SERVER_URL";
pub const ENV_TOKEN: &str = "CONNECTOR_TOKEN";
pub const ENV_USERNAME: &str = "CONNECTOR_USERNAME";
pub const ENV_PASSWORD: &str = "CONNECTOR_PASSWORD";
pub const ENV_TOKEN_URL: &str = "CONNECTOR_TOKEN_URL";

/// Error returned when configuration is missing or inconsistent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("missing required config: {var}")]
    Missing { var: String },
    /// A variable is set but cannot be parsed.
    #[error("invalid value for {var}: {value}")]
    Invalid { var: String, value: String },
    /// Values parse but contradict each other.
    #[error("invalid policy: {0}")]
    Policy(String),
}

impl ConfigError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Missing { .. } => "E_CONFIG_MISSING",
            Self::Invalid { .. } => "E_CONFIG_INVALID",
            Self::Policy(_) => "E_CONFIG_POLICY",
        }
    }

    #[must_use]
    pub fn retryable(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Base address of the remote service (URL or `host:port`).
    pub server_url: String,
    pub credentials: CredentialSource,
    pub reconnect: ReconnectPolicy,
    /// Deadline for one command's correlated response.
    pub command_timeout: Duration,
    /// Deadline for the authentication exchange after the transport opens.
    pub handshake_timeout: Duration,
    /// Period of the background correlation sweep.
    pub sweep_interval: Duration,
    /// Bulk-refresh command issued after every successful authentication.
    pub refresh_on_ready: Option<Command>,
    /// Application-level ping that detects half-open connections.
    pub keepalive: Option<Keepalive>,
}

/// Periodic command whose timeout marks the connection as dead.
#[derive(Debug, Clone, PartialEq)]
pub struct Keepalive {
    pub interval: Duration,
    pub command: Command,
}

impl SessionConfig {
    #[must_use]
    pub fn new(server_url: impl Into<String>, credentials: CredentialSource) -> Self {
        Self {
            server_url: server_url.into(),
            credentials,
            reconnect: ReconnectPolicy::default(),
            command_timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
            refresh_on_ready: None,
            keepalive: None,
        }
    }

    /// Build config from `CONNECTOR_*` environment variables.
    ///
    /// Required:
    /// - `CONNECTOR_SERVER_URL`
    /// - one of `CONNECTOR_TOKEN_URL`, `CONNECTOR_TOKEN`, `CONNECTOR_PASSWORD`
    ///
    /// Optional (defaults in parentheses):
    /// - `CONNECTOR_USERNAME`
    /// - `CONNECTOR_RECONNECT_BASE_MS` (2000), `CONNECTOR_RECONNECT_MAX_MS` (60000)
    /// - `CONNECTOR_RECONNECT_MAX_ATTEMPTS` (10), `CONNECTOR_RECONNECT_JITTER` (0.2)
    /// - `CONNECTOR_COMMAND_TIMEOUT_MS` (10000), `CONNECTOR_HANDSHAKE_TIMEOUT_MS` (10000)
    /// - `CONNECTOR_SWEEP_INTERVAL_MS` (1000)
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for missing, unparsable, or inconsistent values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`SessionConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());

        let server_url = get(ENV_SERVER_URL).ok_or_else(|| ConfigError::Missing { var: ENV_SERVER_URL.into() })?;
        let credentials = credential_source(&get)?;

        let reconnect = ReconnectPolicy {
            base_delay: Duration::from_millis(env_parse(&get, "CONNECTOR_RECONNECT_BASE_MS", DEFAULT_RECONNECT_BASE_MS)?),
            max_delay: Duration::from_millis(env_parse(&get, "CONNECTOR_RECONNECT_MAX_MS", DEFAULT_RECONNECT_MAX_MS)?),
            max_attempts: env_parse(&get, "CONNECTOR_RECONNECT_MAX_ATTEMPTS", DEFAULT_RECONNECT_MAX_ATTEMPTS)?,
            jitter: env_parse(&get, "CONNECTOR_RECONNECT_JITTER", DEFAULT_RECONNECT_JITTER)?,
        };

        let config = Self {
            server_url,
            credentials,
            reconnect,
            command_timeout: Duration::from_millis(env_parse(&get, "CONNECTOR_COMMAND_TIMEOUT_MS", DEFAULT_COMMAND_TIMEOUT_MS)?),
            handshake_timeout: Duration::from_millis(env_parse(
                &get,
                "CONNECTOR_HANDSHAKE_TIMEOUT_MS",
                DEFAULT_HANDSHAKE_TIMEOUT_MS,
            )?),
            sweep_interval: Duration::from_millis(env_parse(&get, "CONNECTOR_SWEEP_INTERVAL_MS", DEFAULT_SWEEP_INTERVAL_MS)?),
            refresh_on_ready: None,
            keepalive: None,
        };
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    #[must_use]
    pub fn with_refresh_on_ready(mut self, command: Command) -> Self {
        self.refresh_on_ready = Some(command);
        self
    }

    /// Send `command` every `interval` while `Ready`. A ping that gets no
    /// answer within `command_timeout` drops the connection into reconnect.
    #[must_use]
    pub fn with_keepalive(mut self, interval: Duration, command: Command) -> Self {
        self.keepalive = Some(Keepalive { interval, command });
        self
    }

    /// Reject policies the session cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Policy`] naming the first inconsistency found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_url.trim().is_empty() {
            return Err(ConfigError::Missing { var: ENV_SERVER_URL.into() });
        }
        let policy = &self.reconnect;
        if policy.max_attempts == 0 {
            return Err(ConfigError::Policy("reconnect max attempts must be at least 1".into()));
        }
        if policy.base_delay.is_zero() {
            return Err(ConfigError::Policy("reconnect base delay must be positive".into()));
        }
        if policy.base_delay > policy.max_delay {
            return Err(ConfigError::Policy(format!(
                "reconnect base delay {}ms exceeds max delay {}ms",
                policy.base_delay.as_millis(),
                policy.max_delay.as_millis()
            )));
        }
        if !(0.0..1.0).contains(&policy.jitter) {
            return Err(ConfigError::Policy(format!("reconnect jitter {} outside [0, 1)", policy.jitter)));
        }
        for (name, value) in [
            ("command timeout", self.command_timeout),
            ("handshake timeout", self.handshake_timeout),
            ("sweep interval", self.sweep_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Policy(format!("{name} must be positive")));
            }
        }
        if self.keepalive.as_ref().is_some_and(|k| k.interval.is_zero()) {
            return Err(ConfigError::Policy("keepalive interval must be positive".into()));
        }
        Ok(())
    }
}

fn credential_source(get: &impl Fn(&str) -> Option<String>) -> Result<CredentialSource, ConfigError> {
    let username = get(ENV_USERNAME);
    let password = get(ENV_PASSWORD);

    if let Some(url) = get(ENV_TOKEN_URL) {
        let endpoint = TokenEndpoint::new(url);
        return Ok(CredentialSource::HttpToken(match (username, password) {
            (Some(user), Some(pass)) => endpoint.with_basic_auth(user, pass),
            _ => endpoint,
        }));
    }
    if let Some(token) = get(ENV_TOKEN) {
        return Ok(CredentialSource::StaticToken(token));
    }
    if let Some(password) = password {
        return Ok(CredentialSource::Password { username: username.unwrap_or_default(), password });
    }
    Err(ConfigError::Missing { var: ENV_TOKEN.into() })
}

fn env_parse<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|_| ConfigError::Invalid { var: key.into(), value: raw }),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
