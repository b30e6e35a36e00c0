//! Connection and pool configuration.
//!
//! A [`PgConfig`] is usually deserialized from the application settings and then
//! overridden by a connection URL read from the environment:
//!
//! ```ignore
//! let config = PgConfig::default().dbname("app").max_size(8);
//! let resolved = config.resolve(&ProcessEnv, DEFAULT_PG_URL_ENV_NAME)?;
//! ```

use crate::error::{PgError, PgResult};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Environment variable holding the connection URL unless told otherwise.
pub const DEFAULT_PG_URL_ENV_NAME: &str = "PG_URL";

/// How an idle connection is checked before being handed out again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recycling {
    /// Only check that the connection is not closed.
    #[default]
    Fast,
    /// Run an empty statement on it.
    Verified,
}

/// Static connection settings plus pool tuning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PgConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub dbname: Option<String>,
    pub application_name: Option<String>,
    /// Command-line options sent to the server at connection start.
    pub options: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub max_size: usize,
    /// How long a call may wait for a free connection.
    pub wait_timeout_ms: Option<u64>,
    /// How long opening a new connection may take.
    pub create_timeout_ms: Option<u64>,
    pub recycling: Recycling,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            user: None,
            password: None,
            dbname: None,
            application_name: None,
            options: None,
            connect_timeout_secs: None,
            max_size: 16,
            wait_timeout_ms: None,
            create_timeout_ms: None,
            recycling: Recycling::Fast,
        }
    }
}

impl PgConfig {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn dbname(mut self, dbname: impl Into<String>) -> Self {
        self.dbname = Some(dbname.into());
        self
    }

    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout_ms = Some(duration_ms(timeout));
        self
    }

    pub fn create_timeout(mut self, timeout: Duration) -> Self {
        self.create_timeout_ms = Some(duration_ms(timeout));
        self
    }

    pub fn recycling(mut self, recycling: Recycling) -> Self {
        self.recycling = recycling;
        self
    }

    /// Override fields with those present in the URL held by `url_env_name`.
    ///
    /// An unset or empty variable leaves the configuration untouched. Fields the
    /// URL does not mention keep their configured value.
    pub fn resolve(self, env: &impl EnvSource, url_env_name: &str) -> PgResult<Self> {
        match env.var(url_env_name).filter(|url| !url.trim().is_empty()) {
            Some(url) => self.merge_url(&url),
            None => Ok(self),
        }
    }

    /// Override fields with those present in a connection string (URL or
    /// `key=value` form).
    pub fn merge_url(mut self, url: &str) -> PgResult<Self> {
        let parsed: tokio_postgres::Config = url
            .parse()
            .map_err(|e: tokio_postgres::Error| PgError::Config(e.to_string()))?;

        if let Some(host) = parsed.get_hosts().first() {
            self.host = Some(host_to_string(host));
        }
        if let Some(port) = explicit_port(url, &parsed) {
            self.port = Some(port);
        }
        if let Some(user) = parsed.get_user() {
            self.user = Some(user.to_owned());
        }
        if let Some(password) = parsed.get_password() {
            self.password = Some(String::from_utf8_lossy(password).into_owned());
        }
        if let Some(dbname) = parsed.get_dbname() {
            self.dbname = Some(dbname.to_owned());
        }
        if let Some(name) = parsed.get_application_name() {
            self.application_name = Some(name.to_owned());
        }
        if let Some(options) = parsed.get_options() {
            self.options = Some(options.to_owned());
        }
        if let Some(timeout) = parsed.get_connect_timeout() {
            self.connect_timeout_secs = Some(timeout.as_secs());
        }
        Ok(self)
    }

    /// Driver configuration for opening connections.
    pub fn connect_config(&self) -> PgResult<tokio_postgres::Config> {
        if self.max_size == 0 {
            return Err(PgError::Config("max_size must be at least 1".into()));
        }

        let mut config = tokio_postgres::Config::new();
        config.host(self.host.as_deref().unwrap_or("localhost"));
        config.port(self.port.unwrap_or(5432));
        if let Some(user) = &self.user {
            config.user(user);
        }
        if let Some(password) = &self.password {
            config.password(password);
        }
        if let Some(dbname) = &self.dbname {
            config.dbname(dbname);
        }
        if let Some(name) = &self.application_name {
            config.application_name(name);
        }
        if let Some(options) = &self.options {
            config.options(options);
        }
        if let Some(secs) = self.connect_timeout_secs {
            config.connect_timeout(Duration::from_secs(secs));
        }
        Ok(config)
    }

    pub(crate) fn wait_timeout_duration(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }

    pub(crate) fn create_timeout_duration(&self) -> Option<Duration> {
        self.create_timeout_ms.map(Duration::from_millis)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// The port the connection string actually names.
///
/// The driver fills in 5432 for URL hosts without one, so URLs are read again
/// to tell a default from an explicit port.
fn explicit_port(conn_str: &str, parsed: &tokio_postgres::Config) -> Option<u16> {
    if conn_str.starts_with("postgres://") || conn_str.starts_with("postgresql://") {
        url::Url::parse(conn_str).ok()?.port()
    } else {
        parsed.get_ports().first().copied()
    }
}

fn host_to_string(host: &tokio_postgres::config::Host) -> String {
    match host {
        tokio_postgres::config::Host::Tcp(name) => name.clone(),
        #[cfg(unix)]
        tokio_postgres::config::Host::Unix(path) => path.to_string_lossy().into_owned(),
    }
}

/// Where environment variables are read from.
pub trait EnvSource {
    fn var(&self, name: &str) -> Option<String>;
}

/// The process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

impl EnvSource for BTreeMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

impl<E: EnvSource + ?Sized> EnvSource for &E {
    fn var(&self, name: &str) -> Option<String> {
        (**self).var(name)
    }
}

#[cfg(test)]
mod tests;
