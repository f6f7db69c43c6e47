use std::{borrow::Cow, time::Duration};

use crate::{Config, Result};

use super::Pool;

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(100);
const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Pool configuration builder.
pub struct PoolConfig {
    pub(crate) conn: Config,
    pub(crate) min_conn: usize,
    /// Soft limit: admission prefers to stay under this before bursting.
    pub(crate) max_conn: usize,
    /// Hard limit: never exceeded, bursts included.
    pub(crate) max_conn_hard: usize,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) keepalive: Option<KeepaliveConfig>,
    pub(crate) backoff: BackoffConfig,
}

/// Idle-connection health check behavior.
#[derive(Clone)]
pub struct KeepaliveConfig {
    pub(crate) frequency: Duration,
    pub(crate) query: Cow<'static, str>,
}

/// Exponential backoff applied between connection creation failures.
#[derive(Clone, Copy)]
pub struct BackoffConfig {
    pub(crate) base: Duration,
    pub(crate) cap: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { base: DEFAULT_BACKOFF_BASE, cap: DEFAULT_BACKOFF_CAP }
    }
}

impl PoolConfig {
    pub fn from_env() -> PoolConfig {
        Self {
            conn: Config::from_env(),
            min_conn: 0,
            max_conn: 10,
            max_conn_hard: 10,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            keepalive: None,
            backoff: BackoffConfig::default(),
        }
    }

    /// Get connection config.
    pub fn connection(&self) -> &Config {
        &self.conn
    }

    /// Connections the pool tries to always keep alive, even while idle.
    pub fn min_connection(mut self, value: usize) -> Self {
        self.min_conn = value;
        self
    }

    /// Soft cap on live connections; admission bursts past this, up to
    /// [`max_connection_hard`][Self::max_connection_hard], only when a
    /// waiter is already queued.
    pub fn max_connection(mut self, value: usize) -> Self {
        self.max_conn = value;
        if self.max_conn_hard < value {
            self.max_conn_hard = value;
        }
        self
    }

    /// Hard cap on live connections; never exceeded.
    pub fn max_connection_hard(mut self, value: usize) -> Self {
        self.max_conn_hard = value;
        self
    }

    /// How long an idle connection may sit unused before the pool closes it,
    /// as long as doing so keeps at least [`min_connection`][Self::min_connection] idle.
    ///
    /// `None` disables idle eviction entirely.
    pub fn idle_timeout(mut self, value: Option<Duration>) -> Self {
        self.idle_timeout = value;
        self
    }

    /// Periodically probe idle connections with a lightweight query.
    /// `None` (the default) disables keepalive probing.
    pub fn keepalive(mut self, frequency: Duration, query: impl Into<Cow<'static, str>>) -> Self {
        self.keepalive = Some(KeepaliveConfig { frequency, query: query.into() });
        self
    }

    /// Base and cap for the jittered exponential backoff applied between
    /// connection creation failures.
    pub fn backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff = BackoffConfig { base, cap };
        self
    }
}

impl PoolConfig {
    pub async fn connect(mut self, url: &str) -> Result<Pool> {
        let conn = Config::parse(url)?;
        self.conn = conn;
        Pool::connect_with(self).await
    }

    pub fn connect_lazy(mut self, url: &str) -> Result<Pool> {
        let conn = Config::parse(url)?;
        self.conn = conn;
        Ok(Pool::connect_lazy_with(self))
    }
}
