use crate::core::{DacError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Transaction isolation, by its wire number `0..=7`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum IsolationLevel {
    /// Whatever the database uses by default.
    Default,
    ReadUncommitted,
    #[default]
    ReadCommitted,
    WriteCommitted,
    RepeatableRead,
    Snapshot,
    Serializable,
    Linearizable,
}

impl IsolationLevel {
    /// `SET TRANSACTION ISOLATION LEVEL` keyword, `None` for levels the
    /// database picks itself.
    pub fn as_sql(&self) -> Option<&'static str> {
        match self {
            Self::ReadUncommitted => Some("READ UNCOMMITTED"),
            Self::ReadCommitted => Some("READ COMMITTED"),
            Self::RepeatableRead => Some("REPEATABLE READ"),
            Self::Serializable => Some("SERIALIZABLE"),
            _ => None,
        }
    }
}

impl TryFrom<u8> for IsolationLevel {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Default,
            1 => Self::ReadUncommitted,
            2 => Self::ReadCommitted,
            3 => Self::WriteCommitted,
            4 => Self::RepeatableRead,
            5 => Self::Snapshot,
            6 => Self::Serializable,
            7 => Self::Linearizable,
            other => return Err(format!("isolation level {} is out of range 0..=7", other)),
        })
    }
}

impl From<IsolationLevel> for u8 {
    fn from(level: IsolationLevel) -> Self {
        level as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Kind {
    #[default]
    Standalone,
    MasterSlave,
    Cluster,
}

/// Prepared-statement cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Statements {
    pub enable: bool,
    pub cache_size: usize,
    pub evict_timeout_seconds: u64,
}

impl Default for Statements {
    fn default() -> Self {
        Self {
            enable: false,
            cache_size: 256,
            evict_timeout_seconds: 10,
        }
    }
}

impl Statements {
    pub fn evict_timeout(&self) -> Duration {
        Duration::from_secs(self.evict_timeout_seconds)
    }
}

/// Driver and pool settings shared by every backend kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
    pub driver: String,
    /// Standalone handle.
    pub dsn: String,
    pub master: String,
    pub slavers: Vec<String>,
    /// Cluster handles.
    pub dsn_list: Vec<String>,
    pub max_idles: usize,
    /// 0 means unlimited.
    pub max_opens: usize,
    /// Seconds; 0 disables idle eviction.
    pub max_idle_time: u64,
    /// Seconds; 0 disables lifetime eviction.
    pub max_lifetime: u64,
    /// Milliseconds to wait for a pooled connection.
    pub acquire_timeout: u64,
    pub statements: Statements,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            driver: String::new(),
            dsn: String::new(),
            master: String::new(),
            slavers: Vec::new(),
            dsn_list: Vec::new(),
            max_idles: 2,
            max_opens: 0,
            max_idle_time: 0,
            max_lifetime: 0,
            acquire_timeout: 30_000,
            statements: Statements::default(),
        }
    }
}

impl Options {
    pub fn max_idle_time(&self) -> Option<Duration> {
        (self.max_idle_time > 0).then(|| Duration::from_secs(self.max_idle_time))
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        (self.max_lifetime > 0).then(|| Duration::from_secs(self.max_lifetime))
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout)
    }
}

/// Database configuration.
///
/// ```json
/// {
///   "kind": "masterSlave",
///   "dialect": "mysql",
///   "isolation": 2,
///   "transactionMaxAge": 10,
///   "options": {
///     "driver": "mysql",
///     "master": "root@tcp(db-0)/app",
///     "slavers": ["root@tcp(db-1)/app"],
///     "statements": { "enable": true, "cacheSize": 512 }
///   }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub kind: Kind,
    pub dialect: String,
    /// Endpoint name the service functions are exposed under.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub isolation: IsolationLevel,
    /// Seconds a transaction may live before it is reaped.
    #[serde(default = "default_max_age")]
    pub transaction_max_age: u64,
    #[serde(default)]
    pub options: Options,
}

fn default_endpoint() -> String {
    "sql".to_string()
}

fn default_max_age() -> u64 {
    10
}

impl Config {
    /// Standalone configuration over a single DSN.
    pub fn new(dialect: &str, driver: &str, dsn: &str) -> Self {
        Self {
            kind: Kind::Standalone,
            dialect: dialect.to_string(),
            endpoint: default_endpoint(),
            isolation: IsolationLevel::default(),
            transaction_max_age: default_max_age(),
            options: Options {
                driver: driver.to_string(),
                dsn: dsn.to_string(),
                ..Options::default()
            },
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(text)
            .map_err(|err| DacError::ConfigInvalid(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Switch to a master/slave layout.
    pub fn master_slave<S: Into<String>>(mut self, master: &str, slavers: impl IntoIterator<Item = S>) -> Self {
        self.kind = Kind::MasterSlave;
        self.options.master = master.to_string();
        self.options.slavers = slavers.into_iter().map(Into::into).collect();
        self
    }

    /// Switch to a cluster of equivalent handles.
    pub fn cluster<S: Into<String>>(mut self, dsn_list: impl IntoIterator<Item = S>) -> Self {
        self.kind = Kind::Cluster;
        self.options.dsn_list = dsn_list.into_iter().map(Into::into).collect();
        self
    }

    pub fn endpoint(mut self, name: &str) -> Self {
        self.endpoint = name.to_string();
        self
    }

    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = level;
        self
    }

    pub fn transaction_max_age(mut self, age: Duration) -> Self {
        self.transaction_max_age = age.as_secs();
        self
    }

    pub fn max_opens(mut self, max: usize) -> Self {
        self.options.max_opens = max;
        self
    }

    pub fn max_idles(mut self, max: usize) -> Self {
        self.options.max_idles = max;
        self
    }

    pub fn max_idle_time(mut self, time: Duration) -> Self {
        self.options.max_idle_time = time.as_secs();
        self
    }

    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.options.max_lifetime = lifetime.as_secs();
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.options.acquire_timeout = timeout.as_millis() as u64;
        self
    }

    /// Enables the prepared-statement cache.
    pub fn statements(mut self, cache_size: usize, evict_timeout: Duration) -> Self {
        self.options.statements = Statements {
            enable: true,
            cache_size,
            evict_timeout_seconds: evict_timeout.as_secs(),
        };
        self
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.transaction_max_age)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Err(DacError::ConfigInvalid(reason.to_string()));

        if self.dialect.is_empty() {
            return invalid("dialect is required");
        }
        crate::dialect::lookup(&self.dialect)?;
        if self.endpoint.is_empty() {
            return invalid("endpoint name cannot be empty");
        }
        if self.transaction_max_age == 0 {
            return invalid("transactionMaxAge must be > 0");
        }
        if self.options.driver.is_empty() {
            return invalid("options.driver is required");
        }
        match self.kind {
            Kind::Standalone if self.options.dsn.is_empty() => {
                return invalid("standalone requires options.dsn");
            }
            Kind::MasterSlave if self.options.master.is_empty() => {
                return invalid("masterSlave requires options.master");
            }
            Kind::MasterSlave if self.options.slavers.is_empty() => {
                return invalid("masterSlave requires at least one of options.slavers");
            }
            Kind::Cluster if self.options.dsn_list.is_empty() => {
                return invalid("cluster requires options.dsnList");
            }
            _ => {}
        }
        if self.options.max_opens > 0 && self.options.max_idles > self.options.max_opens {
            return invalid("maxIdles cannot exceed maxOpens");
        }
        if self.options.statements.enable && self.options.statements.cache_size == 0 {
            return invalid("statements.cacheSize must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_json(
            r#"{"dialect": "postgres", "options": {"driver": "pg", "dsn": "postgres://db"}}"#,
        )
        .unwrap();
        assert_eq!(config.kind, Kind::Standalone);
        assert_eq!(config.endpoint, "sql");
        assert_eq!(config.isolation, IsolationLevel::ReadCommitted);
        assert_eq!(config.max_age(), Duration::from_secs(10));
        assert!(!config.options.statements.enable);
        assert_eq!(config.options.statements.cache_size, 256);
        assert_eq!(config.options.max_idle_time(), None);
    }

    #[test]
    fn test_master_slave_json() {
        let config = Config::from_json(
            r#"{
                "kind": "masterSlave",
                "dialect": "mysql",
                "isolation": 6,
                "transactionMaxAge": 3,
                "options": {
                    "driver": "mysql",
                    "master": "m",
                    "slavers": ["s1", "s2"],
                    "maxIdleTime": 60,
                    "statements": {"enable": true, "cacheSize": 8, "evictTimeoutSeconds": 2}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.kind, Kind::MasterSlave);
        assert_eq!(config.isolation, IsolationLevel::Serializable);
        assert_eq!(config.options.slavers.len(), 2);
        assert_eq!(config.options.max_idle_time(), Some(Duration::from_secs(60)));
        assert_eq!(config.options.statements.evict_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_validate() {
        let base = Config::new("mysql", "mysql", "dsn");
        assert!(base.validate().is_ok());

        let invalid = [
            Config::new("oracle", "x", "dsn"),
            Config::new("mysql", "", "dsn"),
            Config::new("mysql", "mysql", ""),
            Config::new("mysql", "mysql", "dsn").master_slave("m", Vec::<String>::new()),
            Config::new("mysql", "mysql", "dsn").cluster(Vec::<String>::new()),
            Config::new("mysql", "mysql", "dsn").transaction_max_age(Duration::ZERO),
            Config::new("mysql", "mysql", "dsn").max_opens(1).max_idles(4),
            Config::new("mysql", "mysql", "dsn").statements(0, Duration::from_secs(1)),
        ];
        for config in invalid {
            assert_eq!(config.validate().unwrap_err().code(), "ConfigInvalid", "{:?}", config);
        }
    }

    #[test]
    fn test_isolation_range() {
        assert!(Config::from_json(
            r#"{"dialect": "mysql", "isolation": 8, "options": {"driver": "d", "dsn": "x"}}"#
        )
        .is_err());
        assert_eq!(IsolationLevel::try_from(4).unwrap(), IsolationLevel::RepeatableRead);
        assert_eq!(u8::from(IsolationLevel::Linearizable), 7);
    }
}
