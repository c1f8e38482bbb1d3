// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process configuration.
//!
//! Values are layered, lowest priority first: built-in defaults, the YAML file, then `SLOG_`
//! prefixed environment variables (`SLOG_DB_HOST`, `SLOG_MAIL_BATCH_SIZE`, ...). A missing YAML
//! file is not an error.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use chrono::TimeDelta;
use chrono_tz::Tz;
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::Deserialize;

use crate::batch_writer::{TimeSettings, DEFAULT_MAIL_OFFSET_SECS};
use crate::classifier::DEFAULT_WEB_TAG;
use crate::clickhouse::ClickHouseConfig;
use crate::errors::ConfigError;
use crate::snmp_lookup::SnmpNameLookup;

pub const DEFAULT_CONFIG_PATH: &str = "syslog-shipper.yaml";
pub const ENV_PREFIX: &str = "SLOG_";

const MAX_COMPRESSION_LEVEL: i32 = 22;
/// Mail timestamps are corrected by at most one day either way.
const MAX_MAIL_OFFSET_SECS: i64 = 24 * 3600;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Directive usable in a `tracing_subscriber::EnvFilter`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_host: String,
    pub db_name: String,
    pub db_user: String,
    pub db_pass: String,
    pub directory_server: Option<String>,
    pub listen_address: String,
    pub queue_capacity: usize,
    pub web_tag: String,
    pub switch_batch_size: usize,
    pub web_batch_size: usize,
    pub mail_batch_size: usize,
    pub flush_interval_secs: u64,
    pub timezone: String,
    pub mail_timestamp_offset_secs: i64,
    pub snmp_community: String,
    pub snmp_retries: u32,
    pub snmp_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub compression_level: i32,
    pub log_level: LogLevel,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_host: "http://127.0.0.1:8123".to_string(),
            db_name: "default".to_string(),
            db_user: "default".to_string(),
            db_pass: String::new(),
            directory_server: None,
            listen_address: "0.0.0.0:514".to_string(),
            queue_capacity: 1000,
            web_tag: DEFAULT_WEB_TAG.to_string(),
            switch_batch_size: 1000,
            web_batch_size: 1000,
            mail_batch_size: 100,
            flush_interval_secs: 10,
            timezone: "Europe/Saratov".to_string(),
            mail_timestamp_offset_secs: DEFAULT_MAIL_OFFSET_SECS,
            snmp_community: "public".to_string(),
            snmp_retries: 2,
            snmp_timeout_secs: 2,
            request_timeout_secs: 10,
            compression_level: 0,
            log_level: LogLevel::Info,
        }
    }
}

impl Config {
    /// Loads and validates the configuration from `path` and the environment. A missing file
    /// contributes nothing.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let config: Config = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("queue_capacity", self.queue_capacity),
            ("switch_batch_size", self.switch_batch_size),
            ("web_batch_size", self.web_batch_size),
            ("mail_batch_size", self.mail_batch_size),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{key} must be positive")));
            }
        }
        if self.snmp_timeout_secs == 0 || self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".to_string()));
        }
        if !(0..=MAX_COMPRESSION_LEVEL).contains(&self.compression_level) {
            return Err(ConfigError::Invalid(format!(
                "compression_level must be between 0 and {MAX_COMPRESSION_LEVEL}"
            )));
        }
        if !(-MAX_MAIL_OFFSET_SECS..=MAX_MAIL_OFFSET_SECS)
            .contains(&self.mail_timestamp_offset_secs)
        {
            return Err(ConfigError::Invalid(format!(
                "mail_timestamp_offset_secs must be between -{MAX_MAIL_OFFSET_SECS} and {MAX_MAIL_OFFSET_SECS}"
            )));
        }
        reqwest::Url::parse(&self.db_host)
            .map_err(|e| ConfigError::Invalid(format!("db_host {:?}: {e}", self.db_host)))?;
        if let Some(directory) = self.directory_server() {
            reqwest::Url::parse(directory).map_err(|e| {
                ConfigError::Invalid(format!("directory_server {directory:?}: {e}"))
            })?;
        }
        self.listen_address.parse::<SocketAddr>().map_err(|e| {
            ConfigError::Invalid(format!("listen_address {:?}: {e}", self.listen_address))
        })?;
        self.timezone()?;
        Ok(())
    }

    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::Invalid(format!("unknown timezone {:?}", self.timezone)))
    }

    pub fn time_settings(&self) -> Result<TimeSettings, ConfigError> {
        let mail_offset = TimeDelta::try_seconds(self.mail_timestamp_offset_secs).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "mail_timestamp_offset_secs {} is out of range",
                self.mail_timestamp_offset_secs
            ))
        })?;
        Ok(TimeSettings {
            timezone: self.timezone()?,
            mail_offset,
        })
    }

    /// The directory address, with an empty value meaning none.
    #[must_use]
    pub fn directory_server(&self) -> Option<&str> {
        self.directory_server.as_deref().filter(|s| !s.is_empty())
    }

    #[must_use]
    pub fn flush_interval(&self) -> Option<Duration> {
        (self.flush_interval_secs > 0).then(|| Duration::from_secs(self.flush_interval_secs))
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn clickhouse(&self) -> ClickHouseConfig {
        ClickHouseConfig {
            url: self.db_host.clone(),
            database: self.db_name.clone(),
            user: self.db_user.clone(),
            password: self.db_pass.clone(),
            timeout: self.request_timeout(),
            compression_level: self.compression_level,
        }
    }

    #[must_use]
    pub fn snmp_lookup(&self) -> SnmpNameLookup {
        SnmpNameLookup::new(
            self.snmp_community.clone(),
            self.snmp_retries,
            Duration::from_secs(self.snmp_timeout_secs),
        )
    }
}
