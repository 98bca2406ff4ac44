// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use duration_str::deserialize_duration;
use serde::{Deserialize, Deserializer};

use crate::common::MAX_TIMEOUT;
use crate::context::PropagateFlags;
use crate::error::ConfigError;

pub trait Configuration {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate the component configuration
    fn validate(&self) -> Result<(), Self::Error>;
}

fn deserialize_optional_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|value| duration_str::parse(&value).map_err(serde::de::Error::custom))
        .transpose()
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    /// incoming timeouts above this value are clamped
    #[serde(
        default = "default_max_timeout",
        deserialize_with = "deserialize_duration"
    )]
    max_timeout: Duration,

    /// the time given to in-flight calls to terminate on shutdown
    #[serde(
        default = "default_drain_timeout",
        deserialize_with = "deserialize_duration"
    )]
    drain_timeout: Duration,

    /// the timeout applied to calls that carry none
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    default_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_timeout: default_max_timeout(),
            drain_timeout: default_drain_timeout(),
            default_timeout: None,
        }
    }
}

fn default_max_timeout() -> Duration {
    MAX_TIMEOUT
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(10)
}

impl ServerConfig {
    pub fn new() -> Self {
        ServerConfig::default()
    }

    pub fn with_max_timeout(self, max_timeout: Duration) -> Self {
        ServerConfig {
            max_timeout,
            ..self
        }
    }

    pub fn with_drain_timeout(self, drain_timeout: Duration) -> Self {
        ServerConfig {
            drain_timeout,
            ..self
        }
    }

    pub fn with_default_timeout(self, default_timeout: Option<Duration>) -> Self {
        ServerConfig {
            default_timeout,
            ..self
        }
    }

    pub fn max_timeout(&self) -> Duration {
        self.max_timeout
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }
}

impl Configuration for ServerConfig {
    type Error = ConfigError;

    fn validate(&self) -> Result<(), Self::Error> {
        if self.max_timeout.is_zero() {
            return Err(ConfigError::Invalid("max_timeout must be positive".to_string()));
        }
        if self.max_timeout > MAX_TIMEOUT {
            return Err(ConfigError::Invalid(format!(
                "max_timeout must not exceed {}s",
                MAX_TIMEOUT.as_secs()
            )));
        }
        if self.drain_timeout.is_zero() {
            return Err(ConfigError::Invalid("drain_timeout must be positive".to_string()));
        }
        if matches!(self.default_timeout, Some(timeout) if timeout > self.max_timeout) {
            return Err(ConfigError::Invalid(
                "default_timeout must not exceed max_timeout".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ChannelConfig {
    /// the timeout applied to calls opened without one
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    default_timeout: Option<Duration>,

    /// what child calls inherit from a parent call by default
    #[serde(default)]
    propagate: PropagateFlags,
}

impl ChannelConfig {
    pub fn new() -> Self {
        ChannelConfig::default()
    }

    pub fn with_default_timeout(self, default_timeout: Option<Duration>) -> Self {
        ChannelConfig {
            default_timeout,
            ..self
        }
    }

    pub fn with_propagate(self, propagate: PropagateFlags) -> Self {
        ChannelConfig { propagate, ..self }
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    pub fn propagate(&self) -> PropagateFlags {
        self.propagate
    }
}

impl Configuration for ChannelConfig {
    type Error = ConfigError;

    fn validate(&self) -> Result<(), Self::Error> {
        match self.default_timeout {
            Some(timeout) if timeout > MAX_TIMEOUT => Err(ConfigError::Invalid(format!(
                "default_timeout must not exceed {}s",
                MAX_TIMEOUT.as_secs()
            ))),
            _ => Ok(()),
        }
    }
}
