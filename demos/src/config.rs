// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0
//
// DemoConfig is read from a single yaml file with three optional sections:
// tracing, server and channel. Missing sections take their defaults, unknown
// top level keys are rejected.

use std::collections::HashSet;

use lazy_static::lazy_static;
use serde::Deserialize;
use serde_yaml::Value;
use thiserror::Error;
use tracing::debug;

use callway::{ChannelConfig, Configuration, ServerConfig};
use callway_tracing::TracingConfiguration;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid configuration - impossible to parse yaml")]
    InvalidYaml,
    #[error("invalid configuration - key {0} not valid")]
    InvalidKey(String),

    #[error("yaml parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("invalid {section} configuration: {source}")]
    Invalid {
        section: &'static str,
        source: callway::ConfigError,
    },
}

lazy_static! {
    static ref CONFIG_KEYS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        s.insert("tracing");
        s.insert("server");
        s.insert("channel");
        s
    };
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct DemoConfig {
    #[serde(default)]
    pub tracing: TracingConfiguration,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub channel: ChannelConfig,
}

impl DemoConfig {
    pub fn load(file_path: &str) -> Result<Self, ConfigError> {
        let config_str =
            std::fs::read_to_string(file_path).map_err(|e| ConfigError::NotFound(e.to_string()))?;
        Self::parse(&config_str)
    }

    pub fn parse(config_str: &str) -> Result<Self, ConfigError> {
        let root: Value = serde_yaml::from_str(config_str).map_err(|_| ConfigError::InvalidYaml)?;

        // an empty file is a valid, all-default configuration
        if root.is_null() {
            return Ok(DemoConfig::default());
        }

        let mapping = root.as_mapping().ok_or(ConfigError::InvalidYaml)?;
        for key in mapping.keys() {
            let k = key.as_str().ok_or(ConfigError::InvalidYaml)?;
            if !CONFIG_KEYS.contains(k) {
                return Err(ConfigError::InvalidKey(k.to_string()));
            }
        }

        let config: DemoConfig = serde_yaml::from_value(root)?;
        config
            .server
            .validate()
            .map_err(|source| ConfigError::Invalid {
                section: "server",
                source,
            })?;
        config
            .channel
            .validate()
            .map_err(|source| ConfigError::Invalid {
                section: "channel",
                source,
            })?;

        debug!(?config, "configuration loaded");
        Ok(config)
    }
}
