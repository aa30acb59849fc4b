// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Runtime configuration
//!
//! Values are resolved in order: built-in defaults, the JSON file named by
//! `SPACEY_COMMON_CONFIG`, then individual `SPACEY_COMMON_*` variables.

use crate::error::{CommonError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable naming a JSON configuration file
pub const CONFIG_FILE_ENV: &str = "SPACEY_COMMON_CONFIG";

/// Prefix for per-key environment overrides
pub const ENV_PREFIX: &str = "SPACEY_COMMON_";

/// Configuration shared by the streams, fs and socket modules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bytes requested from the platform per read
    pub block_size: usize,

    /// Buffered bytes at which a reader pump pauses
    pub high_water_mark: usize,

    /// Default charset for text streams
    pub charset: String,

    /// Default newline for text streams
    pub newline: String,

    /// Default `print` delimiter for text streams
    pub delimiter: String,

    /// Permission bits for files created by the fs module
    pub file_permissions: u32,

    /// Default socket connect timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: 8 * 1024,
            high_water_mark: 16 * 1024,
            charset: "utf-8".to_string(),
            newline: "\n".to_string(),
            delimiter: " ".to_string(),
            file_permissions: 0o644,
            connect_timeout_ms: None,
        }
    }
}

impl Config {
    /// Load configuration from the default locations.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var_os(CONFIG_FILE_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.load_from_env(std::env::vars())?;
        Ok(config)
    }

    /// Read a JSON configuration file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CommonError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SPACEY_COMMON_*` overrides from the given variables.
    pub fn load_from_env<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if key == CONFIG_FILE_ENV {
                continue;
            }
            if let Some(config_key) = key.strip_prefix(ENV_PREFIX) {
                let config_key = config_key.to_lowercase().replace('_', "-");
                self.set(&config_key, &value)?;
            }
        }
        self.validate()
    }

    /// Set a configuration value by its dashed key name.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "block-size" => self.block_size = parse_number(key, value)?,
            "high-water-mark" => self.high_water_mark = parse_number(key, value)?,
            "charset" => self.charset = value.to_string(),
            "newline" => self.newline = value.to_string(),
            "delimiter" => self.delimiter = value.to_string(),
            "file-permissions" => {
                self.file_permissions = u32::from_str_radix(value.trim_start_matches("0o"), 8)
                    .map_err(|_| {
                        CommonError::argument(format!("{} must be an octal mode: {}", key, value))
                    })?;
            }
            "connect-timeout-ms" => {
                self.connect_timeout_ms = if value.is_empty() {
                    None
                } else {
                    Some(parse_number(key, value)?)
                };
            }
            _ => {
                return Err(CommonError::argument(format!(
                    "unsupported configuration key: {}",
                    key
                )));
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(CommonError::Config("block-size must be positive".into()));
        }
        if self.high_water_mark == 0 {
            return Err(CommonError::Config("high-water-mark must be positive".into()));
        }
        if self.newline.is_empty() {
            return Err(CommonError::Config("newline must not be empty".into()));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| CommonError::argument(format!("{} must be a number: {}", key, value)))
}
