// Copyright (c) The disttest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration for workers and the controller.
//!
//! Configuration is layered, lowest priority first:
//!
//! 1. the embedded [`DistConfig::DEFAULT_CONFIG`];
//! 2. an optional TOML file;
//! 3. environment variables prefixed with `DISTTEST_`, with `__` separating
//!    table names from keys (e.g. `DISTTEST_WORKER__ACK_TIMEOUT=5s`).

use crate::{
    errors::{ConfigParseError, ConfigParseErrorKind},
    output::LOG_ENV_VAR,
};
use camino::Utf8Path;
use config::{Config, ConfigBuilder, ConfigError, File, FileFormat, builder::DefaultState};
use serde::Deserialize;
use std::{collections::BTreeSet, ffi::OsString, time::Duration};
use tracing::{debug, warn};

/// Resolved disttest configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DistConfig {
    /// Worker-side settings.
    pub worker: WorkerConfig,

    /// Controller-side settings.
    pub controller: ControllerConfig,
}

/// Worker-side settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
    /// How long to wait for outstanding acknowledgments once a test has
    /// finished.
    pub ack_timeout: Duration,

    /// Capacity of the channel between the test thread and the frame writer.
    /// Always at least 1.
    pub event_buffer: usize,

    /// Rendered error text is truncated to this many bytes.
    pub max_error_text_bytes: usize,
}

/// Controller-side settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// How long to wait for a worker to finish one test. `None` waits until
    /// the connection closes.
    pub run_timeout: Option<Duration>,

    /// The class name given to failures whose class isn't known.
    pub placeholder_error_class: String,

    /// Extra class names to treat as known.
    pub known_error_classes: Vec<String>,
}

impl DistConfig {
    /// The default configuration, embedded at build time.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../default-config.toml");

    /// The prefix for environment variable overrides.
    pub const ENV_PREFIX: &'static str = "DISTTEST";

    /// Returns the embedded default configuration, with no file or
    /// environment overrides applied.
    pub fn default_config() -> Self {
        let builder = Self::make_default_config();
        let (config, unknown) = Self::build_and_deserialize_config(&builder)
            .expect("embedded default config is valid");
        debug_assert!(unknown.is_empty(), "default config has unknown keys: {unknown:?}");
        config.into_config()
    }

    /// Loads configuration from the embedded defaults, `config_file` if
    /// given, and the process environment.
    ///
    /// Unknown keys are logged as warnings.
    pub fn from_sources(config_file: Option<&Utf8Path>) -> Result<Self, ConfigParseError> {
        Self::from_sources_impl(config_file, None, &mut DefaultConfigWarnings)
    }

    fn from_sources_impl(
        config_file: Option<&Utf8Path>,
        env: Option<Vec<(String, String)>>,
        warnings: &mut impl ConfigWarnings,
    ) -> Result<Self, ConfigParseError> {
        let make_error =
            |kind| ConfigParseError::new(config_file.map(ToOwned::to_owned), kind);

        let mut builder = Self::make_default_config();
        if let Some(config_file) = config_file {
            debug!("disttest config: loading from {config_file}");
            builder = builder.add_source(File::new(config_file.as_str(), FileFormat::Toml));
        }
        let env = env.unwrap_or_else(|| utf8_vars(std::env::vars_os()));
        builder = Self::add_env_overrides(builder, env)
            .map_err(|error| make_error(ConfigParseErrorKind::BuildError(Box::new(error))))?;

        let (config, unknown) = Self::build_and_deserialize_config(&builder).map_err(make_error)?;
        if !unknown.is_empty() {
            warnings.unknown_config_keys(config_file, &unknown);
        }

        Ok(config.into_config())
    }

    /// Applies `DISTTEST_`-prefixed variables on top of `builder`.
    ///
    /// `DISTTEST_WORKER__ACK_TIMEOUT` becomes `worker.ack-timeout`. List-valued
    /// keys are split on commas. [`LOG_ENV_VAR`] shares the prefix but is not
    /// a configuration key.
    fn add_env_overrides(
        mut builder: ConfigBuilder<DefaultState>,
        env: impl IntoIterator<Item = (String, String)>,
    ) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        let prefix = format!("{}_", Self::ENV_PREFIX);
        for (name, value) in env {
            if name == LOG_ENV_VAR {
                continue;
            }
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            let key = rest
                .to_ascii_lowercase()
                .split("__")
                .map(|segment| segment.replace('_', "-"))
                .collect::<Vec<_>>()
                .join(".");
            debug!("disttest config: {key} overridden by environment variable {name}");
            builder = if Self::LIST_KEYS.contains(&key.as_str()) {
                let items: Vec<String> = value
                    .split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(ToOwned::to_owned)
                    .collect();
                builder.set_override(key, items)?
            } else {
                builder.set_override(key, value)?
            };
        }
        Ok(builder)
    }

    const LIST_KEYS: &'static [&'static str] = &["controller.known-error-classes"];

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    fn build_and_deserialize_config(
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<(DeserializedConfig, BTreeSet<String>), ConfigParseErrorKind> {
        let config = builder
            .build_cloned()
            .map_err(|error| ConfigParseErrorKind::BuildError(Box::new(error)))?;

        let mut ignored = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            ignored.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let config: DeserializedConfig =
            serde_path_to_error::deserialize(ignored_de).map_err(|error| {
                // The path is tracked by serde_path_to_error, so drop the key
                // the config crate attaches.
                let path = error.path().clone();
                let error = match error.into_inner() {
                    ConfigError::At { error, .. } => *error,
                    other => other,
                };
                ConfigParseErrorKind::DeserializeError(Box::new(serde_path_to_error::Error::new(
                    path, error,
                )))
            })?;

        Ok((config, ignored))
    }
}

/// Collects environment variables, skipping any whose name or value isn't
/// UTF-8.
fn utf8_vars(vars: impl IntoIterator<Item = (OsString, OsString)>) -> Vec<(String, String)> {
    vars.into_iter()
        .filter_map(|(name, value)| Some((name.into_string().ok()?, value.into_string().ok()?)))
        .collect()
}

/// Handles warnings produced while loading configuration.
trait ConfigWarnings {
    fn unknown_config_keys(&mut self, config_file: Option<&Utf8Path>, unknown: &BTreeSet<String>);
}

struct DefaultConfigWarnings;

impl ConfigWarnings for DefaultConfigWarnings {
    fn unknown_config_keys(&mut self, config_file: Option<&Utf8Path>, unknown: &BTreeSet<String>) {
        let location = match config_file {
            Some(config_file) => format!("config file {config_file} or environment"),
            None => "environment".to_owned(),
        };
        let mut unknown_str = String::new();
        if unknown.len() == 1 {
            unknown_str.push_str("key: ");
            unknown_str.extend(unknown.iter().map(String::as_str));
        } else {
            unknown_str.push_str("keys:");
            for key in unknown {
                unknown_str.push_str("\n  - ");
                unknown_str.push_str(key);
            }
        }

        warn!("in {location}, ignoring unknown configuration {unknown_str}");
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct DeserializedConfig {
    worker: DeserializedWorkerConfig,
    controller: DeserializedControllerConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct DeserializedWorkerConfig {
    #[serde(with = "humantime_serde")]
    ack_timeout: Duration,
    event_buffer: usize,
    max_error_text_bytes: usize,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct DeserializedControllerConfig {
    #[serde(with = "humantime_serde")]
    run_timeout: Duration,
    placeholder_error_class: String,
    known_error_classes: Vec<String>,
}

impl DeserializedConfig {
    fn into_config(self) -> DistConfig {
        let Self { worker, controller } = self;
        DistConfig {
            worker: WorkerConfig {
                ack_timeout: worker.ack_timeout,
                event_buffer: worker.event_buffer.max(1),
                max_error_text_bytes: worker.max_error_text_bytes,
            },
            controller: ControllerConfig {
                run_timeout: (!controller.run_timeout.is_zero()).then_some(controller.run_timeout),
                placeholder_error_class: controller.placeholder_error_class,
                known_error_classes: controller.known_error_classes,
            },
        }
    }
}
