//! Engine configuration.
//!
//! Loaded with the `config` crate from an optional file, then from
//! environment variables prefixed `KLIKKFLOW__` (e.g.
//! `KLIKKFLOW__DEFAULT_MAX_ITERATIONS=500`).

use serde::Deserialize;
use std::path::Path;

/// Tunables for the engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    /// Iteration cap for loops that do not set `maxIterations`.
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: u32,

    /// Branch limit for parallel containers that do not set `concurrency`.
    /// Unbounded when absent.
    #[serde(default)]
    pub default_concurrency: Option<usize>,

    /// Save a checkpoint after every top-level node, not only at the end.
    #[serde(default = "default_checkpoint_each_node")]
    pub checkpoint_each_node: bool,
}

fn default_max_iterations() -> u32 {
    1_000
}

fn default_checkpoint_each_node() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_iterations: default_max_iterations(),
            default_concurrency: None,
            checkpoint_each_node: default_checkpoint_each_node(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but malformed.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::load(None)
    }

    /// Loads configuration from `file` (any format the `config` crate
    /// recognises by extension), overridden by environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a value is malformed.
    pub fn load(file: Option<&Path>) -> Result<Self, config::ConfigError> {
        Self::load_with(file, environment())
    }

    fn load_with(
        file: Option<&Path>,
        env: config::Environment,
    ) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }
        builder.add_source(env).build()?.try_deserialize()
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("KLIKKFLOW")
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        environment().source(Some(map))
    }

    #[test]
    fn defaults_without_sources() {
        let config = EngineConfig::load_with(None, env(&[])).expect("config");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.default_max_iterations, 1_000);
    }

    #[test]
    fn environment_overrides() {
        let config = EngineConfig::load_with(
            None,
            env(&[
                ("KLIKKFLOW__DEFAULT_MAX_ITERATIONS", "25"),
                ("KLIKKFLOW__DEFAULT_CONCURRENCY", "4"),
                ("KLIKKFLOW__CHECKPOINT_EACH_NODE", "false"),
            ]),
        )
        .expect("config");
        assert_eq!(config.default_max_iterations, 25);
        assert_eq!(config.default_concurrency, Some(4));
        assert!(!config.checkpoint_each_node);
    }

    #[test]
    fn file_then_environment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"default_max_iterations": 7, "default_concurrency": 2}"#)
            .expect("write");

        let config = EngineConfig::load_with(
            Some(&path),
            env(&[("KLIKKFLOW__DEFAULT_CONCURRENCY", "8")]),
        )
        .expect("config");
        assert_eq!(config.default_max_iterations, 7);
        assert_eq!(config.default_concurrency, Some(8));
    }

    #[test]
    fn malformed_value_is_an_error() {
        let result =
            EngineConfig::load_with(None, env(&[("KLIKKFLOW__DEFAULT_MAX_ITERATIONS", "lots")]));
        assert!(result.is_err());
    }
}
