//! Layered configuration for Skein.
//!
//! Configuration is a stack of [`Layer`]s applied to the process
//! environment, lowest priority first: XDG `config.toml`, then the
//! project `.env`. A later layer overrides an earlier one, and a key
//! already present in the environment is never touched — the live
//! environment is always the top of the stack.
//!
//! [`load_and_apply`] returns a report of what was actually set and from
//! which layer, so startup logs can say where a value came from.
//! [`RuntimeSettings`] reads the typed knobs back out afterwards.

mod dotenv;
mod settings;
mod xdg_toml;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub use settings::RuntimeSettings;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// One configuration source and its key-value pairs.
pub struct Layer {
    /// Short source tag used in the applied report (`"xdg"`, `"dotenv"`).
    pub name: &'static str,
    pub values: HashMap<String, String>,
}

/// One environment variable set by [`apply_layers`], with the layer that
/// supplied its value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppliedVar {
    pub key: String,
    pub layer: &'static str,
}

/// Collects the configuration stack for `app_name`, lowest priority
/// first: `$XDG_CONFIG_HOME/<app_name>/config.toml` `[env]`, then `.env`
/// from `override_dir` (or the current directory).
pub fn load_layers(
    app_name: &str,
    override_dir: Option<&Path>,
) -> Result<Vec<Layer>, ConfigError> {
    Ok(vec![
        Layer {
            name: "xdg",
            values: xdg_toml::load_env_map(app_name)?,
        },
        Layer {
            name: "dotenv",
            values: dotenv::load_env_map(override_dir)?,
        },
    ])
}

/// Applies a layer stack to the process environment.
///
/// Within the stack a later layer wins; a key the process environment
/// already defines is left alone. Returns the variables actually set,
/// sorted by key so the report is stable.
pub fn apply_layers(layers: &[Layer]) -> Vec<AppliedVar> {
    let mut winners: HashMap<&str, (&str, &'static str)> = HashMap::new();
    for layer in layers {
        for (key, value) in &layer.values {
            winners.insert(key.as_str(), (value.as_str(), layer.name));
        }
    }

    let mut applied = Vec::new();
    for (key, (value, layer)) in winners {
        if std::env::var_os(key).is_some() {
            continue; // the live environment is the top of the stack
        }
        std::env::set_var(key, value);
        applied.push(AppliedVar {
            key: key.to_string(),
            layer,
        });
    }
    applied.sort_by(|a, b| a.key.cmp(&b.key));
    applied
}

/// Loads the stack for `app_name` and applies it in one step.
pub fn load_and_apply(
    app_name: &str,
    override_dir: Option<&Path>,
) -> Result<Vec<AppliedVar>, ConfigError> {
    let layers = load_layers(app_name, override_dir)?;
    Ok(apply_layers(&layers))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(name: &'static str, pairs: &[(&str, &str)]) -> Layer {
        Layer {
            name,
            values: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn later_layers_override_earlier_ones() {
        std::env::remove_var("SKEIN_CFG_LAYERED");
        let applied = apply_layers(&[
            layer("xdg", &[("SKEIN_CFG_LAYERED", "low")]),
            layer("dotenv", &[("SKEIN_CFG_LAYERED", "high")]),
        ]);
        assert_eq!(
            applied,
            vec![AppliedVar {
                key: "SKEIN_CFG_LAYERED".into(),
                layer: "dotenv",
            }]
        );
        assert_eq!(std::env::var("SKEIN_CFG_LAYERED").unwrap(), "high");
        std::env::remove_var("SKEIN_CFG_LAYERED");
    }

    #[test]
    fn live_environment_is_never_overwritten() {
        std::env::set_var("SKEIN_CFG_PINNED", "process");
        let applied = apply_layers(&[layer("dotenv", &[("SKEIN_CFG_PINNED", "file")])]);
        assert!(applied.is_empty());
        assert_eq!(std::env::var("SKEIN_CFG_PINNED").unwrap(), "process");
        std::env::remove_var("SKEIN_CFG_PINNED");
    }

    #[test]
    fn report_is_sorted_and_names_the_source_layer() {
        std::env::remove_var("SKEIN_CFG_B");
        std::env::remove_var("SKEIN_CFG_A");
        let applied = apply_layers(&[
            layer("xdg", &[("SKEIN_CFG_B", "2")]),
            layer("dotenv", &[("SKEIN_CFG_A", "1")]),
        ]);
        let keys: Vec<&str> = applied.iter().map(|a| a.key.as_str()).collect();
        assert_eq!(keys, vec!["SKEIN_CFG_A", "SKEIN_CFG_B"]);
        assert_eq!(applied[0].layer, "dotenv");
        assert_eq!(applied[1].layer, "xdg");
        std::env::remove_var("SKEIN_CFG_A");
        std::env::remove_var("SKEIN_CFG_B");
    }

    #[test]
    fn load_and_apply_reads_the_dotenv_layer() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "SKEIN_CFG_FROM_FILE=yes\n").unwrap();
        std::env::remove_var("SKEIN_CFG_FROM_FILE");

        let applied = load_and_apply("skein-test-nonexistent", Some(dir.path())).unwrap();
        assert!(applied
            .iter()
            .any(|a| a.key == "SKEIN_CFG_FROM_FILE" && a.layer == "dotenv"));
        assert_eq!(std::env::var("SKEIN_CFG_FROM_FILE").unwrap(), "yes");
        std::env::remove_var("SKEIN_CFG_FROM_FILE");
    }
}
