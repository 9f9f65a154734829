//! Configuration loading and parsing

use anyhow::{bail, Context, Result};
use insn_annotation::{AnnotationEntry, AnnotationRegistry, AnnotationsConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

/// Main application configuration (loaded from annotations.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub annotations: BTreeMap<String, AnnotationEntry>,
    #[serde(default)]
    pub callbacks: CallbacksConfig,
    #[serde(default)]
    pub kvs: KvsConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CallbacksConfig {
    #[serde(default)]
    pub simple: Vec<SimpleCallbackConfig>,
}

/// Declarative callback bound to an annotation or return callback name
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimpleCallbackConfig {
    pub name: String,
    pub action: CallbackAction,
    pub message: Option<String>,
    /// Only act on the child branch of an annotation fork
    #[serde(default)]
    pub only_child: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackAction {
    Log,
    Terminate,
    Skip,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KvsConfig {
    /// Share fork de-duplication keys between states
    #[serde(default = "default_kvs_enabled")]
    pub enabled: bool,
}

impl Default for KvsConfig {
    fn default() -> Self {
        Self {
            enabled: default_kvs_enabled(),
        }
    }
}

fn default_kvs_enabled() -> bool {
    true
}

impl AppConfig {
    /// Build the annotation registry from the `[annotations.*]` entries
    pub fn build_registry(&self) -> Result<AnnotationRegistry> {
        let annotations = AnnotationsConfig {
            annotations: self.annotations.clone(),
        };
        annotations
            .build_registry()
            .context("Invalid annotation configuration")
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for callback in &self.callbacks.simple {
            if !names.insert(callback.name.as_str()) {
                bail!("Callback '{}' is declared more than once", callback.name);
            }
        }
        Ok(())
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    config
        .validate()
        .with_context(|| format!("Invalid config file: {:?}", path))?;

    Ok(config)
}
