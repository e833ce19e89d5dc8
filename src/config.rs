use crate::model::ModelLayout;
use anyhow::{Context, Result};
use log::warn;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct VisorConfig {
    #[serde(default)]
    pub layout: ModelLayout,
    #[serde(default = "VisorConfig::default_log_filter")]
    pub log_filter: String,
    #[serde(default = "VisorConfig::default_intercept")]
    pub intercept: bool,
}

#[derive(Debug, Clone, Default)]
pub struct VisorConfigOverrides {
    pub log_filter: Option<String>,
    pub visor_flag: Option<u8>,
    pub intercept: Option<bool>,
}

impl VisorConfig {
    fn default_log_filter() -> String {
        "info".to_string()
    }

    const fn default_intercept() -> bool {
        true
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg: Self = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        cfg.layout.validate().with_context(|| format!("Invalid layout in config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!("Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &VisorConfigOverrides) {
        if let Some(filter) = &overrides.log_filter {
            self.log_filter = filter.clone();
        }
        if let Some(flag) = overrides.visor_flag {
            self.layout.visor_flag = flag;
        }
        if let Some(intercept) = overrides.intercept {
            self.intercept = intercept;
        }
    }
}

impl Default for VisorConfig {
    fn default() -> Self {
        Self {
            layout: ModelLayout::default(),
            log_filter: Self::default_log_filter(),
            intercept: Self::default_intercept(),
        }
    }
}

impl VisorConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.log_filter.is_none() && self.visor_flag.is_none() && self.intercept.is_none()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.log_filter.is_some() {
            fields.push("log_filter");
        }
        if self.visor_flag.is_some() {
            fields.push("visor_flag");
        }
        if self.intercept.is_some() {
            fields.push("intercept");
        }
        fields
    }
}
