use std::path::Path;

use anyhow::{Context, Result};
use pump_core::{PipelineDefinition, TriggerDefinition};
use serde::Deserialize;

/// Contents of a pipeline definition file.
#[derive(Debug, Clone, Deserialize)]
pub struct PumpFile {
    /// Log filter used when neither `RUST_LOG` nor a flag overrides it.
    #[serde(default)]
    pub log_level: Option<String>,

    #[serde(default)]
    pub triggers: Vec<TriggerDefinition>,

    pub pipelines: Vec<PipelineDefinition>,
}

impl PumpFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Invalid definition file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let file: Self = toml::from_str(raw)?;
        if file.pipelines.is_empty() {
            anyhow::bail!("no pipelines declared");
        }
        Ok(file)
    }
}
