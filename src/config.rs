//! Run configuration: serde-backed, loadable from a JSON file and
//! overridable from the command line.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of pipeline stages, one worker process each.
    pub stages: usize,
    /// Micro-batches per training step; must divide `batch_size`.
    pub micro_batches: usize,
    /// Full-batch row count.
    pub batch_size: usize,
    /// Layer widths, input first. `dims.len() - 1` dense layers.
    pub dims: Vec<usize>,
    /// Training steps to run.
    pub steps: usize,
    pub learning_rate: f64,
    /// Host every rank binds and dials on.
    pub master_addr: String,
    /// Rank r listens on `base_port + r`.
    pub base_port: u16,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: 2,
            micro_batches: 2,
            batch_size: 8,
            dims: vec![8, 16, 16, 4],
            steps: 10,
            learning_rate: 0.05,
            master_addr: "127.0.0.1".to_string(),
            base_port: 29500,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| PipelineError::Configuration(format!("bad config file {path:?}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| PipelineError::Configuration(format!("config not serializable: {e}")))?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.stages == 0 {
            return Err(PipelineError::Configuration("stages must be at least 1".into()));
        }
        if self.micro_batches == 0 {
            return Err(PipelineError::Configuration(
                "micro_batches must be at least 1".into(),
            ));
        }
        if self.batch_size == 0 || self.batch_size % self.micro_batches != 0 {
            return Err(PipelineError::Configuration(format!(
                "batch_size {} must be a positive multiple of micro_batches {}",
                self.batch_size, self.micro_batches
            )));
        }
        if self.dims.len() < 2 {
            return Err(PipelineError::Configuration(
                "dims needs an input width and at least one layer width".into(),
            ));
        }
        let layer_count = self.dims.len() - 1;
        if layer_count < self.stages {
            return Err(PipelineError::Configuration(format!(
                "{layer_count} layers cannot fill {} stages",
                self.stages
            )));
        }
        if self.learning_rate <= 0.0 {
            return Err(PipelineError::Configuration(
                "learning_rate must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn layer_count(&self) -> usize {
        self.dims.len() - 1
    }

    pub fn output_dim(&self) -> usize {
        *self.dims.last().unwrap_or(&0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn uneven_micro_batch_split_is_rejected() {
        let config = PipelineConfig {
            batch_size: 7,
            micro_batches: 2,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn more_stages_than_layers_is_rejected() {
        let config = PipelineConfig {
            stages: 5,
            dims: vec![4, 4, 4],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn config_json_round_trips() {
        let config = PipelineConfig::default();
        let text = serde_json::to_string(&config).unwrap();
        let back: PipelineConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.dims, config.dims);
        assert_eq!(back.base_port, config.base_port);
    }
}
