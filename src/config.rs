// SPDX-License-Identifier: MIT OR Apache-2.0

//! Experiment configuration.
//!
//! [`PatchingConfig`] controls how the clean and corrupted datasets are
//! generated and how patched runs are scored. Every field has a default,
//! so a config file only lists what it changes:
//!
//! ```
//! use path_patching::{MetricDirection, PatchingConfig};
//!
//! let config = PatchingConfig::from_json_str(r#"{"n_prompts": 50, "direction": "denoising"}"#).unwrap();
//! assert_eq!(config.n_prompts, 50);
//! assert_eq!(config.seed, 42);
//! assert_eq!(config.direction, MetricDirection::Denoising);
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::{PatchError, Result};
use crate::metric::MetricDirection;

/// Default corruption: replace every name with fresh ones.
const DEFAULT_FLIP: &str = "ABB->XYZ, BAB->XYZ";

/// Settings for a clean/corrupted patching experiment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PatchingConfig {
    /// Number of prompts in each dataset.
    pub n_prompts: usize,
    /// Seed passed to the dataset generator.
    pub seed: u64,
    /// Whether prompts start with a BOS token.
    pub prepend_bos: bool,
    /// Template family the generator samples from (e.g. `"mixed"`).
    pub prompt_type: String,
    /// Corruption applied to the clean dataset, in the generator's syntax.
    pub flip: String,
    /// Calibration direction of the metric.
    pub direction: MetricDirection,
    /// Log baseline logit differences at `info` instead of `debug`.
    pub verbose: bool,
}

impl Default for PatchingConfig {
    fn default() -> Self {
        Self {
            n_prompts: 100,
            seed: 42,
            prepend_bos: false,
            prompt_type: "mixed".to_string(),
            flip: DEFAULT_FLIP.to_string(),
            direction: MetricDirection::Noising,
            verbose: false,
        }
    }
}

impl PatchingConfig {
    /// Parse and validate a config from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::Config`] on malformed JSON, unknown fields, or
    /// a failed [`validate`](Self::validate).
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| PatchError::Config(format!("parse patching config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a config file.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::Io`] if the file cannot be read, or
    /// [`PatchError::Config`] if it cannot be parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check field values.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::Config`] if `n_prompts` is zero or `flip` is blank.
    pub fn validate(&self) -> Result<()> {
        if self.n_prompts == 0 {
            return Err(PatchError::Config("n_prompts must be at least 1".into()));
        }
        if self.flip.trim().is_empty() {
            return Err(PatchError::Config("flip must not be empty".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_object_gives_defaults() {
        let config = PatchingConfig::from_json_str("{}").unwrap();
        assert_eq!(config, PatchingConfig::default());
        assert_eq!(config.flip, "ABB->XYZ, BAB->XYZ");
        assert_eq!(config.direction, MetricDirection::Noising);
    }

    #[test]
    fn full_config_parses() {
        let doc = json!({
            "n_prompts": 8,
            "seed": 7,
            "prepend_bos": true,
            "prompt_type": "BABA",
            "flip": "IO->S",
            "direction": "denoising",
            "verbose": true
        });
        let config = PatchingConfig::from_json_str(&doc.to_string()).unwrap();
        assert_eq!(config.n_prompts, 8);
        assert_eq!(config.seed, 7);
        assert!(config.prepend_bos);
        assert_eq!(config.prompt_type, "BABA");
        assert_eq!(config.flip, "IO->S");
        assert_eq!(config.direction, MetricDirection::Denoising);
        assert!(config.verbose);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(matches!(
            PatchingConfig::from_json_str(r#"{"n_prompts": 0}"#),
            Err(PatchError::Config(_))
        ));
        assert!(PatchingConfig::from_json_str(r#"{"flip": "  "}"#).is_err());
        assert!(PatchingConfig::from_json_str(r#"{"n_prompt": 3}"#).is_err());
        assert!(PatchingConfig::from_json_str(r#"{"direction": "sideways"}"#).is_err());
        assert!(PatchingConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = PatchingConfig::from_file("/nonexistent/patching.json").unwrap_err();
        assert!(matches!(err, PatchError::Io(ref e) if e.kind() == std::io::ErrorKind::NotFound));
    }

    #[test]
    fn config_file_roundtrip() {
        let path = std::env::temp_dir().join(format!("path-patching-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"n_prompts": 4, "verbose": true}"#).unwrap();
        let config = PatchingConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.n_prompts, 4);
        assert!(config.verbose);
    }
}
